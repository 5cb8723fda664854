//! Error taxonomy for the backup engine.
//!
//! Validation and dependency errors abort the whole job or request;
//! integrity, compliance and per-item errors are recorded in results and
//! never silently swallowed.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad job or request configuration. Aborts immediately, no side effects.
    #[error("validation error: {0}")]
    Validation(String),

    /// Storage, vault or external collaborator unreachable. Surfaced for
    /// caller-side retry, never retried internally.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Checksum mismatch or corrupted manifest.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Missing required encryption or an unencrypted sensitive artifact.
    #[error("compliance error: {0}")]
    Compliance(String),

    /// Explicitly unsupported operation (PITR, selective restore).
    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("encryption error: {0}")]
    Crypto(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// True for errors that must abort the whole job or request rather than
    /// being recorded as a per-item failure.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_) | EngineError::DependencyUnavailable(_)
        )
    }
}
