//! Backup orchestration and restore engine.
//!
//! Schedules and executes multi-component backup jobs over a service's
//! operational state (database, files, configuration/secrets), producing
//! verifiable encrypted artifacts under a tiered retention policy, and
//! restores them safely with pre-flight checks, rollback snapshots and
//! post-restore validation. Scheduling (cron evaluation), metrics delivery
//! and secret-vault storage are external collaborators behind seams.

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod monitoring;
pub mod services;
pub mod storage;
pub mod vault;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::BackupEngine;
pub use error::EngineError;
pub use models::{
    BackupComponent, BackupJob, BackupResult, BackupStatus, BackupTier, RestoreRequest,
    RestoreResult, RestoreStatus, RestoreType,
};
pub use services::orchestrator::{BackupOrchestrator, StatusReport};
pub use services::restore::RestoreService;
pub type Result<T> = std::result::Result<T, EngineError>;
