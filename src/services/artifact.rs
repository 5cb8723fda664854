//! Shared artifact pipeline.
//!
//! Every artifact passes through the same stages: optional zstd compression,
//! then optional AES-256-GCM encryption, then SHA-256 of the final bytes.
//! Compression must see plaintext, so it always runs first; ciphertext does
//! not compress. Filename suffixes are applied in the same fixed order.
//!
//! CPU-heavy stages run on a bounded blocking pool so hashing and
//! encryption never stall concurrent I/O-bound jobs.

use crate::crypto::{self, EncryptionKey};
use crate::error::{EngineError, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

pub const COMPRESSED_SUFFIX: &str = ".zst";
pub const ENCRYPTED_SUFFIX: &str = ".enc";

const ZSTD_LEVEL: i32 = 3;

/// Bounded pool for CPU-bound pipeline work.
#[derive(Clone)]
pub struct CpuPool {
    permits: Arc<Semaphore>,
}

impl CpuPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Run a CPU-bound closure on the blocking pool, gated by the worker
    /// budget.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Storage("cpu pool closed".into()))?;
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| EngineError::Storage(format!("cpu task failed: {}", e)))?
    }
}

/// Flags describing what the pipeline did to an artifact.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactFlags {
    pub compressed: bool,
    pub encrypted: bool,
}

/// A fully processed artifact, ready to write or upload.
#[derive(Debug)]
pub struct ProcessedArtifact {
    pub bytes: Vec<u8>,
    pub checksum: String,
    pub flags: ArtifactFlags,
}

/// Apply the pipeline stages in order. Synchronous; call through `CpuPool`.
pub fn process(
    data: Vec<u8>,
    compress: bool,
    key: Option<&EncryptionKey>,
) -> Result<ProcessedArtifact> {
    let mut bytes = data;

    if compress {
        bytes = zstd::stream::encode_all(&bytes[..], ZSTD_LEVEL)
            .map_err(|e| EngineError::Storage(format!("compression failed: {}", e)))?;
    }

    let encrypted = match key {
        Some(key) => {
            bytes = crypto::seal(key, &bytes)?;
            true
        }
        None => false,
    };

    let checksum = crypto::sha256_hex(&bytes);
    Ok(ProcessedArtifact {
        bytes,
        checksum,
        flags: ArtifactFlags {
            compressed: compress,
            encrypted,
        },
    })
}

/// Reverse the pipeline: decrypt first, then decompress.
pub fn unprocess(
    data: Vec<u8>,
    flags: ArtifactFlags,
    key: Option<&EncryptionKey>,
) -> Result<Vec<u8>> {
    let mut bytes = data;

    if flags.encrypted {
        let key = key.ok_or_else(|| {
            EngineError::Compliance("artifact is encrypted but no key is configured".into())
        })?;
        bytes = crypto::open(key, &bytes)?;
    }

    if flags.compressed {
        bytes = zstd::stream::decode_all(&bytes[..])
            .map_err(|e| EngineError::Integrity(format!("decompression failed: {}", e)))?;
    }

    Ok(bytes)
}

/// Artifact file name with suffixes in fixed order: compressed before
/// encrypted.
pub fn artifact_file_name(base: &str, flags: ArtifactFlags) -> String {
    let mut name = base.to_string();
    if flags.compressed {
        name.push_str(COMPRESSED_SUFFIX);
    }
    if flags.encrypted {
        name.push_str(ENCRYPTED_SUFFIX);
    }
    name
}

/// Recover the pipeline flags from an artifact path.
pub fn flags_from_name(name: &str) -> ArtifactFlags {
    let encrypted = name.ends_with(ENCRYPTED_SUFFIX);
    let stripped = name.strip_suffix(ENCRYPTED_SUFFIX).unwrap_or(name);
    let compressed = stripped.ends_with(COMPRESSED_SUFFIX);
    ArtifactFlags {
        compressed,
        encrypted,
    }
}

/// Write bytes to a temporary sibling and rename into place, owner-only
/// permissions. Readers never observe a partial artifact.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| EngineError::Storage(format!("no parent for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
    }

    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    ));
    std::fs::write(&tmp, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Execution identifier embedding the UTC start time, e.g.
/// `files-2026-08-07_14-03-21-9f3ac1d2`.
pub fn execution_id(component: &str) -> String {
    let stamp = Utc::now().format("%Y-%m-%d_%H-%M-%S");
    let short = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", component, stamp, &short[..8])
}

/// Staging path for assembling one execution before upload.
pub fn staging_dir(root: &Path, backup_id: &str) -> PathBuf {
    root.join(backup_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_unprocess_roundtrip() {
        let key = EncryptionKey::generate();
        let data = b"line one\nline two\nline two\nline two\n".to_vec();

        let artifact = process(data.clone(), true, Some(&key)).unwrap();
        assert!(artifact.flags.compressed);
        assert!(artifact.flags.encrypted);
        assert_eq!(artifact.checksum, crypto::sha256_hex(&artifact.bytes));

        let restored = unprocess(artifact.bytes, artifact.flags, Some(&key)).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_decrypt_then_decompress_is_the_only_working_order() {
        let key = EncryptionKey::generate();
        let data = vec![42u8; 4096];
        let artifact = process(data.clone(), true, Some(&key)).unwrap();

        // Correct order: decrypt, then decompress.
        let plaintext = crypto::open(&key, &artifact.bytes).unwrap();
        assert_eq!(zstd::stream::decode_all(&plaintext[..]).unwrap(), data);

        // Reverse order: the ciphertext is not a zstd frame.
        assert!(zstd::stream::decode_all(&artifact.bytes[..]).is_err());
    }

    #[test]
    fn test_compression_reduces_repetitive_payload() {
        let data = vec![7u8; 1 << 16];
        let artifact = process(data, true, None).unwrap();
        assert!(artifact.bytes.len() < 1 << 12);
    }

    #[test]
    fn test_suffix_order_fixed() {
        let flags = ArtifactFlags {
            compressed: true,
            encrypted: true,
        };
        assert_eq!(artifact_file_name("db.sqlite3", flags), "db.sqlite3.zst.enc");

        let parsed = flags_from_name("db.sqlite3.zst.enc");
        assert!(parsed.compressed && parsed.encrypted);

        let parsed = flags_from_name("db.sqlite3.zst");
        assert!(parsed.compressed && !parsed.encrypted);

        let parsed = flags_from_name("db.sqlite3");
        assert!(!parsed.compressed && !parsed.encrypted);
    }

    #[test]
    fn test_unprocess_requires_key_for_encrypted() {
        let key = EncryptionKey::generate();
        let artifact = process(b"secret".to_vec(), false, Some(&key)).unwrap();
        assert!(matches!(
            unprocess(artifact.bytes, artifact.flags, None),
            Err(EngineError::Compliance(_))
        ));
    }

    #[test]
    fn test_write_atomic_leaves_no_temp() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("artifact.bin");
        write_atomic(&path, b"payload").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");

        let siblings: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(siblings.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomic_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("artifact.bin");
        write_atomic(&path, b"x").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }

    #[tokio::test]
    async fn test_cpu_pool_runs_closures() {
        let pool = CpuPool::new(2);
        let result = pool.run(|| Ok::<_, crate::error::EngineError>(21 * 2)).await.unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn test_execution_id_shape() {
        let id = execution_id("db");
        assert!(id.starts_with("db-"));
        // component + date + time + short uuid
        assert_eq!(id.split('-').count(), 7);
    }
}
