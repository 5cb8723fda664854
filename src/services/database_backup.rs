//! Database backup service.
//!
//! Snapshots the operational SQLite database with the online backup API.
//! The change sequence is the SQLite file-header change counter (big-endian
//! u32 at byte offset 24), which increments on every committed write
//! transaction. Incremental and differential backups record the counter
//! range they cover and chain to their parent execution; each artifact is a
//! consistent snapshot, so any database backup restores directly.

use crate::config::DatabaseConfig;
use crate::crypto::EncryptionKey;
use crate::error::{EngineError, Result};
use crate::models::manifest::{
    ArtifactDetail, ArtifactManifest, BackupManifest, DatabaseBackupKind, SensitivityClass,
    MANIFEST_FILE,
};
use crate::models::restore::ValidationOutcome;
use crate::models::BackupComponent;
use crate::services::artifact::{self, CpuPool};
use crate::services::ComponentBackup;
use chrono::{Duration, Utc};
use rusqlite::{Connection, OpenFlags};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const SNAPSHOT_BASE_NAME: &str = "database.sqlite3";
const CHANGE_COUNTER_OFFSET: u64 = 24;

#[derive(Debug, Clone)]
pub struct DatabaseBackupOptions {
    pub kind: DatabaseBackupKind,
    pub encrypt: bool,
    pub compress: bool,
    pub retention_days: i64,
    pub job_id: Option<String>,
    pub cancel: CancellationToken,
}

impl Default for DatabaseBackupOptions {
    fn default() -> Self {
        Self {
            kind: DatabaseBackupKind::Full,
            encrypt: true,
            compress: true,
            retention_days: 30,
            job_id: None,
            cancel: CancellationToken::new(),
        }
    }
}

pub struct DatabaseBackupService {
    cfg: DatabaseConfig,
    key: Option<EncryptionKey>,
    pool: CpuPool,
}

impl DatabaseBackupService {
    pub fn new(cfg: DatabaseConfig, key: Option<EncryptionKey>, pool: CpuPool) -> Self {
        Self { cfg, key, pool }
    }

    pub fn db_path(&self) -> &Path {
        &self.cfg.db_path
    }

    pub fn has_encryption_key(&self) -> bool {
        self.key.is_some()
    }

    /// Snapshot the database into an encrypted, checksummed artifact plus
    /// its manifest.
    pub async fn create_backup(&self, opts: DatabaseBackupOptions) -> Result<ComponentBackup> {
        if opts.cancel.is_cancelled() {
            return Err(EngineError::Storage("backup cancelled".into()));
        }
        if !self.cfg.db_path.exists() {
            return Err(EngineError::DependencyUnavailable(format!(
                "database not found at {}",
                self.cfg.db_path.display()
            )));
        }

        let backup_id = artifact::execution_id("db");
        let current_seq = read_change_counter(&self.cfg.db_path)?;

        // Resolve the parent reference; a missing one downgrades to full.
        let (kind, seq_from, parent_backup_id) = match opts.kind {
            DatabaseBackupKind::Full => (DatabaseBackupKind::Full, 0, None),
            DatabaseBackupKind::Incremental => match self.latest_backup(|_| true).await? {
                Some(prev) => {
                    let from = change_seq_to(&prev).unwrap_or(0);
                    (DatabaseBackupKind::Incremental, from, Some(prev.backup_id))
                }
                None => {
                    warn!(
                        backup_id = %backup_id,
                        "No prior backup to base an incremental on, falling back to full"
                    );
                    (DatabaseBackupKind::Full, 0, None)
                }
            },
            DatabaseBackupKind::Differential => {
                match self
                    .latest_backup(|m| {
                        matches!(
                            m.artifacts.first().map(|a| &a.detail),
                            Some(ArtifactDetail::Database {
                                kind: DatabaseBackupKind::Full,
                                ..
                            })
                        )
                    })
                    .await?
                {
                    Some(prev_full) => {
                        let from = change_seq_to(&prev_full).unwrap_or(0);
                        (
                            DatabaseBackupKind::Differential,
                            from,
                            Some(prev_full.backup_id),
                        )
                    }
                    None => {
                        warn!(
                            backup_id = %backup_id,
                            "No prior full backup to base a differential on, falling back to full"
                        );
                        (DatabaseBackupKind::Full, 0, None)
                    }
                }
            }
        };

        let execution_dir = self.cfg.backup_dir.join(&backup_id);
        let mut manifest = BackupManifest::new(&backup_id, opts.job_id.clone(), BackupComponent::Database);

        // Consistent snapshot into scratch space
        let scratch = execution_dir.join(format!(".{}.snapshot", Uuid::new_v4().simple()));
        std::fs::create_dir_all(&execution_dir)?;
        self.snapshot_to(&scratch).await?;

        if opts.cancel.is_cancelled() {
            let _ = std::fs::remove_dir_all(&execution_dir);
            return Err(EngineError::Storage("backup cancelled".into()));
        }

        let raw = tokio::fs::read(&scratch).await?;
        let _ = tokio::fs::remove_file(&scratch).await;

        let key = if opts.encrypt {
            match &self.key {
                Some(k) => Some(k.clone()),
                None => {
                    return Err(EngineError::Compliance(
                        "encryption requested but no key is configured".into(),
                    ))
                }
            }
        } else {
            None
        };
        let compress = opts.compress;
        let processed = self
            .pool
            .run(move || artifact::process(raw, compress, key.as_ref()))
            .await?;

        let file_name = artifact::artifact_file_name(SNAPSHOT_BASE_NAME, processed.flags);
        let artifact_path = execution_dir.join(&file_name);
        artifact::write_atomic(&artifact_path, &processed.bytes)?;

        manifest.push_artifact(ArtifactManifest {
            id: format!("{}-snapshot", backup_id),
            artifact_path: artifact_path.to_string_lossy().to_string(),
            size_bytes: processed.bytes.len() as u64,
            checksum: processed.checksum,
            compressed: processed.flags.compressed,
            encrypted: processed.flags.encrypted,
            sensitivity: SensitivityClass::Sensitive,
            retention_until: Utc::now() + Duration::days(opts.retention_days),
            created_at: Utc::now(),
            detail: ArtifactDetail::Database {
                kind,
                change_seq_from: seq_from,
                change_seq_to: current_seq,
                parent_backup_id,
            },
        });

        // The manifest write completes before the component reports success
        manifest.write_atomic(&execution_dir)?;

        info!(
            backup_id = %backup_id,
            kind = %kind,
            change_seq = current_seq,
            size_bytes = manifest.total_bytes,
            "Database backup completed"
        );

        Ok(ComponentBackup {
            backup_id,
            artifact_paths: manifest
                .artifacts
                .iter()
                .map(|a| a.artifact_path.clone())
                .collect(),
            total_bytes: manifest.total_bytes,
            manifest,
            success: true,
            error: None,
        })
    }

    /// Manifests of past executions, newest first.
    pub async fn list_backups(&self, limit: Option<usize>) -> Result<Vec<BackupManifest>> {
        let dir = self.cfg.backup_dir.clone();
        let mut manifests = tokio::task::spawn_blocking(move || read_manifest_dir(&dir))
            .await
            .map_err(|e| EngineError::Storage(format!("list task failed: {}", e)))??;
        manifests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            manifests.truncate(limit);
        }
        Ok(manifests)
    }

    pub async fn find_backup(&self, backup_id: &str) -> Result<Option<BackupManifest>> {
        let path = self.cfg.backup_dir.join(backup_id).join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(BackupManifest::read(&path)?))
    }

    /// Delete one execution directory (artifacts + manifest).
    pub async fn delete_backup(&self, backup_id: &str) -> Result<()> {
        let dir = self.cfg.backup_dir.join(backup_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    async fn latest_backup(
        &self,
        filter: impl Fn(&BackupManifest) -> bool,
    ) -> Result<Option<BackupManifest>> {
        Ok(self
            .list_backups(None)
            .await?
            .into_iter()
            .find(|m| !m.artifacts.is_empty() && filter(m)))
    }

    async fn snapshot_to(&self, dest: &Path) -> Result<()> {
        let src_path = self.cfg.db_path.clone();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let src = Connection::open_with_flags(&src_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
            let mut dst = Connection::open(&dest)?;
            let backup = rusqlite::backup::Backup::new(&src, &mut dst)?;
            backup.run_to_completion(64, std::time::Duration::from_millis(25), None)?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Storage(format!("snapshot task failed: {}", e)))?
    }

    /// Decode an artifact back into a plain SQLite snapshot, verifying its
    /// checksum first. Returns the staged snapshot path.
    pub async fn stage_snapshot(
        &self,
        manifest: &BackupManifest,
        staging_dir: &Path,
    ) -> Result<PathBuf> {
        let record = manifest
            .artifacts
            .first()
            .ok_or_else(|| EngineError::Integrity(format!("backup '{}' has no artifact", manifest.backup_id)))?;

        let bytes = tokio::fs::read(&record.artifact_path).await?;
        let actual = crate::crypto::sha256_hex(&bytes);
        if actual != record.checksum {
            return Err(EngineError::Integrity(format!(
                "artifact '{}' checksum mismatch: expected {}, got {}",
                record.id, record.checksum, actual
            )));
        }

        let flags = artifact::ArtifactFlags {
            compressed: record.compressed,
            encrypted: record.encrypted,
        };
        let key = self.key.clone();
        let plain = self
            .pool
            .run(move || artifact::unprocess(bytes, flags, key.as_ref()))
            .await?;

        std::fs::create_dir_all(staging_dir)?;
        let staged = staging_dir.join(format!("{}.sqlite3", manifest.backup_id));
        artifact::write_atomic(&staged, &plain)?;
        Ok(staged)
    }

    /// Replace the live database with a staged snapshot. The swap is a
    /// rename, so readers see either the old or the new file, never a mix;
    /// stale WAL/SHM sidecars are dropped with it.
    pub async fn apply_snapshot(&self, staged: &Path) -> Result<()> {
        let db_path = self.cfg.db_path.clone();
        let staged = staged.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let tmp = db_path.with_extension("restore-tmp");
            std::fs::copy(&staged, &tmp)?;
            std::fs::rename(&tmp, &db_path)?;
            for suffix in ["-wal", "-shm"] {
                let sidecar = PathBuf::from(format!("{}{}", db_path.display(), suffix));
                let _ = std::fs::remove_file(sidecar);
            }
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Storage(format!("apply task failed: {}", e)))?
    }

    /// Structural and referential validation of the live database.
    pub async fn validate(&self) -> Result<Vec<ValidationOutcome>> {
        let db_path = self.cfg.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ValidationOutcome>> {
            let mut outcomes = Vec::new();
            let conn = match Connection::open_with_flags(&db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            {
                Ok(conn) => conn,
                Err(e) => {
                    outcomes.push(ValidationOutcome::fail(
                        "database_open",
                        format!("cannot open database: {}", e),
                    ));
                    return Ok(outcomes);
                }
            };

            let integrity: String =
                conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
            if integrity == "ok" {
                outcomes.push(ValidationOutcome::pass("database_integrity"));
            } else {
                outcomes.push(ValidationOutcome::fail("database_integrity", integrity));
            }

            let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
            let violations = stmt.query_map([], |row| row.get::<_, String>(0))?.count();
            if violations == 0 {
                outcomes.push(ValidationOutcome::pass("referential_consistency"));
            } else {
                outcomes.push(ValidationOutcome::fail(
                    "referential_consistency",
                    format!("{} orphaned foreign key reference(s)", violations),
                ));
            }

            Ok(outcomes)
        })
        .await
        .map_err(|e| EngineError::Storage(format!("validation task failed: {}", e)))?
    }

    /// WAL/SHM sidecars indicate connections may still be active.
    pub fn has_active_sidecars(&self) -> bool {
        ["-wal", "-shm"].iter().any(|suffix| {
            PathBuf::from(format!("{}{}", self.cfg.db_path.display(), suffix)).exists()
        })
    }
}

fn change_seq_to(manifest: &BackupManifest) -> Option<u64> {
    manifest.artifacts.first().and_then(|a| match &a.detail {
        ArtifactDetail::Database { change_seq_to, .. } => Some(*change_seq_to),
        _ => None,
    })
}

/// SQLite file change counter: big-endian u32 at byte offset 24 of the
/// database header, incremented on every committed write transaction.
pub fn read_change_counter(db_path: &Path) -> Result<u64> {
    let mut file = std::fs::File::open(db_path)?;
    let mut header = [0u8; 28];
    file.read_exact(&mut header).map_err(|_| {
        EngineError::Integrity(format!(
            "{} is too short to be a SQLite database",
            db_path.display()
        ))
    })?;
    let counter = u32::from_be_bytes([header[24], header[25], header[26], header[27]]);
    Ok(counter as u64)
}

fn read_manifest_dir(dir: &Path) -> Result<Vec<BackupManifest>> {
    let mut manifests = Vec::new();
    if !dir.exists() {
        return Ok(manifests);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let manifest_path = entry.path().join(MANIFEST_FILE);
        if !manifest_path.exists() {
            continue;
        }
        match BackupManifest::read(&manifest_path) {
            Ok(m) => manifests.push(m),
            Err(e) => warn!(path = %manifest_path.display(), "Skipping unreadable manifest: {}", e),
        }
    }
    Ok(manifests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed_database(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE patients (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE visits (
                 id INTEGER PRIMARY KEY,
                 patient_id INTEGER NOT NULL REFERENCES patients(id)
             );
             INSERT INTO patients (name) VALUES ('alpha'), ('beta');
             INSERT INTO visits (patient_id) VALUES (1), (2);",
        )
        .unwrap();
    }

    fn service(dir: &TempDir) -> DatabaseBackupService {
        let db_path = dir.path().join("service.db");
        seed_database(&db_path);
        DatabaseBackupService::new(
            DatabaseConfig {
                db_path,
                backup_dir: dir.path().join("backups"),
            },
            Some(EncryptionKey::generate()),
            CpuPool::new(2),
        )
    }

    #[test]
    fn test_change_counter_increments_on_write() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("service.db");
        seed_database(&db_path);

        let before = read_change_counter(&db_path).unwrap();
        let conn = Connection::open(&db_path).unwrap();
        conn.execute("INSERT INTO patients (name) VALUES ('gamma')", [])
            .unwrap();
        drop(conn);
        let after = read_change_counter(&db_path).unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_full_backup_produces_verifiable_artifact() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);

        let result = service
            .create_backup(DatabaseBackupOptions::default())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.artifact_paths.len(), 1);

        let record = &result.manifest.artifacts[0];
        assert!(record.encrypted);
        assert!(record.compressed);
        assert!(record.artifact_path.ends_with(".zst.enc"));

        let bytes = std::fs::read(&record.artifact_path).unwrap();
        assert_eq!(crate::crypto::sha256_hex(&bytes), record.checksum);
    }

    #[tokio::test]
    async fn test_incremental_without_prior_falls_back_to_full() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);

        let result = service
            .create_backup(DatabaseBackupOptions {
                kind: DatabaseBackupKind::Incremental,
                ..Default::default()
            })
            .await
            .unwrap();

        match &result.manifest.artifacts[0].detail {
            ArtifactDetail::Database { kind, parent_backup_id, .. } => {
                assert_eq!(*kind, DatabaseBackupKind::Full);
                assert!(parent_backup_id.is_none());
            }
            other => panic!("unexpected detail: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_incremental_records_sequence_range_and_parent() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);

        let full = service
            .create_backup(DatabaseBackupOptions::default())
            .await
            .unwrap();

        // Advance the change counter
        let conn = Connection::open(service.db_path()).unwrap();
        conn.execute("INSERT INTO patients (name) VALUES ('delta')", [])
            .unwrap();
        drop(conn);

        let incremental = service
            .create_backup(DatabaseBackupOptions {
                kind: DatabaseBackupKind::Incremental,
                ..Default::default()
            })
            .await
            .unwrap();

        match &incremental.manifest.artifacts[0].detail {
            ArtifactDetail::Database {
                kind,
                change_seq_from,
                change_seq_to,
                parent_backup_id,
            } => {
                assert_eq!(*kind, DatabaseBackupKind::Incremental);
                assert_eq!(parent_backup_id.as_deref(), Some(full.backup_id.as_str()));
                assert!(change_seq_to > change_seq_from);
            }
            other => panic!("unexpected detail: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_backup_restore_roundtrip() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);

        let backup = service
            .create_backup(DatabaseBackupOptions::default())
            .await
            .unwrap();

        // Mutate the live database after the backup
        let conn = Connection::open(service.db_path()).unwrap();
        conn.execute("DELETE FROM visits", []).unwrap();
        drop(conn);

        let staged = service
            .stage_snapshot(&backup.manifest, &dir.path().join("staging"))
            .await
            .unwrap();
        service.apply_snapshot(&staged).await.unwrap();

        let conn = Connection::open(service.db_path()).unwrap();
        let visits: i64 = conn
            .query_row("SELECT COUNT(*) FROM visits", [], |row| row.get(0))
            .unwrap();
        assert_eq!(visits, 2);

        let outcomes = service.validate().await.unwrap();
        assert!(outcomes.iter().all(|o| o.passed));
    }

    #[tokio::test]
    async fn test_stage_snapshot_detects_tampering() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);

        let backup = service
            .create_backup(DatabaseBackupOptions::default())
            .await
            .unwrap();

        let artifact_path = &backup.manifest.artifacts[0].artifact_path;
        let mut bytes = std::fs::read(artifact_path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        std::fs::write(artifact_path, &bytes).unwrap();

        assert!(matches!(
            service
                .stage_snapshot(&backup.manifest, &dir.path().join("staging"))
                .await,
            Err(EngineError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn test_list_backups_newest_first() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);

        let first = service
            .create_backup(DatabaseBackupOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let second = service
            .create_backup(DatabaseBackupOptions::default())
            .await
            .unwrap();

        let listed = service.list_backups(None).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].backup_id, second.backup_id);
        assert_eq!(listed[1].backup_id, first.backup_id);

        let limited = service.list_backups(Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
