//! Backup manifests.
//!
//! Each backup execution owns a directory (or provider key prefix) named by
//! its execution id and containing exactly one `manifest.json` plus the
//! artifact files. The manifest carries one record per artifact and the
//! per-item processed/error ledger; it is the unit returned by
//! `list_backups` and consumed by restore.

use crate::error::{EngineError, Result};
use crate::models::backup_job::BackupComponent;
use crate::storage::StorageProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MANIFEST_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "manifest.json";

/// Sensitivity classification of an artifact's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityClass {
    Standard,
    Sensitive,
    /// Content tied to a protected subject (e.g. a minor). Always encrypted,
    /// independent of the job's encryption flag.
    ProtectedSubject,
}

impl SensitivityClass {
    pub fn requires_encryption(&self) -> bool {
        matches!(
            self,
            SensitivityClass::Sensitive | SensitivityClass::ProtectedSubject
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseBackupKind {
    Full,
    Incremental,
    Differential,
}

impl std::fmt::Display for DatabaseBackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DatabaseBackupKind::Full => "full",
            DatabaseBackupKind::Incremental => "incremental",
            DatabaseBackupKind::Differential => "differential",
        };
        f.write_str(s)
    }
}

/// Logical file type, classified from the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Document,
    Image,
    Media,
    Data,
    Other,
}

impl FileKind {
    pub fn from_extension(ext: Option<&str>) -> Self {
        match ext.map(|e| e.to_ascii_lowercase()).as_deref() {
            Some("pdf" | "doc" | "docx" | "txt" | "md" | "odt" | "rtf") => FileKind::Document,
            Some("jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "tiff") => FileKind::Image,
            Some("mp3" | "mp4" | "wav" | "avi" | "mov" | "mkv" | "flac") => FileKind::Media,
            Some("csv" | "json" | "xml" | "sql" | "db" | "sqlite" | "parquet") => FileKind::Data,
            _ => FileKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigClass {
    Files,
    Secrets,
}

/// Component-specific manifest fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "component", rename_all = "snake_case")]
pub enum ArtifactDetail {
    Database {
        kind: DatabaseBackupKind,
        /// Change-sequence range `(from, to]` covered by this backup,
        /// relative to the parent; full backups record `(0, to]`.
        change_seq_from: u64,
        change_seq_to: u64,
        parent_backup_id: Option<String>,
    },
    File {
        source_path: String,
        file_kind: FileKind,
        provider: StorageProvider,
    },
    Config {
        class: ConfigClass,
        entry_count: usize,
    },
}

/// Description of one backup artifact, persisted beside it in the
/// execution manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub id: String,
    /// Filesystem path or provider key of the artifact
    pub artifact_path: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the final (compressed/encrypted) artifact bytes
    pub checksum: String,
    pub compressed: bool,
    pub encrypted: bool,
    pub sensitivity: SensitivityClass,
    pub retention_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub detail: ArtifactDetail,
}

/// Per-item failure recorded without failing the sibling artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemError {
    pub item: String,
    pub message: String,
}

/// The single manifest file of one backup execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: u32,
    pub backup_id: String,
    pub job_id: Option<String>,
    pub component: BackupComponent,
    pub created_at: DateTime<Utc>,
    pub artifacts: Vec<ArtifactManifest>,
    pub total_bytes: u64,
    /// Items handled, including failed ones
    pub processed: usize,
    pub errors: Vec<ItemError>,
}

impl BackupManifest {
    pub fn new(
        backup_id: impl Into<String>,
        job_id: Option<String>,
        component: BackupComponent,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            backup_id: backup_id.into(),
            job_id,
            component,
            created_at: Utc::now(),
            artifacts: Vec::new(),
            total_bytes: 0,
            processed: 0,
            errors: Vec::new(),
        }
    }

    pub fn push_artifact(&mut self, artifact: ArtifactManifest) {
        self.total_bytes += artifact.size_bytes;
        self.artifacts.push(artifact);
        self.processed += 1;
    }

    pub fn push_error(&mut self, item: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ItemError {
            item: item.into(),
            message: message.into(),
        });
        self.processed += 1;
    }

    /// True once every artifact of the execution is past its retention.
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.artifacts.is_empty() && self.artifacts.iter().all(|a| a.retention_until < now)
    }

    /// Basic well-formedness check used by restore pre-flight.
    pub fn check_well_formed(&self) -> Result<()> {
        if self.version != MANIFEST_VERSION {
            return Err(EngineError::Integrity(format!(
                "manifest '{}': unsupported version {}",
                self.backup_id, self.version
            )));
        }
        for artifact in &self.artifacts {
            if artifact.checksum.len() != 64 || !artifact.checksum.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(EngineError::Integrity(format!(
                    "manifest '{}': artifact '{}' has a malformed checksum",
                    self.backup_id, artifact.id
                )));
            }
            if artifact.artifact_path.is_empty() {
                return Err(EngineError::Integrity(format!(
                    "manifest '{}': artifact '{}' has no path",
                    self.backup_id, artifact.id
                )));
            }
        }
        Ok(())
    }

    /// Write the manifest beside its artifacts: temp file then rename, so a
    /// reader never observes a partial manifest.
    pub fn write_atomic(&self, dir: &Path) -> Result<std::path::PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(MANIFEST_FILE);
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        let manifest: BackupManifest = serde_json::from_slice(&content)
            .map_err(|e| EngineError::Integrity(format!("corrupted manifest at {}: {}", path.display(), e)))?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_artifact(retention_until: DateTime<Utc>) -> ArtifactManifest {
        ArtifactManifest {
            id: "a1".into(),
            artifact_path: "db-x/database.sqlite3.zst.enc".into(),
            size_bytes: 128,
            checksum: "0".repeat(64),
            compressed: true,
            encrypted: true,
            sensitivity: SensitivityClass::Sensitive,
            retention_until,
            created_at: Utc::now(),
            detail: ArtifactDetail::Database {
                kind: DatabaseBackupKind::Full,
                change_seq_from: 0,
                change_seq_to: 7,
                parent_backup_id: None,
            },
        }
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut manifest = BackupManifest::new("db-x", Some("daily".into()), BackupComponent::Database);
        manifest.push_artifact(sample_artifact(Utc::now() + Duration::days(30)));
        manifest.push_error("broken.bin", "permission denied");

        let path = manifest.write_atomic(dir.path()).unwrap();
        let back = BackupManifest::read(&path).unwrap();
        assert_eq!(back.backup_id, "db-x");
        assert_eq!(back.artifacts.len(), 1);
        assert_eq!(back.errors.len(), 1);
        assert_eq!(back.processed, 2);
        assert_eq!(back.total_bytes, 128);
        back.check_well_formed().unwrap();
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempfile::TempDir::new().unwrap();
        let manifest = BackupManifest::new("cfg-y", None, BackupComponent::Config);
        manifest.write_atomic(dir.path()).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![MANIFEST_FILE.to_string()]);
    }

    #[test]
    fn test_expired_at() {
        let now = Utc::now();
        let mut manifest = BackupManifest::new("db-x", None, BackupComponent::Database);
        assert!(!manifest.expired_at(now)); // no artifacts, nothing to expire

        manifest.push_artifact(sample_artifact(now - Duration::days(1)));
        assert!(manifest.expired_at(now));

        manifest.push_artifact(sample_artifact(now + Duration::days(1)));
        assert!(!manifest.expired_at(now));
    }

    #[test]
    fn test_malformed_checksum_rejected() {
        let mut manifest = BackupManifest::new("db-x", None, BackupComponent::Database);
        let mut artifact = sample_artifact(Utc::now());
        artifact.checksum = "zz".into();
        manifest.push_artifact(artifact);
        assert!(manifest.check_well_formed().is_err());
    }

    #[test]
    fn test_read_rejects_garbage() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            BackupManifest::read(&path),
            Err(crate::error::EngineError::Integrity(_))
        ));
    }

    #[test]
    fn test_file_kind_classification() {
        assert_eq!(FileKind::from_extension(Some("PDF")), FileKind::Document);
        assert_eq!(FileKind::from_extension(Some("png")), FileKind::Image);
        assert_eq!(FileKind::from_extension(Some("csv")), FileKind::Data);
        assert_eq!(FileKind::from_extension(None), FileKind::Other);
    }
}
