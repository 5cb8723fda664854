//! Configuration backup service.
//!
//! Captures configuration-like files, process environment entries matching
//! secret-name heuristics, and (when a vault collaborator is wired) all
//! vault entries. Secret-classified content is always encrypted, whatever
//! the job's global flag says.

use crate::config::ConfigBackupConfig;
use crate::crypto::EncryptionKey;
use crate::error::{EngineError, Result};
use crate::models::manifest::{
    ArtifactDetail, ArtifactManifest, BackupManifest, ConfigClass, SensitivityClass, MANIFEST_FILE,
};
use crate::models::restore::RestoredItem;
use crate::models::BackupComponent;
use crate::services::artifact::{self, CpuPool};
use crate::services::ComponentBackup;
use crate::vault::SecretVault;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

const ARCHIVE_VERSION: u32 = 1;
const FILES_BASE_NAME: &str = "config-files.json";
const SECRETS_BASE_NAME: &str = "secrets.json";
const RESTORED_SECRETS_FILE: &str = "secrets.env";

#[derive(Debug, Clone)]
pub struct ConfigBackupOptions {
    pub encrypt: bool,
    pub compress: bool,
    pub retention_days: i64,
    pub job_id: Option<String>,
    pub cancel: CancellationToken,
}

impl Default for ConfigBackupOptions {
    fn default() -> Self {
        Self {
            encrypt: true,
            compress: true,
            retention_days: 30,
            job_id: None,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EntryKind {
    File,
    Env,
    Vault,
}

/// One captured item: a config file, an environment variable or a vault
/// entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArchiveEntry {
    kind: EntryKind,
    /// Relative path for files, entry name for env/vault
    name: String,
    content_b64: String,
}

/// Versioned archive document; one per artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigArchive {
    version: u32,
    entries: Vec<ArchiveEntry>,
}

pub struct ConfigBackupService {
    cfg: ConfigBackupConfig,
    key: Option<EncryptionKey>,
    pool: CpuPool,
    vault: Option<Arc<dyn SecretVault>>,
}

impl ConfigBackupService {
    pub fn new(
        cfg: ConfigBackupConfig,
        key: Option<EncryptionKey>,
        pool: CpuPool,
        vault: Option<Arc<dyn SecretVault>>,
    ) -> Self {
        Self {
            cfg,
            key,
            pool,
            vault,
        }
    }

    pub fn has_encryption_key(&self) -> bool {
        self.key.is_some()
    }

    pub async fn create_backup(&self, opts: ConfigBackupOptions) -> Result<ComponentBackup> {
        if opts.cancel.is_cancelled() {
            return Err(EngineError::Storage("backup cancelled".into()));
        }

        let backup_id = artifact::execution_id("config");
        let mut manifest =
            BackupManifest::new(&backup_id, opts.job_id.clone(), BackupComponent::Config);
        let execution_dir = self.cfg.backup_dir.join(&backup_id);

        let mut plain_entries = Vec::new();
        let mut secret_entries = Vec::new();

        for (path, relative) in self.discover() {
            match std::fs::read(&path) {
                Ok(content) => {
                    let entry = ArchiveEntry {
                        kind: EntryKind::File,
                        name: relative,
                        content_b64: BASE64.encode(&content),
                    };
                    if self.is_secret_file(&path) {
                        secret_entries.push(entry);
                    } else {
                        plain_entries.push(entry);
                    }
                }
                Err(e) => {
                    warn!(file = %path.display(), "Config file skipped: {}", e);
                    manifest.push_error(path.to_string_lossy(), e.to_string());
                }
            }
        }

        if self.cfg.include_env {
            for (name, value) in std::env::vars() {
                if self.matches_secret_marker(&name) {
                    secret_entries.push(ArchiveEntry {
                        kind: EntryKind::Env,
                        name,
                        content_b64: BASE64.encode(value.as_bytes()),
                    });
                }
            }
        }

        if let Some(vault) = &self.vault {
            match vault.list_entries().await {
                Ok(entries) => {
                    for entry in entries {
                        secret_entries.push(ArchiveEntry {
                            kind: EntryKind::Vault,
                            name: entry.name,
                            content_b64: BASE64.encode(entry.value.as_bytes()),
                        });
                    }
                }
                Err(e) => {
                    return Err(EngineError::DependencyUnavailable(format!(
                        "secret vault unreachable: {}",
                        e
                    )))
                }
            }
        }

        if !plain_entries.is_empty() {
            let record = self
                .write_archive(
                    &backup_id,
                    &execution_dir,
                    FILES_BASE_NAME,
                    ConfigClass::Files,
                    SensitivityClass::Standard,
                    plain_entries,
                    opts.compress,
                    opts.encrypt,
                    opts.retention_days,
                )
                .await?;
            manifest.push_artifact(record);
        }

        if !secret_entries.is_empty() {
            if self.key.is_none() {
                return Err(EngineError::Compliance(
                    "secret-classified content requires encryption but no key is configured"
                        .into(),
                ));
            }
            // Secrets are encrypted regardless of the global flag
            let record = self
                .write_archive(
                    &backup_id,
                    &execution_dir,
                    SECRETS_BASE_NAME,
                    ConfigClass::Secrets,
                    SensitivityClass::Sensitive,
                    secret_entries,
                    opts.compress,
                    true,
                    opts.retention_days,
                )
                .await?;
            manifest.push_artifact(record);
        }

        manifest.write_atomic(&execution_dir)?;

        info!(
            backup_id = %backup_id,
            artifacts = manifest.artifacts.len(),
            errors = manifest.errors.len(),
            "Configuration backup completed"
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

    #[allow(clippy::too_many_arguments)]
    async fn write_archive(
        &self,
        backup_id: &str,
        execution_dir: &Path,
        base_name: &str,
        class: ConfigClass,
        sensitivity: SensitivityClass,
        entries: Vec<ArchiveEntry>,
        compress: bool,
        encrypt: bool,
        retention_days: i64,
    ) -> Result<ArtifactManifest> {
        let entry_count = entries.len();
        let archive = ConfigArchive {
            version: ARCHIVE_VERSION,
            entries,
        };
        let raw = serde_json::to_vec(&archive)?;

        let key = if encrypt {
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
        let processed = self
            .pool
            .run(move || artifact::process(raw, compress, key.as_ref()))
            .await?;

        let file_name = artifact::artifact_file_name(base_name, processed.flags);
        let artifact_path = execution_dir.join(&file_name);
        artifact::write_atomic(&artifact_path, &processed.bytes)?;

        Ok(ArtifactManifest {
            id: format!("{}-{}", backup_id, base_name),
            artifact_path: artifact_path.to_string_lossy().to_string(),
            size_bytes: processed.bytes.len() as u64,
            checksum: processed.checksum,
            compressed: processed.flags.compressed,
            encrypted: processed.flags.encrypted,
            sensitivity,
            retention_until: Utc::now() + Duration::days(retention_days),
            created_at: Utc::now(),
            detail: ArtifactDetail::Config { class, entry_count },
        })
    }

    /// Configuration-like files under the roots. Dotfiles are included
    /// here; `.env` files are exactly the point.
    fn discover(&self) -> Vec<(std::path::PathBuf, String)> {
        let mut found = Vec::new();
        for root in &self.cfg.roots {
            if !root.exists() {
                warn!(root = %root.display(), "Config root does not exist, skipping");
                continue;
            }
            for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                if !self.is_config_like(entry.path()) {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(root)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                found.push((entry.path().to_path_buf(), relative));
            }
        }
        found.sort_by(|a, b| a.1.cmp(&b.1));
        found
    }

    fn is_config_like(&self, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name == ".env" || name.ends_with(".env") {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                self.cfg
                    .config_extensions
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    fn is_secret_file(&self, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name == ".env" || name.ends_with(".env") {
            return true;
        }
        self.matches_secret_marker(&name)
    }

    fn matches_secret_marker(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.cfg.secret_markers.iter().any(|m| lower.contains(m))
    }

    /// Manifests of past executions, newest first.
    pub async fn list_backups(&self, limit: Option<usize>) -> Result<Vec<BackupManifest>> {
        let dir = self.cfg.backup_dir.clone();
        let mut manifests = tokio::task::spawn_blocking(move || -> Result<Vec<BackupManifest>> {
            let mut out = Vec::new();
            if !dir.exists() {
                return Ok(out);
            }
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let manifest_path = entry.path().join(MANIFEST_FILE);
                if !manifest_path.exists() {
                    continue;
                }
                match BackupManifest::read(&manifest_path) {
                    Ok(m) => out.push(m),
                    Err(e) => {
                        warn!(path = %manifest_path.display(), "Skipping unreadable manifest: {}", e)
                    }
                }
            }
            Ok(out)
        })
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

    pub async fn delete_backup(&self, backup_id: &str) -> Result<()> {
        let dir = self.cfg.backup_dir.join(backup_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Extract the archives of a backup into the target tree. File entries
    /// land at their original relative paths; env and vault entries are
    /// collected into an owner-only `secrets.env`.
    pub async fn restore_full(
        &self,
        manifest: &BackupManifest,
        target_dir: &Path,
    ) -> Result<Vec<RestoredItem>> {
        let mut restored = Vec::new();
        let mut secret_lines = Vec::new();

        for record in &manifest.artifacts {
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

            let archive: ConfigArchive = serde_json::from_slice(&plain).map_err(|e| {
                EngineError::Integrity(format!("artifact '{}' is not a config archive: {}", record.id, e))
            })?;
            if archive.version != ARCHIVE_VERSION {
                return Err(EngineError::Integrity(format!(
                    "config archive version {} is unsupported",
                    archive.version
                )));
            }

            for entry in archive.entries {
                let content = BASE64.decode(&entry.content_b64).map_err(|e| {
                    EngineError::Integrity(format!("entry '{}' is not valid base64: {}", entry.name, e))
                })?;
                match entry.kind {
                    EntryKind::File => {
                        let target = target_dir.join(&entry.name);
                        let size = content.len() as u64;
                        artifact::write_atomic(&target, &content)?;
                        restored.push(RestoredItem {
                            path: target.to_string_lossy().to_string(),
                            size_bytes: size,
                            dry_run: false,
                        });
                    }
                    EntryKind::Env | EntryKind::Vault => {
                        secret_lines
                            .push(format!("{}={}", entry.name, String::from_utf8_lossy(&content)));
                    }
                }
            }
        }

        if !secret_lines.is_empty() {
            secret_lines.sort();
            let target = target_dir.join(RESTORED_SECRETS_FILE);
            let payload = format!("{}\n", secret_lines.join("\n"));
            let size = payload.len() as u64;
            artifact::write_atomic(&target, payload.as_bytes())?;
            restored.push(RestoredItem {
                path: target.to_string_lossy().to_string(),
                size_bytes: size,
                dry_run: false,
            });
        }

        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::StaticVault;
    use tempfile::TempDir;

    fn service(dir: &TempDir, vault: Option<Arc<dyn SecretVault>>) -> ConfigBackupService {
        ConfigBackupService::new(
            ConfigBackupConfig {
                roots: vec![dir.path().join("etc")],
                backup_dir: dir.path().join("backups"),
                include_env: false,
                ..Default::default()
            },
            Some(EncryptionKey::generate()),
            CpuPool::new(2),
            vault,
        )
    }

    fn seed_configs(dir: &TempDir) {
        let etc = dir.path().join("etc");
        std::fs::create_dir_all(&etc).unwrap();
        std::fs::write(etc.join("app.toml"), b"[app]\nport = 8080\n").unwrap();
        std::fs::write(etc.join("api-token.json"), b"{\"token\":\"abc\"}").unwrap();
        std::fs::write(etc.join(".env"), b"DB_PASSWORD=hunter2\n").unwrap();
        std::fs::write(etc.join("readme.txt"), b"not config").unwrap();
    }

    #[tokio::test]
    async fn test_secret_and_plain_split() {
        let dir = TempDir::new().unwrap();
        seed_configs(&dir);
        let service = service(&dir, None);

        let result = service
            .create_backup(ConfigBackupOptions::default())
            .await
            .unwrap();

        assert_eq!(result.manifest.artifacts.len(), 2);
        let secrets = result
            .manifest
            .artifacts
            .iter()
            .find(|a| matches!(a.detail, ArtifactDetail::Config { class: ConfigClass::Secrets, .. }))
            .unwrap();
        let files = result
            .manifest
            .artifacts
            .iter()
            .find(|a| matches!(a.detail, ArtifactDetail::Config { class: ConfigClass::Files, .. }))
            .unwrap();

        // .env and api-token.json are secret; app.toml is not; readme.txt
        // is not configuration at all
        match (&secrets.detail, &files.detail) {
            (
                ArtifactDetail::Config { entry_count: s, .. },
                ArtifactDetail::Config { entry_count: f, .. },
            ) => {
                assert_eq!(*s, 2);
                assert_eq!(*f, 1);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_secrets_encrypted_even_with_flag_off() {
        let dir = TempDir::new().unwrap();
        seed_configs(&dir);
        let service = service(&dir, None);

        let result = service
            .create_backup(ConfigBackupOptions {
                encrypt: false,
                ..Default::default()
            })
            .await
            .unwrap();

        for record in &result.manifest.artifacts {
            match &record.detail {
                ArtifactDetail::Config { class: ConfigClass::Secrets, .. } => {
                    assert!(record.encrypted)
                }
                ArtifactDetail::Config { class: ConfigClass::Files, .. } => {
                    assert!(!record.encrypted)
                }
                _ => unreachable!(),
            }
        }
    }

    #[tokio::test]
    async fn test_secrets_without_key_fail_compliance() {
        let dir = TempDir::new().unwrap();
        seed_configs(&dir);
        let service = ConfigBackupService::new(
            ConfigBackupConfig {
                roots: vec![dir.path().join("etc")],
                backup_dir: dir.path().join("backups"),
                include_env: false,
                ..Default::default()
            },
            None,
            CpuPool::new(2),
            None,
        );

        assert!(matches!(
            service.create_backup(ConfigBackupOptions::default()).await,
            Err(EngineError::Compliance(_))
        ));
    }

    #[tokio::test]
    async fn test_vault_entries_captured_and_restored() {
        let dir = TempDir::new().unwrap();
        seed_configs(&dir);
        let vault: Arc<dyn SecretVault> = Arc::new(StaticVault::new([(
            "SIGNING_KEY".to_string(),
            "deadbeef".to_string(),
        )]));
        let service = service(&dir, Some(vault));

        let backup = service
            .create_backup(ConfigBackupOptions::default())
            .await
            .unwrap();

        let target = dir.path().join("restored");
        let restored = service.restore_full(&backup.manifest, &target).await.unwrap();
        assert!(restored.iter().any(|r| r.path.ends_with("secrets.env")));

        let secrets = std::fs::read_to_string(target.join(RESTORED_SECRETS_FILE)).unwrap();
        assert!(secrets.contains("SIGNING_KEY=deadbeef"));

        // File entries land at their original relative paths
        assert_eq!(
            std::fs::read(target.join("app.toml")).unwrap(),
            b"[app]\nport = 8080\n"
        );
        assert_eq!(
            std::fs::read(target.join(".env")).unwrap(),
            b"DB_PASSWORD=hunter2\n"
        );
    }

    #[tokio::test]
    async fn test_restore_roundtrip_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        seed_configs(&dir);
        let service = service(&dir, None);

        let backup = service
            .create_backup(ConfigBackupOptions::default())
            .await
            .unwrap();
        let target = dir.path().join("restored");
        service.restore_full(&backup.manifest, &target).await.unwrap();

        for name in ["app.toml", "api-token.json", ".env"] {
            assert_eq!(
                std::fs::read(dir.path().join("etc").join(name)).unwrap(),
                std::fs::read(target.join(name)).unwrap(),
                "{} differs after restore",
                name
            );
        }
    }
}
