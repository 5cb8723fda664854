//! File backup service.
//!
//! Discovers candidate files under the configured roots, classifies each by
//! sensitivity and logical type, and pushes the processed artifacts through
//! the storage backend for the selected provider. Content tied to a
//! protected subject is always encrypted, whatever the job's flag says.

use crate::config::FileBackupConfig;
use crate::crypto::EncryptionKey;
use crate::error::{EngineError, Result};
use crate::models::manifest::{
    ArtifactDetail, ArtifactManifest, BackupManifest, FileKind, SensitivityClass, MANIFEST_FILE,
};
use crate::models::restore::RestoredItem;
use crate::models::BackupComponent;
use crate::services::artifact::{self, CpuPool};
use crate::services::ComponentBackup;
use crate::storage::{StorageBackend, StorageProvider};
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct FileBackupOptions {
    pub incremental: bool,
    pub encrypt: bool,
    pub compress: bool,
    pub retention_days: i64,
    pub job_id: Option<String>,
    pub cancel: CancellationToken,
}

impl Default for FileBackupOptions {
    fn default() -> Self {
        Self {
            incremental: false,
            encrypt: true,
            compress: true,
            retention_days: 30,
            job_id: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// A file selected for backup.
#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    /// Key-safe relative path, prefixed with the root's directory name
    relative: String,
    size: u64,
    modified: DateTime<Utc>,
}

pub struct FileBackupService {
    cfg: FileBackupConfig,
    key: Option<EncryptionKey>,
    pool: CpuPool,
    backend: Arc<dyn StorageBackend>,
    provider: StorageProvider,
    remote_prefix: String,
}

impl FileBackupService {
    pub fn new(
        cfg: FileBackupConfig,
        key: Option<EncryptionKey>,
        pool: CpuPool,
        backend: Arc<dyn StorageBackend>,
        provider: StorageProvider,
        remote_prefix: String,
    ) -> Self {
        Self {
            cfg,
            key,
            pool,
            backend,
            provider,
            remote_prefix,
        }
    }

    pub fn provider(&self) -> StorageProvider {
        self.provider
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.backend.clone()
    }

    pub fn has_encryption_key(&self) -> bool {
        self.key.is_some()
    }

    pub async fn create_backup(&self, opts: FileBackupOptions) -> Result<ComponentBackup> {
        let backup_id = artifact::execution_id("files");
        let mut manifest =
            BackupManifest::new(&backup_id, opts.job_id.clone(), BackupComponent::Files);

        let mut candidates = self.discover()?;

        if opts.incremental {
            match self.list_backups(Some(1)).await?.into_iter().next() {
                Some(prev) => {
                    let cutoff = prev.created_at;
                    let before = candidates.len();
                    candidates.retain(|c| c.modified > cutoff);
                    info!(
                        backup_id = %backup_id,
                        kept = candidates.len(),
                        skipped = before - candidates.len(),
                        "Incremental file backup since previous manifest"
                    );
                }
                None => {
                    warn!(
                        backup_id = %backup_id,
                        "No prior file backup for incremental mode, falling back to full"
                    );
                }
            }
        }

        let staging = artifact::staging_dir(&self.cfg.staging_dir, &backup_id);
        std::fs::create_dir_all(&staging)?;

        let mut artifact_paths = Vec::new();
        for candidate in candidates {
            if opts.cancel.is_cancelled() {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(EngineError::Storage("backup cancelled".into()));
            }
            match self
                .process_one(&backup_id, &candidate, &opts, &staging)
                .await
            {
                Ok(record) => {
                    artifact_paths.push(record.artifact_path.clone());
                    manifest.push_artifact(record);
                }
                // A single artifact's failure is recorded, never fatal to
                // the sibling files
                Err(e) => {
                    warn!(
                        backup_id = %backup_id,
                        file = %candidate.path.display(),
                        "File skipped: {}", e
                    );
                    manifest.push_error(candidate.path.to_string_lossy(), e.to_string());
                }
            }
        }

        // Manifest travels with the artifacts on the backend; its upload
        // completes before the component reports success.
        let manifest_local = manifest.write_atomic(&staging)?;
        self.backend
            .upload_file(&manifest_local, &self.manifest_key(&backup_id))
            .await?;
        let _ = std::fs::remove_dir_all(&staging);

        info!(
            backup_id = %backup_id,
            artifacts = manifest.artifacts.len(),
            errors = manifest.errors.len(),
            total_bytes = manifest.total_bytes,
            provider = %self.provider,
            "File backup completed"
        );

        Ok(ComponentBackup {
            backup_id,
            artifact_paths,
            total_bytes: manifest.total_bytes,
            manifest,
            success: true,
            error: None,
        })
    }

    async fn process_one(
        &self,
        backup_id: &str,
        candidate: &Candidate,
        opts: &FileBackupOptions,
        staging: &Path,
    ) -> Result<ArtifactManifest> {
        let data = tokio::fs::read(&candidate.path).await?;
        let sensitivity = self.classify(&candidate.path, &data);

        // Protected-subject content is encrypted no matter what the job says
        let must_encrypt = opts.encrypt || sensitivity.requires_encryption();
        let key = if must_encrypt {
            match &self.key {
                Some(k) => Some(k.clone()),
                None => {
                    return Err(EngineError::Compliance(format!(
                        "'{}' requires encryption but no key is configured",
                        candidate.path.display()
                    )))
                }
            }
        } else {
            None
        };

        let compress = opts.compress;
        let processed = self
            .pool
            .run(move || artifact::process(data, compress, key.as_ref()))
            .await?;

        let remote_key = format!(
            "{}/{}/{}",
            self.remote_prefix,
            backup_id,
            artifact::artifact_file_name(&candidate.relative, processed.flags)
        );

        let staged = staging.join(format!("{:08x}.part", manifest_slot(&remote_key)));
        artifact::write_atomic(&staged, &processed.bytes)?;
        self.backend.upload_file(&staged, &remote_key).await?;
        let _ = tokio::fs::remove_file(&staged).await;

        Ok(ArtifactManifest {
            id: format!("{}:{}", backup_id, candidate.relative),
            artifact_path: remote_key,
            size_bytes: processed.bytes.len() as u64,
            checksum: processed.checksum,
            compressed: processed.flags.compressed,
            encrypted: processed.flags.encrypted,
            sensitivity,
            retention_until: Utc::now() + Duration::days(opts.retention_days),
            created_at: Utc::now(),
            detail: ArtifactDetail::File {
                source_path: candidate.path.to_string_lossy().to_string(),
                file_kind: FileKind::from_extension(
                    candidate.path.extension().and_then(|e| e.to_str()),
                ),
                provider: self.provider,
            },
        })
    }

    /// Walk the configured roots, applying the dotfile, size and extension
    /// filters.
    fn discover(&self) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();
        for root in &self.cfg.roots {
            if !root.exists() {
                warn!(root = %root.display(), "File backup root does not exist, skipping");
                continue;
            }
            let root_label = root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "root".to_string());

            for entry in WalkDir::new(root) {
                let entry = entry.map_err(|e| EngineError::Storage(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if name.starts_with('.') {
                    continue;
                }
                if !self.extension_included(entry.path()) {
                    continue;
                }
                let metadata = entry
                    .metadata()
                    .map_err(|e| EngineError::Storage(e.to_string()))?;
                if metadata.len() > self.cfg.max_file_size {
                    warn!(
                        file = %entry.path().display(),
                        size = metadata.len(),
                        "File exceeds size ceiling, skipping"
                    );
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(root)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                let modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                candidates.push(Candidate {
                    path: entry.path().to_path_buf(),
                    relative: format!("{}/{}", root_label, relative),
                    size: metadata.len(),
                    modified,
                });
            }
        }
        candidates.sort_by_key(|c| c.size);
        Ok(candidates)
    }

    fn extension_included(&self, path: &Path) -> bool {
        if self.cfg.include_extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                self.cfg
                    .include_extensions
                    .iter()
                    .any(|inc| inc.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    /// Protected-subject markers are matched against the path and, for
    /// small files, the content.
    fn classify(&self, path: &Path, data: &[u8]) -> SensitivityClass {
        let path_lower = path.to_string_lossy().to_lowercase();
        if self
            .cfg
            .protected_markers
            .iter()
            .any(|m| path_lower.contains(&m.to_lowercase()))
        {
            return SensitivityClass::ProtectedSubject;
        }
        if data.len() as u64 <= self.cfg.content_scan_limit {
            let content_lower = String::from_utf8_lossy(data).to_lowercase();
            if self
                .cfg
                .protected_markers
                .iter()
                .any(|m| content_lower.contains(&m.to_lowercase()))
            {
                return SensitivityClass::ProtectedSubject;
            }
        }
        SensitivityClass::Standard
    }

    fn manifest_key(&self, backup_id: &str) -> String {
        format!("{}/{}/{}", self.remote_prefix, backup_id, MANIFEST_FILE)
    }

    /// Manifests of past executions on the backend, newest first.
    pub async fn list_backups(&self, limit: Option<usize>) -> Result<Vec<BackupManifest>> {
        let prefix = format!("{}/", self.remote_prefix);
        let objects = self.backend.list_files(&prefix).await?;

        let mut manifests = Vec::new();
        for object in objects
            .iter()
            .filter(|o| o.key.ends_with(&format!("/{}", MANIFEST_FILE)))
        {
            let scratch = self
                .cfg
                .staging_dir
                .join(format!(".manifest-{:08x}.json", manifest_slot(&object.key)));
            if let Err(e) = self.backend.download_file(&object.key, &scratch).await {
                warn!(key = %object.key, "Skipping unreadable manifest: {}", e);
                continue;
            }
            match BackupManifest::read(&scratch) {
                Ok(m) => manifests.push(m),
                Err(e) => warn!(key = %object.key, "Skipping corrupted manifest: {}", e),
            }
            let _ = tokio::fs::remove_file(&scratch).await;
        }

        manifests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            manifests.truncate(limit);
        }
        Ok(manifests)
    }

    pub async fn find_backup(&self, backup_id: &str) -> Result<Option<BackupManifest>> {
        Ok(self
            .list_backups(None)
            .await?
            .into_iter()
            .find(|m| m.backup_id == backup_id))
    }

    /// Delete every object of one execution, manifest included.
    pub async fn delete_backup(&self, backup_id: &str) -> Result<()> {
        let prefix = format!("{}/{}/", self.remote_prefix, backup_id);
        for object in self.backend.list_files(&prefix).await? {
            self.backend.delete_file(&object.key).await?;
        }
        Ok(())
    }

    /// Download, decrypt and decompress every artifact of a backup into the
    /// target tree. Individual failures become warnings, not an abort.
    pub async fn restore_full(
        &self,
        manifest: &BackupManifest,
        target_dir: &Path,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<RestoredItem>> {
        let prefix = format!("{}/{}/", self.remote_prefix, manifest.backup_id);
        let mut restored = Vec::new();

        for record in &manifest.artifacts {
            match self
                .restore_one(record, &prefix, target_dir)
                .await
            {
                Ok(item) => restored.push(item),
                Err(e) => warnings.push(format!(
                    "restore of '{}' failed: {}",
                    record.artifact_path, e
                )),
            }
        }
        Ok(restored)
    }

    async fn restore_one(
        &self,
        record: &ArtifactManifest,
        prefix: &str,
        target_dir: &Path,
    ) -> Result<RestoredItem> {
        let scratch = self
            .cfg
            .staging_dir
            .join(format!(".restore-{:08x}.part", manifest_slot(&record.artifact_path)));
        self.backend
            .download_file(&record.artifact_path, &scratch)
            .await?;
        let bytes = tokio::fs::read(&scratch).await?;
        let _ = tokio::fs::remove_file(&scratch).await;

        let actual = crate::crypto::sha256_hex(&bytes);
        if actual != record.checksum {
            return Err(EngineError::Integrity(format!(
                "checksum mismatch: expected {}, got {}",
                record.checksum, actual
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

        // Original relative path: strip the execution prefix, then the
        // pipeline suffixes
        let stripped = record
            .artifact_path
            .strip_prefix(prefix)
            .unwrap_or(&record.artifact_path);
        let stripped = stripped
            .strip_suffix(artifact::ENCRYPTED_SUFFIX)
            .unwrap_or(stripped);
        let stripped = stripped
            .strip_suffix(artifact::COMPRESSED_SUFFIX)
            .unwrap_or(stripped);

        let target = target_dir.join(stripped);
        let size = plain.len() as u64;
        artifact::write_atomic(&target, &plain)?;

        Ok(RestoredItem {
            path: target.to_string_lossy().to_string(),
            size_bytes: size,
            dry_run: false,
        })
    }
}

fn manifest_slot(key: &str) -> u32 {
    // Stable scratch-file discriminator; collisions only cost a re-download
    key.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use tempfile::TempDir;

    fn service(dir: &TempDir, key: Option<EncryptionKey>) -> FileBackupService {
        let backend =
            Arc::new(LocalStorage::new(dir.path().join("objects")).unwrap());
        FileBackupService::new(
            FileBackupConfig {
                roots: vec![dir.path().join("data")],
                staging_dir: dir.path().join("staging"),
                ..Default::default()
            },
            key,
            CpuPool::new(2),
            backend,
            StorageProvider::Local,
            "file-backups".to_string(),
        )
    }

    fn seed_files(dir: &TempDir) {
        let data = dir.path().join("data");
        std::fs::create_dir_all(data.join("reports")).unwrap();
        std::fs::write(data.join("reports/summary.txt"), b"quarterly summary").unwrap();
        std::fs::write(data.join("notes.md"), b"general notes").unwrap();
        std::fs::write(data.join(".hidden"), b"dotfile").unwrap();
    }

    #[tokio::test]
    async fn test_backup_skips_dotfiles_and_uploads_manifest() {
        let dir = TempDir::new().unwrap();
        seed_files(&dir);
        let service = service(&dir, Some(EncryptionKey::generate()));

        let result = service.create_backup(FileBackupOptions::default()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.manifest.artifacts.len(), 2);
        assert!(result.manifest.errors.is_empty());
        assert!(!result
            .manifest
            .artifacts
            .iter()
            .any(|a| a.artifact_path.contains(".hidden")));

        let listed = service.list_backups(None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].backup_id, result.backup_id);
    }

    #[tokio::test]
    async fn test_size_ceiling_skips_large_files() {
        let dir = TempDir::new().unwrap();
        seed_files(&dir);
        std::fs::write(dir.path().join("data/huge.bin"), vec![0u8; 4096]).unwrap();

        let backend = Arc::new(LocalStorage::new(dir.path().join("objects")).unwrap());
        let service = FileBackupService::new(
            FileBackupConfig {
                roots: vec![dir.path().join("data")],
                staging_dir: dir.path().join("staging"),
                max_file_size: 1024,
                ..Default::default()
            },
            Some(EncryptionKey::generate()),
            CpuPool::new(2),
            backend,
            StorageProvider::Local,
            "file-backups".to_string(),
        );

        let result = service.create_backup(FileBackupOptions::default()).await.unwrap();
        assert!(!result
            .manifest
            .artifacts
            .iter()
            .any(|a| a.artifact_path.contains("huge.bin")));
    }

    #[tokio::test]
    async fn test_protected_subject_encrypted_despite_flag_off() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("minor-records.txt"), b"restricted").unwrap();
        std::fs::write(data.join("plain.txt"), b"public notice").unwrap();

        let service = service(&dir, Some(EncryptionKey::generate()));
        let result = service
            .create_backup(FileBackupOptions {
                encrypt: false,
                ..Default::default()
            })
            .await
            .unwrap();

        let protected = result
            .manifest
            .artifacts
            .iter()
            .find(|a| a.artifact_path.contains("minor-records"))
            .unwrap();
        assert!(protected.encrypted);
        assert_eq!(protected.sensitivity, SensitivityClass::ProtectedSubject);

        let plain = result
            .manifest
            .artifacts
            .iter()
            .find(|a| a.artifact_path.contains("plain.txt"))
            .unwrap();
        assert!(!plain.encrypted);
        assert_eq!(plain.sensitivity, SensitivityClass::Standard);
    }

    #[tokio::test]
    async fn test_protected_content_match_without_key_is_recorded_error() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("case-file.txt"), b"subject is a minor").unwrap();
        std::fs::write(data.join("plain.txt"), b"public").unwrap();

        let service = service(&dir, None);
        let result = service
            .create_backup(FileBackupOptions {
                encrypt: false,
                ..Default::default()
            })
            .await
            .unwrap();

        // Per-item failure, sibling still succeeds
        assert!(result.success);
        assert_eq!(result.manifest.artifacts.len(), 1);
        assert_eq!(result.manifest.errors.len(), 1);
        assert!(result.manifest.errors[0].item.contains("case-file"));
    }

    #[tokio::test]
    async fn test_incremental_only_picks_newer_files() {
        let dir = TempDir::new().unwrap();
        seed_files(&dir);
        let service = service(&dir, Some(EncryptionKey::generate()));

        let full = service.create_backup(FileBackupOptions::default()).await.unwrap();
        assert_eq!(full.manifest.artifacts.len(), 2);

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        std::fs::write(dir.path().join("data/fresh.txt"), b"new content").unwrap();

        let incremental = service
            .create_backup(FileBackupOptions {
                incremental: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(incremental.manifest.artifacts.len(), 1);
        assert!(incremental.manifest.artifacts[0]
            .artifact_path
            .contains("fresh.txt"));
    }

    #[tokio::test]
    async fn test_roundtrip_restores_identical_bytes() {
        let dir = TempDir::new().unwrap();
        seed_files(&dir);
        let service = service(&dir, Some(EncryptionKey::generate()));

        let backup = service.create_backup(FileBackupOptions::default()).await.unwrap();

        let target = dir.path().join("restored");
        let mut warnings = Vec::new();
        let restored = service
            .restore_full(&backup.manifest, &target, &mut warnings)
            .await
            .unwrap();

        assert!(warnings.is_empty());
        assert_eq!(restored.len(), 2);
        assert_eq!(
            std::fs::read(target.join("data/reports/summary.txt")).unwrap(),
            b"quarterly summary"
        );
        assert_eq!(
            std::fs::read(target.join("data/notes.md")).unwrap(),
            b"general notes"
        );
    }

    #[tokio::test]
    async fn test_restore_collects_warnings_for_damaged_artifacts() {
        let dir = TempDir::new().unwrap();
        seed_files(&dir);
        let service = service(&dir, Some(EncryptionKey::generate()));

        let backup = service.create_backup(FileBackupOptions::default()).await.unwrap();

        // Corrupt one object in place
        let victim = &backup.manifest.artifacts[0];
        let object_path = dir.path().join("objects").join(&victim.artifact_path);
        let mut bytes = std::fs::read(&object_path).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(&object_path, &bytes).unwrap();

        let target = dir.path().join("restored");
        let mut warnings = Vec::new();
        let restored = service
            .restore_full(&backup.manifest, &target, &mut warnings)
            .await
            .unwrap();

        assert_eq!(restored.len(), 1);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("checksum mismatch"));
    }
}
