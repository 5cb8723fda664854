//! Local filesystem storage backend.
//!
//! Keys are relative paths under the configured root. Uploads land in a
//! temp file and are renamed into place so a concurrent reader never sees a
//! partial object.

use crate::error::{EngineError, Result};
use crate::storage::{RemoteObject, StorageBackend};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self { root })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || Path::new(key).is_absolute()
            || key.split('/').any(|part| part == "..")
        {
            return Err(EngineError::Storage(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn upload_file(&self, local_path: &Path, remote_key: &str) -> Result<()> {
        let dest = self.resolve(remote_key)?;
        let parent = dest
            .parent()
            .ok_or_else(|| EngineError::Storage(format!("invalid object key '{}'", remote_key)))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;
        let tmp = parent.join(format!(".{}.upload", uuid::Uuid::new_v4().simple()));
        tokio::fs::copy(local_path, &tmp).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }
        tokio::fs::rename(&tmp, &dest).await?;
        Ok(())
    }

    async fn download_file(&self, remote_key: &str, local_path: &Path) -> Result<()> {
        let src = self.resolve(remote_key)?;
        if !tokio::fs::try_exists(&src).await? {
            return Err(EngineError::Storage(format!(
                "object '{}' not found",
                remote_key
            )));
        }
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, local_path).await?;
        Ok(())
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        // walkdir is synchronous; keep it off the async workers
        let objects = tokio::task::spawn_blocking(move || -> Result<Vec<RemoteObject>> {
            let mut objects = Vec::new();
            if !root.exists() {
                return Ok(objects);
            }
            for entry in WalkDir::new(&root) {
                let entry = entry.map_err(|e| EngineError::Storage(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                // In-flight upload temps are not objects yet
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let key = entry
                    .path()
                    .strip_prefix(&root)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                if !key.starts_with(&prefix) {
                    continue;
                }
                let metadata = entry.metadata().map_err(|e| EngineError::Storage(e.to_string()))?;
                let modified: DateTime<Utc> = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                objects.push(RemoteObject {
                    key,
                    size: metadata.len(),
                    modified,
                });
            }
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
        .await
        .map_err(|e| EngineError::Storage(format!("list task failed: {}", e)))??;

        Ok(objects)
    }

    async fn delete_file(&self, remote_key: &str) -> Result<()> {
        let path = self.resolve(remote_key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // Drop now-empty parent directories up to the root
        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == self.root || tokio::fs::remove_dir(&d).await.is_err() {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn backend() -> (TempDir, LocalStorage) {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().join("objects")).unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let (dir, storage) = backend().await;
        let src = dir.path().join("src.bin");
        tokio::fs::write(&src, b"artifact bytes").await.unwrap();

        storage.upload_file(&src, "run-1/artifact.bin").await.unwrap();

        let dest = dir.path().join("dest.bin");
        storage.download_file("run-1/artifact.bin", &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"artifact bytes");
    }

    #[tokio::test]
    async fn test_list_respects_prefix() {
        let (dir, storage) = backend().await;
        let src = dir.path().join("src.bin");
        tokio::fs::write(&src, b"x").await.unwrap();

        storage.upload_file(&src, "run-1/a.bin").await.unwrap();
        storage.upload_file(&src, "run-2/b.bin").await.unwrap();

        let all = storage.list_files("").await.unwrap();
        assert_eq!(all.len(), 2);

        let scoped = storage.list_files("run-1/").await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].key, "run-1/a.bin");
        assert_eq!(scoped[0].size, 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (dir, storage) = backend().await;
        let src = dir.path().join("src.bin");
        tokio::fs::write(&src, b"x").await.unwrap();
        storage.upload_file(&src, "run-1/a.bin").await.unwrap();

        storage.delete_file("run-1/a.bin").await.unwrap();
        storage.delete_file("run-1/a.bin").await.unwrap();
        assert!(storage.list_files("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_traversal_keys() {
        let (_dir, storage) = backend().await;
        assert!(storage.list_files("x").await.unwrap().is_empty());
        assert!(storage.download_file("../escape", Path::new("/tmp/x")).await.is_err());
        assert!(storage.delete_file("/absolute").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_uploaded_objects_are_owner_restricted() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, storage) = backend().await;
        let src = dir.path().join("src.bin");
        tokio::fs::write(&src, b"x").await.unwrap();
        storage.upload_file(&src, "run-1/a.bin").await.unwrap();

        let mode = std::fs::metadata(dir.path().join("objects/run-1/a.bin"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o077, 0);
    }
}
