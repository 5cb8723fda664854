//! Storage backend capability.
//!
//! File artifacts move through this seam; the three variants (local
//! filesystem, S3-compatible, Azure-Blob-compatible) are required to show
//! identical observable semantics.

pub mod azure;
pub mod local;
pub mod s3;
mod xml;

use crate::config::StorageConfig;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub use azure::AzureBlobStorage;
pub use local::LocalStorage;
pub use s3::S3CompatibleStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    #[default]
    Local,
    S3,
    Azure,
}

impl std::fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StorageProvider::Local => "local",
            StorageProvider::S3 => "s3",
            StorageProvider::Azure => "azure",
        };
        f.write_str(s)
    }
}

/// One stored object, as reported by `list_files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn upload_file(&self, local_path: &Path, remote_key: &str) -> Result<()>;
    async fn download_file(&self, remote_key: &str, local_path: &Path) -> Result<()>;
    async fn list_files(&self, prefix: &str) -> Result<Vec<RemoteObject>>;
    async fn delete_file(&self, remote_key: &str) -> Result<()>;
}

/// Build the backend selected by the configuration.
pub fn create_backend(cfg: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match cfg.provider {
        StorageProvider::Local => Ok(Arc::new(LocalStorage::new(cfg.root.clone())?)),
        StorageProvider::S3 => {
            let s3 = cfg.s3.as_ref().ok_or_else(|| {
                EngineError::Validation("storage provider is s3 but [storage.s3] is missing".into())
            })?;
            Ok(Arc::new(S3CompatibleStorage::new(s3.clone())?))
        }
        StorageProvider::Azure => {
            let azure = cfg.azure.as_ref().ok_or_else(|| {
                EngineError::Validation(
                    "storage provider is azure but [storage.azure] is missing".into(),
                )
            })?;
            Ok(Arc::new(AzureBlobStorage::new(azure.clone())?))
        }
    }
}
