//! Azure-Blob-compatible storage backend.
//!
//! Authenticates with a shared access signature appended to every request
//! URL; works against Azure Blob Storage and Azurite-style emulators.

use crate::config::AzureConfig;
use crate::error::{EngineError, Result};
use crate::storage::xml;
use crate::storage::{RemoteObject, StorageBackend};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;

const API_VERSION: &str = "2021-08-06";

pub struct AzureBlobStorage {
    client: reqwest::Client,
    cfg: AzureConfig,
}

impl AzureBlobStorage {
    pub fn new(cfg: AzureConfig) -> Result<Self> {
        reqwest::Url::parse(&cfg.endpoint)
            .map_err(|e| EngineError::Validation(format!("invalid azure endpoint: {}", e)))?;
        Ok(Self {
            client: reqwest::Client::new(),
            cfg,
        })
    }

    fn blob_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}?{}",
            self.cfg.endpoint.trim_end_matches('/'),
            self.cfg.container,
            key,
            self.cfg.sas_token
        )
    }

    fn container_url(&self, query: &str) -> String {
        format!(
            "{}/{}?{}&{}",
            self.cfg.endpoint.trim_end_matches('/'),
            self.cfg.container,
            query,
            self.cfg.sas_token
        )
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        request
            .header("x-ms-version", API_VERSION)
            .send()
            .await
            .map_err(|e| {
                EngineError::DependencyUnavailable(format!("azure endpoint unreachable: {}", e))
            })
    }
}

#[async_trait]
impl StorageBackend for AzureBlobStorage {
    async fn upload_file(&self, local_path: &Path, remote_key: &str) -> Result<()> {
        let bytes = tokio::fs::read(local_path).await?;
        let response = self
            .send(
                self.client
                    .put(self.blob_url(remote_key))
                    .header("x-ms-blob-type", "BlockBlob")
                    .body(bytes),
            )
            .await?;
        expect_success(response, "put", remote_key).await?;
        Ok(())
    }

    async fn download_file(&self, remote_key: &str, local_path: &Path) -> Result<()> {
        let response = self.send(self.client.get(self.blob_url(remote_key))).await?;
        let response = expect_success(response, "get", remote_key).await?;
        let bytes = response.bytes().await.map_err(|e| {
            EngineError::Storage(format!("reading blob '{}' failed: {}", remote_key, e))
        })?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, &bytes).await?;
        Ok(())
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let mut objects = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut query = format!("restype=container&comp=list&prefix={}", prefix);
            if let Some(m) = &marker {
                query.push_str(&format!("&marker={}", m));
            }
            let response = self.send(self.client.get(self.container_url(&query))).await?;
            let response = expect_success(response, "list", prefix).await?;
            let body = response.text().await.map_err(|e| {
                EngineError::Storage(format!("reading list response failed: {}", e))
            })?;

            for block in xml::tag_blocks(&body, "Blob") {
                let key = xml::tag_value(block, "Name")
                    .ok_or_else(|| EngineError::Storage("blob entry without name".into()))?;
                let size = xml::tag_value(block, "Content-Length")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                let modified = xml::tag_value(block, "Last-Modified")
                    .and_then(|s| DateTime::parse_from_rfc2822(&s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now);
                objects.push(RemoteObject { key, size, modified });
            }

            marker = xml::tag_value(&body, "NextMarker").filter(|m| !m.is_empty());
            if marker.is_none() {
                break;
            }
        }

        Ok(objects)
    }

    async fn delete_file(&self, remote_key: &str) -> Result<()> {
        let response = self.send(self.client.delete(self.blob_url(remote_key))).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        expect_success(response, "delete", remote_key).await?;
        Ok(())
    }
}

async fn expect_success(
    response: reqwest::Response,
    op: &str,
    key: &str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(EngineError::Storage(format!("blob '{}' not found", key)));
    }
    let body = response.text().await.unwrap_or_default();
    Err(EngineError::Storage(format!(
        "azure {} '{}' failed with {}: {}",
        op,
        key,
        status,
        body.chars().take(200).collect::<String>()
    )))
}
