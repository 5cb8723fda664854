//! Secret-vault collaborator seam.

use crate::error::Result;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct VaultEntry {
    pub name: String,
    pub value: String,
}

/// Optional collaborator queried by the configuration backup service. When
/// present, every vault entry is captured into the (always encrypted)
/// secrets artifact.
#[async_trait]
pub trait SecretVault: Send + Sync {
    async fn list_entries(&self) -> Result<Vec<VaultEntry>>;
}

/// In-memory vault for embedded deployments and tests.
#[derive(Default)]
pub struct StaticVault {
    entries: Vec<VaultEntry>,
}

impl StaticVault {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(name, value)| VaultEntry { name, value })
                .collect(),
        }
    }
}

#[async_trait]
impl SecretVault for StaticVault {
    async fn list_entries(&self) -> Result<Vec<VaultEntry>> {
        Ok(self.entries.clone())
    }
}
