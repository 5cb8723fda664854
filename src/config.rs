//! Engine configuration.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! Every section has serde defaults so a minimal file (or none at all) still
//! produces a working local-storage engine.

use crate::crypto::EncryptionKey;
use crate::error::{EngineError, Result};
use crate::storage::StorageProvider;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub files: FileBackupConfig,
    #[serde(default)]
    pub secrets: ConfigBackupConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend used for file artifacts
    #[serde(default)]
    pub provider: StorageProvider,

    /// Root directory for the local backend
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,

    /// Key prefix for file artifacts on the selected backend
    #[serde(default = "default_remote_prefix")]
    pub remote_prefix: String,

    pub s3: Option<S3Config>,
    pub azure: Option<AzureConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Endpoint URL, e.g. `https://s3.us-east-1.amazonaws.com` or a
    /// self-hosted S3-compatible gateway
    pub endpoint: String,
    pub bucket: String,
    #[serde(default = "default_s3_region")]
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureConfig {
    /// Account endpoint, e.g. `https://myaccount.blob.core.windows.net`
    pub endpoint: String,
    pub container: String,
    /// Shared access signature query string (without the leading `?`)
    pub sas_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the operational SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory receiving database backup executions
    #[serde(default = "default_db_backup_dir")]
    pub backup_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileBackupConfig {
    /// Roots scanned for candidate files
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    /// Extensions to include; empty means every regular file
    #[serde(default)]
    pub include_extensions: Vec<String>,

    /// Files above this size are skipped
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Path or content markers that force protected-subject classification
    /// and mandatory encryption
    #[serde(default = "default_protected_markers")]
    pub protected_markers: Vec<String>,

    /// Content scan is limited to files up to this size
    #[serde(default = "default_content_scan_limit")]
    pub content_scan_limit: u64,

    /// Local staging directory for artifact assembly before upload
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigBackupConfig {
    /// Roots scanned for configuration-like files
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    /// Extensions treated as configuration files
    #[serde(default = "default_config_extensions")]
    pub config_extensions: Vec<String>,

    /// Name markers that classify a file or environment variable as secret
    #[serde(default = "default_secret_markers")]
    pub secret_markers: Vec<String>,

    /// Capture matching process environment entries
    #[serde(default = "default_true")]
    pub include_env: bool,

    /// Directory receiving configuration backup executions
    #[serde(default = "default_config_backup_dir")]
    pub backup_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Target root for file restores
    #[serde(default = "default_restore_target")]
    pub files_target_dir: PathBuf,

    /// Target tree for configuration archive extraction
    #[serde(default = "default_config_restore_target")]
    pub config_target_dir: PathBuf,

    /// Scratch space for downloaded artifacts
    #[serde(default = "default_restore_staging")]
    pub staging_dir: PathBuf,

    /// Health-check URLs of dependent services
    #[serde(default)]
    pub dependent_services: Vec<String>,

    /// Timeout for dependent health probes
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,

    /// Estimated space need is multiplied by this margin
    #[serde(default = "default_free_space_margin")]
    pub free_space_margin: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum concurrently executing backup jobs; excess jobs queue in
    /// arrival order
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Bounded pool for CPU-heavy hashing, compression and encryption
    #[serde(default = "default_cpu_workers")]
    pub cpu_workers: usize,

    /// Grace period `stop()` waits before abandoning stragglers
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

// Default values
fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine/files")
}

fn default_remote_prefix() -> String {
    "file-backups".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine/service.db")
}

fn default_db_backup_dir() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine/db-backups")
}

fn default_max_file_size() -> u64 {
    512 * 1024 * 1024 // 512 MB
}

fn default_protected_markers() -> Vec<String> {
    vec![
        "minor".to_string(),
        "juvenile".to_string(),
        "guardian".to_string(),
    ]
}

fn default_content_scan_limit() -> u64 {
    256 * 1024 // 256 KB
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine/staging")
}

fn default_config_extensions() -> Vec<String> {
    ["toml", "yaml", "yml", "json", "ini", "conf", "env"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_secret_markers() -> Vec<String> {
    ["secret", "password", "token", "key", "credential"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_config_backup_dir() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine/config-backups")
}

fn default_restore_target() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine/restored")
}

fn default_config_restore_target() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine/restored-config")
}

fn default_restore_staging() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine/restore-staging")
}

fn default_health_timeout_secs() -> u64 {
    5
}

fn default_free_space_margin() -> f64 {
    1.2
}

fn default_max_concurrent_jobs() -> usize {
    2
}

fn default_cpu_workers() -> usize {
    4
}

fn default_stop_grace_secs() -> u64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::default(),
            root: default_storage_root(),
            remote_prefix: default_remote_prefix(),
            s3: None,
            azure: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            backup_dir: default_db_backup_dir(),
        }
    }
}

impl Default for FileBackupConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            include_extensions: Vec::new(),
            max_file_size: default_max_file_size(),
            protected_markers: default_protected_markers(),
            content_scan_limit: default_content_scan_limit(),
            staging_dir: default_staging_dir(),
        }
    }
}

impl Default for ConfigBackupConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            config_extensions: default_config_extensions(),
            secret_markers: default_secret_markers(),
            include_env: default_true(),
            backup_dir: default_config_backup_dir(),
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            files_target_dir: default_restore_target(),
            config_target_dir: default_config_restore_target(),
            staging_dir: default_restore_staging(),
            dependent_services: Vec::new(),
            health_timeout_secs: default_health_timeout_secs(),
            free_space_margin: default_free_space_margin(),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            cpu_workers: default_cpu_workers(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Resolve the artifact encryption key: `BACKUP_ENCRYPTION_KEY` in the
    /// environment (`.env` honored), hex-encoded. Returns None when no key
    /// is configured; compliance jobs and secret artifacts then fail their
    /// validation instead of being written unencrypted.
    pub fn encryption_key_from_env() -> Result<Option<EncryptionKey>> {
        dotenvy::dotenv().ok();
        match std::env::var("BACKUP_ENCRYPTION_KEY") {
            Ok(raw) if !raw.trim().is_empty() => Ok(Some(EncryptionKey::from_hex(&raw)?)),
            Ok(_) | Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(EngineError::Crypto(format!(
                "BACKUP_ENCRYPTION_KEY unreadable: {}",
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_usable() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.performance.max_concurrent_jobs, 2);
        assert!(cfg.secrets.secret_markers.iter().any(|m| m == "password"));
        assert!(cfg.files.protected_markers.iter().any(|m| m == "minor"));
        assert!((cfg.restore.free_space_margin - 1.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: EngineConfig = toml::from_str(
            r#"
            [files]
            roots = ["/srv/data"]
            max_file_size = 1024

            [storage]
            provider = "local"
            root = "/tmp/artifacts"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.files.roots, vec![PathBuf::from("/srv/data")]);
        assert_eq!(cfg.files.max_file_size, 1024);
        assert_eq!(cfg.storage.root, PathBuf::from("/tmp/artifacts"));
        assert_eq!(cfg.performance.cpu_workers, 4);
    }
}
