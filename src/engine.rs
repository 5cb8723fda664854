//! Engine wiring.
//!
//! Builds the storage backend, the three component services, the
//! orchestrator and the restore service from one configuration value. The
//! external scheduler/CLI driver owns *when* to call; this is the whole
//! surface it calls into.

use crate::config::EngineConfig;
use crate::crypto::EncryptionKey;
use crate::error::Result;
use crate::monitoring::{LogSink, MonitoringSink};
use crate::services::artifact::CpuPool;
use crate::services::config_backup::ConfigBackupService;
use crate::services::database_backup::DatabaseBackupService;
use crate::services::file_backup::FileBackupService;
use crate::services::orchestrator::{BackupOrchestrator, ComponentServices};
use crate::services::restore::RestoreService;
use crate::storage;
use crate::vault::SecretVault;
use std::sync::Arc;

pub struct BackupEngine {
    pub orchestrator: BackupOrchestrator,
    pub restore: RestoreService,
    services: ComponentServices,
}

impl BackupEngine {
    /// Wire the engine with the default log-only monitoring sink and the
    /// key from the environment.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let key = EngineConfig::encryption_key_from_env()?;
        Self::builder(config).with_encryption_key(key).build()
    }

    pub fn builder(config: EngineConfig) -> BackupEngineBuilder {
        BackupEngineBuilder {
            config,
            key: None,
            vault: None,
            monitoring: None,
        }
    }

    pub fn database_service(&self) -> Option<Arc<DatabaseBackupService>> {
        self.services.database.clone()
    }

    pub fn file_service(&self) -> Option<Arc<FileBackupService>> {
        self.services.files.clone()
    }

    pub fn config_service(&self) -> Option<Arc<ConfigBackupService>> {
        self.services.config.clone()
    }
}

pub struct BackupEngineBuilder {
    config: EngineConfig,
    key: Option<EncryptionKey>,
    vault: Option<Arc<dyn SecretVault>>,
    monitoring: Option<Arc<dyn MonitoringSink>>,
}

impl BackupEngineBuilder {
    pub fn with_encryption_key(mut self, key: Option<EncryptionKey>) -> Self {
        self.key = key;
        self
    }

    pub fn with_vault(mut self, vault: Arc<dyn SecretVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn with_monitoring(mut self, monitoring: Arc<dyn MonitoringSink>) -> Self {
        self.monitoring = Some(monitoring);
        self
    }

    pub fn build(self) -> Result<BackupEngine> {
        let monitoring = self.monitoring.unwrap_or_else(|| Arc::new(LogSink));
        let pool = CpuPool::new(self.config.performance.cpu_workers);
        let backend = storage::create_backend(&self.config.storage)?;

        let services = ComponentServices {
            database: Some(Arc::new(DatabaseBackupService::new(
                self.config.database.clone(),
                self.key.clone(),
                pool.clone(),
            ))),
            files: Some(Arc::new(FileBackupService::new(
                self.config.files.clone(),
                self.key.clone(),
                pool.clone(),
                backend,
                self.config.storage.provider,
                self.config.storage.remote_prefix.clone(),
            ))),
            config: Some(Arc::new(ConfigBackupService::new(
                self.config.secrets.clone(),
                self.key,
                pool,
                self.vault,
            ))),
        };

        let orchestrator = BackupOrchestrator::new(
            services.clone(),
            monitoring.clone(),
            self.config.performance.max_concurrent_jobs,
            std::time::Duration::from_secs(self.config.performance.stop_grace_secs),
        );
        let restore = RestoreService::new(self.config.restore.clone(), services.clone(), monitoring);

        Ok(BackupEngine {
            orchestrator,
            restore,
            services,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackupComponent, BackupJob, BackupTier};
    use crate::services::orchestrator::StatusReport;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_engine_wires_and_runs_a_job() {
        let dir = TempDir::new().unwrap();
        let conn = rusqlite::Connection::open(dir.path().join("service.db")).unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t DEFAULT VALUES;")
            .unwrap();
        drop(conn);

        let mut config = EngineConfig::default();
        config.database.db_path = dir.path().join("service.db");
        config.database.backup_dir = dir.path().join("db-backups");
        config.storage.root = dir.path().join("objects");
        config.files.staging_dir = dir.path().join("staging");
        config.restore.staging_dir = dir.path().join("restore-staging");

        let engine = BackupEngine::builder(config)
            .with_encryption_key(Some(EncryptionKey::generate()))
            .build()
            .unwrap();

        let job = BackupJob::new("weekly", BackupTier::Weekly)
            .with_components([BackupComponent::Database])
            .with_compliance();
        engine.orchestrator.schedule_backup(job).await.unwrap();

        for _ in 0..200 {
            if let Ok(StatusReport::Job(result)) =
                engine.orchestrator.get_status(Some("weekly")).await
            {
                if result.status.is_terminal() {
                    assert_eq!(result.status, crate::models::BackupStatus::Verified);
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("job never finished");
    }
}
