//! Backup orchestrator.
//!
//! Validates jobs, runs their component backups concurrently, enforces the
//! aggregate integrity and compliance gate, and owns the active-execution
//! registry, the append-only run history and retention cleanup. Two
//! executions of the same job id never run concurrently.

use crate::crypto;
use crate::error::{EngineError, Result};
use crate::models::backup_result::{BackupResult, BackupStatus, RunSummary};
use crate::models::manifest::BackupManifest;
use crate::models::{BackupComponent, BackupJob, BackupTier, DatabaseBackupKind};
use crate::monitoring::{BackupMetricsEvent, MonitoringSink, StorageTotals};
use crate::services::config_backup::{ConfigBackupOptions, ConfigBackupService};
use crate::services::database_backup::{DatabaseBackupOptions, DatabaseBackupService};
use crate::services::file_backup::{FileBackupOptions, FileBackupService};
use crate::services::ComponentBackup;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Component services available to the orchestrator. A job may only request
/// components that are wired here.
#[derive(Clone, Default)]
pub struct ComponentServices {
    pub database: Option<Arc<DatabaseBackupService>>,
    pub files: Option<Arc<FileBackupService>>,
    pub config: Option<Arc<ConfigBackupService>>,
}

impl ComponentServices {
    fn is_configured(&self, component: BackupComponent) -> bool {
        match component {
            BackupComponent::Database => self.database.is_some(),
            BackupComponent::Files => self.files.is_some(),
            BackupComponent::Config => self.config.is_some(),
        }
    }
}

/// One in-flight execution in the registry.
struct ActiveExecution {
    backup_id: String,
    cancel: CancellationToken,
    result: Arc<Mutex<BackupResult>>,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

/// Answer of `get_status`.
#[derive(Debug, Clone)]
pub enum StatusReport {
    Job(BackupResult),
    Summary(RunSummary),
}

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub examined: usize,
    pub deleted_backups: usize,
}

pub struct BackupOrchestrator {
    services: ComponentServices,
    monitoring: Arc<dyn MonitoringSink>,
    history: Arc<RwLock<Vec<BackupResult>>>,
    /// Manifests per execution, kept for the integrity re-check
    manifest_index: Arc<RwLock<HashMap<String, Vec<BackupManifest>>>>,
    active: Arc<DashMap<String, Arc<ActiveExecution>>>,
    job_slots: Arc<Semaphore>,
    stop_grace: std::time::Duration,
}

impl BackupOrchestrator {
    pub fn new(
        services: ComponentServices,
        monitoring: Arc<dyn MonitoringSink>,
        max_concurrent_jobs: usize,
        stop_grace: std::time::Duration,
    ) -> Self {
        Self {
            services,
            monitoring,
            history: Arc::new(RwLock::new(Vec::new())),
            manifest_index: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(DashMap::new()),
            job_slots: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            stop_grace,
        }
    }

    /// Validate a job and launch its execution. Returns the execution's
    /// backup id; the job queues behind the concurrency cap in arrival
    /// order. A job id that is already active is rejected.
    pub async fn schedule_backup(&self, job: BackupJob) -> Result<String> {
        job.validate()?;
        for component in job.components() {
            if !self.services.is_configured(*component) {
                return Err(EngineError::Validation(format!(
                    "job '{}': no service configured for component '{}'",
                    job.id(),
                    component
                )));
            }
        }

        let backup_id = crate::services::artifact::execution_id("run");
        let mut result = BackupResult::new(&backup_id, job.id());
        result.status = BackupStatus::Pending;

        let execution = Arc::new(ActiveExecution {
            backup_id: backup_id.clone(),
            cancel: CancellationToken::new(),
            result: Arc::new(Mutex::new(result)),
            handle: StdMutex::new(None),
        });

        // Insert-if-absent keyed by job id is the mutual exclusion point
        match self.active.entry(job.id().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::Validation(format!(
                    "job '{}' is already active",
                    job.id()
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(execution.clone());
            }
        }

        let ctx = ExecutionContext {
            services: self.services.clone(),
            monitoring: self.monitoring.clone(),
            history: self.history.clone(),
            manifest_index: self.manifest_index.clone(),
            active: self.active.clone(),
            job_slots: self.job_slots.clone(),
        };
        let exec = execution.clone();
        let handle = tokio::spawn(async move {
            ctx.run_job(job, exec).await;
        });
        *execution.handle.lock().expect("handle mutex poisoned") = Some(handle);

        Ok(backup_id)
    }

    /// Status of one job (running or last finished), or the overall summary
    /// when no job id is given.
    pub async fn get_status(&self, job_id: Option<&str>) -> Result<StatusReport> {
        match job_id {
            Some(job_id) => {
                if let Some(execution) = self.active.get(job_id) {
                    let result = execution.result.lock().await.clone();
                    return Ok(StatusReport::Job(result));
                }
                let history = self.history.read().await;
                history
                    .iter()
                    .rev()
                    .find(|r| r.job_id == job_id)
                    .cloned()
                    .map(StatusReport::Job)
                    .ok_or_else(|| {
                        EngineError::Validation(format!("unknown job id '{}'", job_id))
                    })
            }
            None => {
                let history = self.history.read().await;
                let summary = RunSummary {
                    active_jobs: self.active.len(),
                    total_runs: history.len(),
                    verified: history
                        .iter()
                        .filter(|r| r.status == BackupStatus::Verified)
                        .count(),
                    failed: history
                        .iter()
                        .filter(|r| r.status == BackupStatus::Failed)
                        .count(),
                    corrupted: history
                        .iter()
                        .filter(|r| r.status == BackupStatus::Corrupted)
                        .count(),
                    last_run_at: history.last().map(|r| r.started_at),
                };
                Ok(StatusReport::Summary(summary))
            }
        }
    }

    /// Full run history, oldest first.
    pub async fn history(&self) -> Vec<BackupResult> {
        self.history.read().await.clone()
    }

    /// Re-run the integrity pass over a recorded execution. A mismatch
    /// flips the stored result to Corrupted; it can never become Verified
    /// again.
    pub async fn verify_backup(&self, backup_id: &str) -> Result<BackupStatus> {
        let manifests = {
            let index = self.manifest_index.read().await;
            index.get(backup_id).cloned()
        }
        .ok_or_else(|| {
            EngineError::Validation(format!("unknown backup id '{}'", backup_id))
        })?;

        match verify_artifacts(&self.services, &manifests).await {
            Ok(_) => Ok(BackupStatus::Verified),
            Err(EngineError::Integrity(message)) => {
                warn!(backup_id = %backup_id, "Integrity re-check failed: {}", message);
                let mut history = self.history.write().await;
                if let Some(result) = history.iter_mut().find(|r| r.backup_id == backup_id) {
                    result.status = BackupStatus::Corrupted;
                    result.error = Some(message);
                }
                Ok(BackupStatus::Corrupted)
            }
            Err(e) => Err(e),
        }
    }

    /// Cooperatively cancel every active execution, wait up to the grace
    /// period, then force-abandon and log the stragglers.
    pub async fn stop(&self) {
        let executions: Vec<(String, Arc<ActiveExecution>)> = self
            .active
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        if executions.is_empty() {
            return;
        }
        info!(active = executions.len(), "Stopping orchestrator");
        for (_, execution) in &executions {
            execution.cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + self.stop_grace;
        while !self.active.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        for (job_id, execution) in executions {
            if self.active.remove(&job_id).is_some() {
                if let Some(handle) = execution.handle.lock().expect("handle mutex poisoned").take()
                {
                    handle.abort();
                }
                warn!(
                    job_id = %job_id,
                    backup_id = %execution.backup_id,
                    "Force-abandoned execution after stop grace period"
                );
            }
        }
    }

    /// Delete executions whose artifacts are all past retention. Safe to
    /// call repeatedly; a second pass with no new backups deletes nothing.
    pub async fn cleanup_expired(&self) -> Result<CleanupReport> {
        let now = Utc::now();
        let mut report = CleanupReport::default();
        let mut deleted_ids = Vec::new();

        if let Some(database) = &self.services.database {
            for manifest in database.list_backups(None).await? {
                report.examined += 1;
                if manifest.expired_at(now) {
                    database.delete_backup(&manifest.backup_id).await?;
                    deleted_ids.push(manifest.backup_id);
                    report.deleted_backups += 1;
                }
            }
        }
        if let Some(files) = &self.services.files {
            for manifest in files.list_backups(None).await? {
                report.examined += 1;
                if manifest.expired_at(now) {
                    files.delete_backup(&manifest.backup_id).await?;
                    deleted_ids.push(manifest.backup_id);
                    report.deleted_backups += 1;
                }
            }
        }
        if let Some(config) = &self.services.config {
            for manifest in config.list_backups(None).await? {
                report.examined += 1;
                if manifest.expired_at(now) {
                    config.delete_backup(&manifest.backup_id).await?;
                    deleted_ids.push(manifest.backup_id);
                    report.deleted_backups += 1;
                }
            }
        }

        if !deleted_ids.is_empty() {
            let mut index = self.manifest_index.write().await;
            index.retain(|_, manifests| {
                !manifests
                    .iter()
                    .all(|m| deleted_ids.contains(&m.backup_id))
            });
            info!(deleted = report.deleted_backups, "Expired backups removed");
        }
        Ok(report)
    }
}

/// Everything a spawned execution needs, detached from the orchestrator's
/// lifetime.
struct ExecutionContext {
    services: ComponentServices,
    monitoring: Arc<dyn MonitoringSink>,
    history: Arc<RwLock<Vec<BackupResult>>>,
    manifest_index: Arc<RwLock<HashMap<String, Vec<BackupManifest>>>>,
    active: Arc<DashMap<String, Arc<ActiveExecution>>>,
    job_slots: Arc<Semaphore>,
}

impl ExecutionContext {
    async fn run_job(&self, job: BackupJob, execution: Arc<ActiveExecution>) {
        // Queue behind the concurrency cap; the semaphore is fair, so
        // arrival order is preserved
        let _slot = match self.job_slots.acquire().await {
            Ok(slot) => slot,
            Err(_) => {
                self.finish_failed(&job, &execution, "orchestrator shut down".into()).await;
                return;
            }
        };
        if execution.cancel.is_cancelled() {
            self.finish_failed(&job, &execution, "cancelled before start".into()).await;
            return;
        }

        execution.result.lock().await.status = BackupStatus::InProgress;
        info!(job_id = %job.id(), backup_id = %execution.backup_id, tier = %job.tier(), "Backup job started");

        let outcomes = self.run_components(&job, &execution).await;

        let mut manifests = Vec::new();
        let mut failures = Vec::new();
        {
            let mut result = execution.result.lock().await;
            for (component, outcome) in outcomes {
                match outcome {
                    Ok(backup) => {
                        result.component_success.insert(component, backup.success);
                        result.artifact_paths.extend(backup.artifact_paths.clone());
                        result.total_size_bytes += backup.total_bytes;
                        if !backup.success {
                            failures.push(format!(
                                "{}: {}",
                                component,
                                backup.error.as_deref().unwrap_or("failed")
                            ));
                        }
                        manifests.push(backup.manifest);
                    }
                    Err(e) => {
                        result.component_success.insert(component, false);
                        failures.push(format!("{}: {}", component, e));
                    }
                }
            }
        }

        self.manifest_index
            .write()
            .await
            .insert(execution.backup_id.clone(), manifests.clone());

        let all_ok = failures.is_empty()
            && execution.result.lock().await.all_components_succeeded();

        if all_ok {
            // Aggregate pass: integrity first, then compliance. Either
            // failure overrides the component-level success.
            match verify_artifacts(&self.services, &manifests).await {
                Ok(aggregate_checksum) => {
                    let compliance = if job.compliance_required() {
                        check_compliance(&manifests)
                    } else {
                        Ok(())
                    };
                    let mut result = execution.result.lock().await;
                    match compliance {
                        Ok(()) => {
                            result.status = BackupStatus::Verified;
                            result.aggregate_checksum = Some(aggregate_checksum);
                            result.compliance_verified = true;
                        }
                        Err(e) => {
                            result.status = BackupStatus::Failed;
                            result.error = Some(e.to_string());
                            error!(job_id = %job.id(), "Compliance check failed: {}", e);
                        }
                    }
                }
                Err(e) => {
                    let mut result = execution.result.lock().await;
                    result.status = BackupStatus::Failed;
                    result.error = Some(e.to_string());
                    error!(job_id = %job.id(), "Aggregate integrity check failed: {}", e);
                }
            }
        } else {
            let mut result = execution.result.lock().await;
            result.status = BackupStatus::Failed;
            result.error = Some(failures.join("; "));
        }

        self.finalize(&job, &execution).await;
    }

    /// Component backups within one job run concurrently; ordering between
    /// them is not guaranteed.
    async fn run_components(
        &self,
        job: &BackupJob,
        execution: &Arc<ActiveExecution>,
    ) -> Vec<(BackupComponent, Result<ComponentBackup>)> {
        let mut futures = Vec::new();

        for component in job.components().iter().copied() {
            let services = self.services.clone();
            let monitoring = self.monitoring.clone();
            let job_id = job.id().to_string();
            let encrypt = job.encryption_enabled();
            let compress = job.compression_enabled();
            let retention_days = job.retention_days();
            let compliance = job.compliance_required();
            let tier = job.tier();
            let cancel = execution.cancel.child_token();

            futures.push(async move {
                let started_at = Utc::now();
                let missing = || {
                    Err(EngineError::Validation(format!(
                        "no service configured for component '{}'",
                        component
                    )))
                };
                let outcome = match component {
                    BackupComponent::Database => match services.database {
                        // Narrow tiers ride the change sequence; wide tiers
                        // always take a full snapshot
                        Some(service) => {
                            let kind = match tier {
                                BackupTier::Hourly => DatabaseBackupKind::Incremental,
                                BackupTier::Daily => DatabaseBackupKind::Differential,
                                _ => DatabaseBackupKind::Full,
                            };
                            service
                                .create_backup(DatabaseBackupOptions {
                                    kind,
                                    encrypt,
                                    compress,
                                    retention_days,
                                    job_id: Some(job_id.clone()),
                                    cancel,
                                })
                                .await
                        }
                        None => missing(),
                    },
                    BackupComponent::Files => match services.files {
                        Some(service) => {
                            service
                                .create_backup(FileBackupOptions {
                                    incremental: false,
                                    encrypt,
                                    compress,
                                    retention_days,
                                    job_id: Some(job_id.clone()),
                                    cancel,
                                })
                                .await
                        }
                        None => missing(),
                    },
                    BackupComponent::Config => match services.config {
                        Some(service) => {
                            service
                                .create_backup(ConfigBackupOptions {
                                    encrypt,
                                    compress,
                                    retention_days,
                                    job_id: Some(job_id.clone()),
                                    cancel,
                                })
                                .await
                        }
                        None => missing(),
                    },
                };

                let event = BackupMetricsEvent {
                    job_id,
                    component: Some(component),
                    started_at,
                    finished_at: Utc::now(),
                    size_bytes: outcome.as_ref().map(|b| b.total_bytes).unwrap_or(0),
                    success: outcome.as_ref().map(|b| b.success).unwrap_or(false),
                    encrypted: encrypt,
                    compliant: compliance,
                    error: outcome.as_ref().err().map(|e| e.to_string()),
                };
                monitoring.track_backup_metrics(&event).await;

                (component, outcome)
            });
        }

        join_all(futures).await
    }

    async fn finish_failed(&self, job: &BackupJob, execution: &Arc<ActiveExecution>, reason: String) {
        {
            let mut result = execution.result.lock().await;
            result.status = BackupStatus::Failed;
            result.error = Some(reason);
        }
        self.finalize(job, execution).await;
    }

    /// Seal the result, append it to the history, report metrics, and free
    /// the job id for the next execution.
    async fn finalize(&self, job: &BackupJob, execution: &Arc<ActiveExecution>) {
        let final_result = {
            let mut result = execution.result.lock().await;
            result.finished_at = Some(Utc::now());
            result.clone()
        };

        self.history.write().await.push(final_result.clone());
        self.active.remove(job.id());

        self.monitoring
            .track_backup_metrics(&BackupMetricsEvent {
                job_id: job.id().to_string(),
                component: None,
                started_at: final_result.started_at,
                finished_at: final_result.finished_at.unwrap_or_else(Utc::now),
                size_bytes: final_result.total_size_bytes,
                success: final_result.status == BackupStatus::Verified,
                encrypted: job.encryption_enabled(),
                compliant: final_result.compliance_verified,
                error: final_result.error.clone(),
            })
            .await;

        if let Some(files) = &self.services.files {
            if let Ok(objects) = files.backend().list_files("").await {
                let totals = StorageTotals {
                    object_count: objects.len() as u64,
                    total_bytes: objects.iter().map(|o| o.size).sum(),
                };
                self.monitoring
                    .track_storage_metrics(files.provider(), &totals)
                    .await;
            }
        }

        info!(
            job_id = %job.id(),
            backup_id = %final_result.backup_id,
            status = ?final_result.status,
            total_bytes = final_result.total_size_bytes,
            "Backup job finished"
        );
    }
}

/// Recompute every artifact's checksum against its manifest and derive the
/// aggregate checksum (SHA-256 over the sorted per-artifact checksums).
async fn verify_artifacts(
    services: &ComponentServices,
    manifests: &[BackupManifest],
) -> Result<String> {
    let mut checksums = Vec::new();

    for manifest in manifests {
        for record in &manifest.artifacts {
            let bytes = match manifest.component {
                // File artifacts live on the storage backend
                BackupComponent::Files => {
                    let files = services.files.as_ref().ok_or_else(|| {
                        EngineError::Validation("files service not configured".into())
                    })?;
                    let scratch = std::env::temp_dir().join(format!(
                        ".verify-{}",
                        uuid::Uuid::new_v4().simple()
                    ));
                    files
                        .backend()
                        .download_file(&record.artifact_path, &scratch)
                        .await?;
                    let bytes = tokio::fs::read(&scratch).await?;
                    let _ = tokio::fs::remove_file(&scratch).await;
                    bytes
                }
                _ => tokio::fs::read(&record.artifact_path).await?,
            };

            let actual = crypto::sha256_hex(&bytes);
            if actual != record.checksum {
                return Err(EngineError::Integrity(format!(
                    "artifact '{}' checksum mismatch: expected {}, got {}",
                    record.artifact_path, record.checksum, actual
                )));
            }
            checksums.push(actual);
        }
    }

    checksums.sort();
    Ok(crypto::sha256_hex(checksums.join("").as_bytes()))
}

/// Every artifact of a compliance job must be encrypted, and local
/// artifacts must be owner-restricted on disk.
fn check_compliance(manifests: &[BackupManifest]) -> Result<()> {
    for manifest in manifests {
        for record in &manifest.artifacts {
            if !record.encrypted {
                return Err(EngineError::Compliance(format!(
                    "artifact '{}' is not encrypted",
                    record.artifact_path
                )));
            }
            #[cfg(unix)]
            if manifest.component != BackupComponent::Files {
                use std::os::unix::fs::PermissionsExt;
                let metadata = std::fs::metadata(&record.artifact_path)?;
                if metadata.permissions().mode() & 0o077 != 0 {
                    return Err(EngineError::Compliance(format!(
                        "artifact '{}' is not owner-restricted",
                        record.artifact_path
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigBackupConfig, DatabaseConfig, FileBackupConfig};
    use crate::crypto::EncryptionKey;
    use crate::models::BackupTier;
    use crate::monitoring::LogSink;
    use crate::services::artifact::CpuPool;
    use crate::storage::{LocalStorage, StorageProvider};
    use tempfile::TempDir;

    fn seed_workspace(dir: &TempDir) {
        let conn = rusqlite::Connection::open(dir.path().join("service.db")).unwrap();
        conn.execute_batch(
            "CREATE TABLE records (id INTEGER PRIMARY KEY, body TEXT);
             INSERT INTO records (body) VALUES ('one'), ('two');",
        )
        .unwrap();

        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("report.txt"), b"report body").unwrap();

        let etc = dir.path().join("etc");
        std::fs::create_dir_all(&etc).unwrap();
        std::fs::write(etc.join("app.toml"), b"[app]\nport = 1\n").unwrap();
    }

    fn orchestrator(dir: &TempDir, key: Option<EncryptionKey>) -> BackupOrchestrator {
        let pool = CpuPool::new(2);
        let backend = Arc::new(LocalStorage::new(dir.path().join("objects")).unwrap());

        let services = ComponentServices {
            database: Some(Arc::new(DatabaseBackupService::new(
                DatabaseConfig {
                    db_path: dir.path().join("service.db"),
                    backup_dir: dir.path().join("db-backups"),
                },
                key.clone(),
                pool.clone(),
            ))),
            files: Some(Arc::new(FileBackupService::new(
                FileBackupConfig {
                    roots: vec![dir.path().join("data")],
                    staging_dir: dir.path().join("staging"),
                    ..Default::default()
                },
                key.clone(),
                pool.clone(),
                backend,
                StorageProvider::Local,
                "file-backups".to_string(),
            ))),
            config: Some(Arc::new(ConfigBackupService::new(
                ConfigBackupConfig {
                    roots: vec![dir.path().join("etc")],
                    backup_dir: dir.path().join("config-backups"),
                    include_env: false,
                    ..Default::default()
                },
                key,
                pool,
                None,
            ))),
        };

        BackupOrchestrator::new(
            services,
            Arc::new(LogSink),
            2,
            std::time::Duration::from_secs(5),
        )
    }

    async fn wait_terminal(orchestrator: &BackupOrchestrator, job_id: &str) -> BackupResult {
        for _ in 0..200 {
            if let Ok(StatusReport::Job(result)) = orchestrator.get_status(Some(job_id)).await {
                if result.status.is_terminal() {
                    return result;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("job '{}' did not reach a terminal status", job_id);
    }

    #[tokio::test]
    async fn test_full_job_reaches_verified() {
        let dir = TempDir::new().unwrap();
        seed_workspace(&dir);
        let orchestrator = orchestrator(&dir, Some(EncryptionKey::generate()));

        let job = BackupJob::new("daily", BackupTier::Daily)
            .with_components([
                BackupComponent::Database,
                BackupComponent::Files,
                BackupComponent::Config,
            ])
            .with_compliance();
        orchestrator.schedule_backup(job).await.unwrap();

        let result = wait_terminal(&orchestrator, "daily").await;
        assert_eq!(result.status, BackupStatus::Verified);
        assert!(result.compliance_verified);
        assert!(result.aggregate_checksum.is_some());
        assert_eq!(result.component_success.len(), 3);
        assert!(result.all_components_succeeded());
        assert!(!result.artifact_paths.is_empty());
    }

    #[tokio::test]
    async fn test_validation_rejects_unconfigured_component() {
        let dir = TempDir::new().unwrap();
        seed_workspace(&dir);
        let pool = CpuPool::new(2);
        let services = ComponentServices {
            database: Some(Arc::new(DatabaseBackupService::new(
                DatabaseConfig {
                    db_path: dir.path().join("service.db"),
                    backup_dir: dir.path().join("db-backups"),
                },
                Some(EncryptionKey::generate()),
                pool,
            ))),
            files: None,
            config: None,
        };
        let orchestrator = BackupOrchestrator::new(
            services,
            Arc::new(LogSink),
            2,
            std::time::Duration::from_secs(5),
        );

        let job = BackupJob::new("daily", BackupTier::Daily)
            .with_components([BackupComponent::Database, BackupComponent::Files]);
        assert!(matches!(
            orchestrator.schedule_backup(job).await,
            Err(EngineError::Validation(_))
        ));
        // Fail-fast: nothing was registered or recorded
        assert!(orchestrator.active.is_empty());
        assert!(orchestrator.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_same_job_id_is_mutually_exclusive() {
        let dir = TempDir::new().unwrap();
        seed_workspace(&dir);
        let orchestrator = orchestrator(&dir, Some(EncryptionKey::generate()));

        let job = BackupJob::new("hourly", BackupTier::Hourly)
            .with_components([BackupComponent::Database]);
        orchestrator.schedule_backup(job.clone()).await.unwrap();

        // Second schedule of the same job id while the first is active
        let err = orchestrator.schedule_backup(job).await.unwrap_err();
        assert!(err.to_string().contains("already active"));

        let result = wait_terminal(&orchestrator, "hourly").await;
        assert_eq!(result.status, BackupStatus::Verified);

        // Once finished, the id is free again
        let job = BackupJob::new("hourly", BackupTier::Hourly)
            .with_components([BackupComponent::Database]);
        orchestrator.schedule_backup(job).await.unwrap();
        wait_terminal(&orchestrator, "hourly").await;
    }

    #[tokio::test]
    async fn test_tampering_flips_verified_to_corrupted() {
        let dir = TempDir::new().unwrap();
        seed_workspace(&dir);
        let orchestrator = orchestrator(&dir, Some(EncryptionKey::generate()));

        let backup_id = orchestrator
            .schedule_backup(
                BackupJob::new("daily", BackupTier::Daily)
                    .with_components([BackupComponent::Database]),
            )
            .await
            .unwrap();
        let result = wait_terminal(&orchestrator, "daily").await;
        assert_eq!(result.status, BackupStatus::Verified);

        // Unchanged artifacts still verify
        assert_eq!(
            orchestrator.verify_backup(&backup_id).await.unwrap(),
            BackupStatus::Verified
        );

        // Flip one byte of the artifact
        let victim = &result.artifact_paths[0];
        let mut bytes = std::fs::read(victim).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        std::fs::write(victim, &bytes).unwrap();

        assert_eq!(
            orchestrator.verify_backup(&backup_id).await.unwrap(),
            BackupStatus::Corrupted
        );
        let history = orchestrator.history().await;
        assert_eq!(history.last().unwrap().status, BackupStatus::Corrupted);
    }

    #[tokio::test]
    async fn test_cleanup_expired_is_idempotent() {
        let dir = TempDir::new().unwrap();
        seed_workspace(&dir);
        let orchestrator = orchestrator(&dir, Some(EncryptionKey::generate()));

        // Retention of one day, backdated artifacts expire immediately is
        // not constructible through the public API, so run with a short
        // retention and rewrite the manifest's retention timestamps.
        orchestrator
            .schedule_backup(
                BackupJob::new("daily", BackupTier::Daily)
                    .with_components([BackupComponent::Database]),
            )
            .await
            .unwrap();
        wait_terminal(&orchestrator, "daily").await;

        let db_backups = dir.path().join("db-backups");
        for entry in std::fs::read_dir(&db_backups).unwrap() {
            let manifest_path = entry.unwrap().path().join("manifest.json");
            let mut manifest =
                crate::models::manifest::BackupManifest::read(&manifest_path).unwrap();
            for artifact in &mut manifest.artifacts {
                artifact.retention_until = Utc::now() - chrono::Duration::days(1);
            }
            manifest
                .write_atomic(manifest_path.parent().unwrap())
                .unwrap();
        }

        let first = orchestrator.cleanup_expired().await.unwrap();
        assert_eq!(first.deleted_backups, 1);

        let second = orchestrator.cleanup_expired().await.unwrap();
        assert_eq!(second.deleted_backups, 0);
    }

    #[tokio::test]
    async fn test_stop_with_no_active_jobs_returns_quickly() {
        let dir = TempDir::new().unwrap();
        seed_workspace(&dir);
        let orchestrator = orchestrator(&dir, Some(EncryptionKey::generate()));
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_job() {
        let dir = TempDir::new().unwrap();
        seed_workspace(&dir);
        let orchestrator = orchestrator(&dir, Some(EncryptionKey::generate()));

        orchestrator
            .schedule_backup(
                BackupJob::new("daily", BackupTier::Daily)
                    .with_components([BackupComponent::Database]),
            )
            .await
            .unwrap();

        orchestrator.stop().await;
        assert!(orchestrator.active.is_empty());
        // The job either completed or was cancelled; both leave a record
        let history = orchestrator.history().await;
        assert_eq!(history.len(), 1);
    }
}
