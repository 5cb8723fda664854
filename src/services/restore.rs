//! Restore service.
//!
//! Reverses backups safely: a pre-flight gate before any mutation, a
//! rollback snapshot of the current state taken through the same component
//! services, type-specific execution, and post-restore validation that
//! automatically reverts to the snapshot on failure. The restored system is
//! always left in a known-good state, never partially applied.

use crate::config::RestoreConfig;
use crate::error::{EngineError, Result};
use crate::models::manifest::BackupManifest;
use crate::models::restore::{
    RestoreRequest, RestoreResult, RestoreStatus, RestoreType, RestoredItem, ValidationOutcome,
};
use crate::models::BackupComponent;
use crate::monitoring::{BackupMetricsEvent, MonitoringSink};
use crate::services::config_backup::ConfigBackupOptions;
use crate::services::database_backup::DatabaseBackupOptions;
use crate::services::file_backup::FileBackupOptions;
use crate::services::orchestrator::ComponentServices;
use chrono::Utc;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// How many restored files the accessibility spot check samples.
const SPOT_CHECK_SAMPLE: usize = 5;

pub struct RestoreService {
    cfg: RestoreConfig,
    services: ComponentServices,
    monitoring: Arc<dyn MonitoringSink>,
    history: Arc<RwLock<Vec<RestoreResult>>>,
    active: Arc<DashMap<String, Arc<Mutex<RestoreResult>>>>,
    /// Rollback snapshots per restore id, kept for manual rollback of a
    /// Failed restore
    snapshots: Arc<DashMap<String, Vec<(BackupComponent, BackupManifest)>>>,
    http: reqwest::Client,
}

impl RestoreService {
    pub fn new(
        cfg: RestoreConfig,
        services: ComponentServices,
        monitoring: Arc<dyn MonitoringSink>,
    ) -> Self {
        Self {
            cfg,
            services,
            monitoring,
            history: Arc::new(RwLock::new(Vec::new())),
            active: Arc::new(DashMap::new()),
            snapshots: Arc::new(DashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    fn database(&self) -> Result<&Arc<crate::services::database_backup::DatabaseBackupService>> {
        self.services.database.as_ref().ok_or_else(|| {
            EngineError::Validation("database service is not configured".into())
        })
    }

    fn files(&self) -> Result<&Arc<crate::services::file_backup::FileBackupService>> {
        self.services.files.as_ref().ok_or_else(|| {
            EngineError::Validation("files service is not configured".into())
        })
    }

    fn config(&self) -> Result<&Arc<crate::services::config_backup::ConfigBackupService>> {
        self.services.config.as_ref().ok_or_else(|| {
            EngineError::Validation("config service is not configured".into())
        })
    }

    pub async fn restore(&self, request: RestoreRequest) -> Result<RestoreResult> {
        // Explicit unsupported operations fail fast, before any bookkeeping
        match request.restore_type {
            RestoreType::DatabasePitr => {
                return Err(EngineError::NotImplemented(
                    "point-in-time recovery is not implemented; restore the closest backup with database_full instead".into(),
                ));
            }
            RestoreType::FilesSelective => {
                return Err(EngineError::NotImplemented(
                    "selective file restore is not implemented; use files_full and copy the wanted paths".into(),
                ));
            }
            _ => {}
        }

        let components = affected_components(request.restore_type);
        for component in &components {
            if !service_configured(&self.services, *component) {
                return Err(EngineError::Validation(format!(
                    "restore type '{}' needs the '{}' service, which is not configured",
                    request.restore_type, component
                )));
            }
        }

        let sources = self.resolve_sources(&request, &components).await?;

        let shared = Arc::new(Mutex::new(RestoreResult::new(&request)));
        self.active
            .insert(request.restore_id.clone(), shared.clone());
        shared.lock().await.status = RestoreStatus::InProgress;
        info!(
            restore_id = %request.restore_id,
            restore_type = %request.restore_type,
            sources = sources.len(),
            dry_run = request.dry_run,
            "Restore started"
        );

        let outcome = self.run_restore(&request, &sources, &shared).await;

        let final_result = {
            let mut result = shared.lock().await;
            if let Err(e) = outcome {
                result.status = RestoreStatus::Failed;
                result.error = Some(e.to_string());
            }
            result.finished_at = Some(Utc::now());
            result.clone()
        };

        self.history.write().await.push(final_result.clone());
        self.active.remove(&request.restore_id);

        self.monitoring
            .track_backup_metrics(&BackupMetricsEvent {
                job_id: final_result.restore_id.clone(),
                component: None,
                started_at: final_result.started_at,
                finished_at: final_result.finished_at.unwrap_or_else(Utc::now),
                size_bytes: final_result
                    .restored_items
                    .iter()
                    .map(|i| i.size_bytes)
                    .sum(),
                success: final_result.status == RestoreStatus::Completed,
                encrypted: true,
                compliant: request.compliance_required,
                error: final_result.error.clone(),
            })
            .await;

        info!(
            restore_id = %final_result.restore_id,
            status = ?final_result.status,
            items = final_result.restored_items.len(),
            warnings = final_result.warnings.len(),
            "Restore finished"
        );
        Ok(final_result)
    }

    pub async fn get_restore_status(&self, restore_id: &str) -> Option<RestoreResult> {
        if let Some(active) = self.active.get(restore_id) {
            return Some(active.lock().await.clone());
        }
        self.history
            .read()
            .await
            .iter()
            .rev()
            .find(|r| r.restore_id == restore_id)
            .cloned()
    }

    /// Past restores, newest first.
    pub async fn list_restore_history(&self, limit: Option<usize>) -> Vec<RestoreResult> {
        let history = self.history.read().await;
        let mut out: Vec<RestoreResult> = history.iter().rev().cloned().collect();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }

    /// Manually apply the rollback snapshot of a Failed restore.
    pub async fn retry_rollback(&self, restore_id: &str) -> Result<RestoreResult> {
        let mut result = self
            .get_restore_status(restore_id)
            .await
            .ok_or_else(|| EngineError::Validation(format!("unknown restore id '{}'", restore_id)))?;
        if result.status != RestoreStatus::Failed {
            return Err(EngineError::Validation(format!(
                "restore '{}' is not in a failed state",
                restore_id
            )));
        }
        let snapshots = self
            .snapshots
            .get(restore_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "restore '{}' has no rollback snapshot",
                    restore_id
                ))
            })?;

        let mut warnings = Vec::new();
        self.apply_rollback(&snapshots, &mut warnings).await?;
        result.status = RestoreStatus::RolledBack;
        result.warnings.extend(warnings);
        result.finished_at = Some(Utc::now());

        let mut history = self.history.write().await;
        if let Some(entry) = history.iter_mut().rev().find(|r| r.restore_id == restore_id) {
            *entry = result.clone();
        }
        Ok(result)
    }

    async fn run_restore(
        &self,
        request: &RestoreRequest,
        sources: &[(BackupComponent, BackupManifest)],
        shared: &Arc<Mutex<RestoreResult>>,
    ) -> Result<()> {
        // Pre-flight safety gate, before any mutation
        if request.safety_checks {
            let (outcomes, warnings) = self.preflight(request, sources).await;
            let mut result = shared.lock().await;
            result.warnings.extend(warnings);
            result.validations.extend(outcomes);
            let failed: Vec<String> = result
                .failed_validations()
                .iter()
                .map(|v| v.name.clone())
                .collect();
            if !failed.is_empty() && !request.force {
                result.status = RestoreStatus::Failed;
                result.error = Some(format!("pre-flight checks failed: {}", failed.join(", ")));
                return Ok(());
            }
            if !failed.is_empty() {
                result
                    .warnings
                    .push(format!("forced past failing pre-flight checks: {}", failed.join(", ")));
            }
        }

        // A dry run reports what would be restored and touches nothing
        if request.dry_run {
            let mut result = shared.lock().await;
            for (_, manifest) in sources {
                for record in &manifest.artifacts {
                    result.restored_items.push(RestoredItem {
                        path: record.artifact_path.clone(),
                        size_bytes: record.size_bytes,
                        dry_run: true,
                    });
                }
            }
            result
                .validations
                .push(ValidationOutcome::pass("dry_run_no_mutation"));
            result.status = RestoreStatus::Completed;
            return Ok(());
        }

        // Rollback snapshot of the current state, through the same
        // component services, before anything destructive
        let snapshots = self.take_rollback_snapshots(request, sources).await?;
        {
            let mut result = shared.lock().await;
            result.rollback_backup_id = Some(
                snapshots
                    .iter()
                    .map(|(_, m)| m.backup_id.clone())
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        self.snapshots
            .insert(request.restore_id.clone(), snapshots.clone());

        // Type-specific execution
        let mut items = Vec::new();
        let mut warnings = Vec::new();
        for (component, manifest) in sources {
            let restored = self
                .restore_component(*component, manifest, &mut warnings)
                .await?;
            items.extend(restored);
        }
        {
            let mut result = shared.lock().await;
            result.restored_items.extend(items);
            result.warnings.extend(warnings);
        }

        // Post-restore validation
        let outcomes = self.post_validate(request, sources, shared).await?;
        let failed: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.passed)
            .map(|o| o.name.clone())
            .collect();
        {
            let mut result = shared.lock().await;
            result.validations.extend(outcomes);
        }

        if failed.is_empty() {
            shared.lock().await.status = RestoreStatus::Completed;
            return Ok(());
        }

        if request.force {
            let mut result = shared.lock().await;
            result.status = RestoreStatus::Completed;
            result.warnings.push(format!(
                "post-restore validation failed but force was set: {}",
                failed.join(", ")
            ));
            return Ok(());
        }

        // Automatic rollback: the restore must never stay partially applied
        warn!(
            restore_id = %request.restore_id,
            failed = %failed.join(", "),
            "Post-restore validation failed, reverting to rollback snapshot"
        );
        let mut rollback_warnings = Vec::new();
        match self.apply_rollback(&snapshots, &mut rollback_warnings).await {
            Ok(()) => {
                let mut result = shared.lock().await;
                result.status = RestoreStatus::RolledBack;
                result.warnings.extend(rollback_warnings);
                result.error = Some(format!(
                    "post-restore validation failed ({}); reverted to rollback snapshot",
                    failed.join(", ")
                ));
            }
            Err(rollback_err) => {
                let mut result = shared.lock().await;
                result.status = RestoreStatus::Failed;
                result.warnings.extend(rollback_warnings);
                result.error = Some(format!(
                    "post-restore validation failed ({}); rollback also failed: {}",
                    failed.join(", "),
                    rollback_err
                ));
            }
        }
        Ok(())
    }

    /// Resolve the request's source backup ids (or "latest per component")
    /// to manifests.
    async fn resolve_sources(
        &self,
        request: &RestoreRequest,
        components: &[BackupComponent],
    ) -> Result<Vec<(BackupComponent, BackupManifest)>> {
        let mut sources = Vec::new();

        if request.source_backup_ids.is_empty() {
            for component in components {
                let manifest = self.latest_manifest(*component).await?.ok_or_else(|| {
                    EngineError::Validation(format!(
                        "no '{}' backup exists to restore from",
                        component
                    ))
                })?;
                sources.push((*component, manifest));
            }
            return Ok(sources);
        }

        for id in &request.source_backup_ids {
            let found = self.find_manifest(id).await?;
            match found {
                Some((component, manifest)) if components.contains(&component) => {
                    sources.push((component, manifest));
                }
                Some((component, _)) => {
                    return Err(EngineError::Validation(format!(
                        "backup '{}' is a '{}' backup and does not match restore type '{}'",
                        id, component, request.restore_type
                    )));
                }
                None => {
                    return Err(EngineError::Validation(format!(
                        "source backup '{}' not found",
                        id
                    )));
                }
            }
        }
        Ok(sources)
    }

    async fn latest_manifest(&self, component: BackupComponent) -> Result<Option<BackupManifest>> {
        match component {
            BackupComponent::Database => {
                let service = self.database()?;
                Ok(service.list_backups(Some(1)).await?.into_iter().next())
            }
            BackupComponent::Files => {
                let service = self.files()?;
                Ok(service.list_backups(Some(1)).await?.into_iter().next())
            }
            BackupComponent::Config => {
                let service = self.config()?;
                Ok(service.list_backups(Some(1)).await?.into_iter().next())
            }
        }
    }

    async fn find_manifest(
        &self,
        backup_id: &str,
    ) -> Result<Option<(BackupComponent, BackupManifest)>> {
        if let Some(service) = &self.services.database {
            if let Some(manifest) = service.find_backup(backup_id).await? {
                return Ok(Some((BackupComponent::Database, manifest)));
            }
        }
        if let Some(service) = &self.services.config {
            if let Some(manifest) = service.find_backup(backup_id).await? {
                return Ok(Some((BackupComponent::Config, manifest)));
            }
        }
        if let Some(service) = &self.services.files {
            if let Some(manifest) = service.find_backup(backup_id).await? {
                return Ok(Some((BackupComponent::Files, manifest)));
            }
        }
        Ok(None)
    }

    /// Pre-flight checks. Failures abort before mutation unless forced;
    /// advisory findings land in the warning list instead.
    async fn preflight(
        &self,
        request: &RestoreRequest,
        sources: &[(BackupComponent, BackupManifest)],
    ) -> (Vec<ValidationOutcome>, Vec<String>) {
        let mut outcomes = Vec::new();
        let mut warnings = Vec::new();

        // Integrity of every referenced source backup
        let mut integrity_errors = Vec::new();
        for (_, manifest) in sources {
            if let Err(e) = manifest.check_well_formed() {
                integrity_errors.push(e.to_string());
            }
        }
        if integrity_errors.is_empty() {
            outcomes.push(ValidationOutcome::pass("source_integrity"));
        } else {
            outcomes.push(ValidationOutcome::fail(
                "source_integrity",
                integrity_errors.join("; "),
            ));
        }

        // Dependent-service reachability
        if !self.cfg.dependent_services.is_empty() {
            match self.probe_dependents().await {
                Ok(()) => outcomes.push(ValidationOutcome::pass("dependent_services")),
                Err(e) => outcomes.push(ValidationOutcome::fail("dependent_services", e)),
            }
        }

        // Sufficient free storage, with margin
        let needed: u64 = sources.iter().map(|(_, m)| m.total_bytes).sum();
        let needed = (needed as f64 * self.cfg.free_space_margin) as u64;
        match free_space_at(&self.cfg.staging_dir) {
            Ok(free) if free >= needed => outcomes.push(ValidationOutcome::pass("free_space")),
            Ok(free) => outcomes.push(ValidationOutcome::fail(
                "free_space",
                format!("{} bytes free, {} needed", free, needed),
            )),
            Err(e) => outcomes.push(ValidationOutcome::fail(
                "free_space",
                format!("cannot determine free space: {}", e),
            )),
        }

        // Active database connections are a warning, not a blocker
        if sources
            .iter()
            .any(|(c, _)| *c == BackupComponent::Database)
        {
            if let Some(database) = &self.services.database {
                if database.has_active_sidecars() {
                    warnings.push(
                        "active database connections detected (wal/shm sidecars present)".into(),
                    );
                }
            }
        }

        // Compliance compatibility: a compliance restore only accepts
        // encrypted sources
        if request.compliance_required {
            let unencrypted: Vec<String> = sources
                .iter()
                .flat_map(|(_, m)| m.artifacts.iter())
                .filter(|a| !a.encrypted)
                .map(|a| a.artifact_path.clone())
                .collect();
            if unencrypted.is_empty() {
                outcomes.push(ValidationOutcome::pass("compliance_compatibility"));
            } else {
                outcomes.push(ValidationOutcome::fail(
                    "compliance_compatibility",
                    format!("unencrypted source artifacts: {}", unencrypted.join(", ")),
                ));
            }
        }

        (outcomes, warnings)
    }

    async fn probe_dependents(&self) -> std::result::Result<(), String> {
        let timeout = std::time::Duration::from_secs(self.cfg.health_timeout_secs);
        for url in &self.cfg.dependent_services {
            let response = self.http.get(url).timeout(timeout).send().await;
            match response {
                Ok(r) if r.status().is_success() => {}
                Ok(r) => return Err(format!("'{}' answered {}", url, r.status())),
                Err(e) => return Err(format!("'{}' unreachable: {}", url, e)),
            }
        }
        Ok(())
    }

    async fn take_rollback_snapshots(
        &self,
        request: &RestoreRequest,
        sources: &[(BackupComponent, BackupManifest)],
    ) -> Result<Vec<(BackupComponent, BackupManifest)>> {
        let label = format!("rollback-{}", request.restore_id);
        let mut snapshots = Vec::new();

        for (component, _) in sources {
            let backup = match component {
                BackupComponent::Database => {
                    let service = self.database()?;
                    service
                        .create_backup(DatabaseBackupOptions {
                            encrypt: service.has_encryption_key(),
                            job_id: Some(label.clone()),
                            ..Default::default()
                        })
                        .await?
                }
                BackupComponent::Files => {
                    let service = self.files()?;
                    service
                        .create_backup(FileBackupOptions {
                            encrypt: service.has_encryption_key(),
                            job_id: Some(label.clone()),
                            ..Default::default()
                        })
                        .await?
                }
                BackupComponent::Config => {
                    let service = self.config()?;
                    service
                        .create_backup(ConfigBackupOptions {
                            encrypt: service.has_encryption_key(),
                            job_id: Some(label.clone()),
                            ..Default::default()
                        })
                        .await?
                }
            };
            info!(
                restore_id = %request.restore_id,
                component = %component,
                rollback_backup_id = %backup.backup_id,
                "Rollback snapshot taken"
            );
            snapshots.push((*component, backup.manifest));
        }
        Ok(snapshots)
    }

    async fn restore_component(
        &self,
        component: BackupComponent,
        manifest: &BackupManifest,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<RestoredItem>> {
        match component {
            BackupComponent::Database => {
                let service = self.database()?;
                let staged = service
                    .stage_snapshot(manifest, &self.cfg.staging_dir)
                    .await?;
                service.apply_snapshot(&staged).await?;
                let _ = tokio::fs::remove_file(&staged).await;
                let size = tokio::fs::metadata(service.db_path())
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                Ok(vec![RestoredItem {
                    path: service.db_path().to_string_lossy().to_string(),
                    size_bytes: size,
                    dry_run: false,
                }])
            }
            BackupComponent::Files => {
                let service = self.files()?;
                service
                    .restore_full(manifest, &self.cfg.files_target_dir, warnings)
                    .await
            }
            BackupComponent::Config => {
                let service = self.config()?;
                service
                    .restore_full(manifest, &self.cfg.config_target_dir)
                    .await
            }
        }
    }

    async fn post_validate(
        &self,
        request: &RestoreRequest,
        sources: &[(BackupComponent, BackupManifest)],
        shared: &Arc<Mutex<RestoreResult>>,
    ) -> Result<Vec<ValidationOutcome>> {
        let mut outcomes = Vec::new();

        // Structural and referential integrity of the restored store
        if sources
            .iter()
            .any(|(c, _)| *c == BackupComponent::Database)
        {
            let service = self.database()?;
            outcomes.extend(service.validate().await?);
        }

        // Accessibility spot checks over a sample of restored files
        let items: Vec<RestoredItem> = shared.lock().await.restored_items.clone();
        let mut spot_failures = Vec::new();
        for item in items.iter().take(SPOT_CHECK_SAMPLE) {
            match std::fs::metadata(&item.path) {
                Ok(metadata) if metadata.len() == item.size_bytes => {}
                Ok(metadata) => spot_failures.push(format!(
                    "'{}' has {} bytes, expected {}",
                    item.path,
                    metadata.len(),
                    item.size_bytes
                )),
                Err(e) => spot_failures.push(format!("'{}' unreadable: {}", item.path, e)),
            }
        }
        if !items.is_empty() {
            if spot_failures.is_empty() {
                outcomes.push(ValidationOutcome::pass("file_accessibility"));
            } else {
                outcomes.push(ValidationOutcome::fail(
                    "file_accessibility",
                    spot_failures.join("; "),
                ));
            }
        }

        // Compliance re-verification: restored secrets stay owner-only
        #[cfg(unix)]
        if request.compliance_required {
            use std::os::unix::fs::PermissionsExt;
            let mut violations = Vec::new();
            for item in &items {
                if let Ok(metadata) = std::fs::metadata(&item.path) {
                    if metadata.permissions().mode() & 0o077 != 0 {
                        violations.push(item.path.clone());
                    }
                }
            }
            if violations.is_empty() {
                outcomes.push(ValidationOutcome::pass("compliance_reverification"));
            } else {
                outcomes.push(ValidationOutcome::fail(
                    "compliance_reverification",
                    format!("not owner-restricted: {}", violations.join(", ")),
                ));
            }
        }

        // Dependent-application health
        if !self.cfg.dependent_services.is_empty() {
            match self.probe_dependents().await {
                Ok(()) => outcomes.push(ValidationOutcome::pass("dependent_health")),
                Err(e) => outcomes.push(ValidationOutcome::fail("dependent_health", e)),
            }
        }

        Ok(outcomes)
    }

    async fn apply_rollback(
        &self,
        snapshots: &[(BackupComponent, BackupManifest)],
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        for (component, manifest) in snapshots {
            match component {
                BackupComponent::Database => {
                    let service = self.database()?;
                    let staged = service
                        .stage_snapshot(manifest, &self.cfg.staging_dir)
                        .await?;
                    service.apply_snapshot(&staged).await?;
                    let _ = tokio::fs::remove_file(&staged).await;
                }
                BackupComponent::Files => {
                    let service = self.files()?;
                    service
                        .restore_full(manifest, &self.cfg.files_target_dir, warnings)
                        .await?;
                }
                BackupComponent::Config => {
                    let service = self.config()?;
                    service
                        .restore_full(manifest, &self.cfg.config_target_dir)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

fn affected_components(restore_type: RestoreType) -> Vec<BackupComponent> {
    match restore_type {
        RestoreType::DatabaseFull | RestoreType::DatabasePitr => vec![BackupComponent::Database],
        RestoreType::FilesFull | RestoreType::FilesSelective => vec![BackupComponent::Files],
        RestoreType::ConfigFull => vec![BackupComponent::Config],
        RestoreType::SystemFull => vec![
            BackupComponent::Database,
            BackupComponent::Files,
            BackupComponent::Config,
        ],
    }
}

fn service_configured(services: &ComponentServices, component: BackupComponent) -> bool {
    match component {
        BackupComponent::Database => services.database.is_some(),
        BackupComponent::Files => services.files.is_some(),
        BackupComponent::Config => services.config.is_some(),
    }
}

/// Available bytes on the filesystem holding `path`.
fn free_space_at(path: &Path) -> Result<u64> {
    std::fs::create_dir_all(path)?;
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| EngineError::Storage(format!("statvfs failed: {}", e)))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}
