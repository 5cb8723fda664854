//! Monitoring collaborator seam.
//!
//! The engine reports every completed or failed operation through this
//! trait; alert delivery, dashboards and RTO/RPO tracking live outside the
//! engine.

use crate::models::backup_job::BackupComponent;
use crate::storage::StorageProvider;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetricsEvent {
    pub job_id: String,
    pub component: Option<BackupComponent>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub success: bool,
    pub encrypted: bool,
    pub compliant: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageTotals {
    pub object_count: u64,
    pub total_bytes: u64,
}

#[async_trait]
pub trait MonitoringSink: Send + Sync {
    async fn track_backup_metrics(&self, event: &BackupMetricsEvent);
    async fn track_storage_metrics(&self, provider: StorageProvider, totals: &StorageTotals);
}

/// Default sink: structured log lines only.
pub struct LogSink;

#[async_trait]
impl MonitoringSink for LogSink {
    async fn track_backup_metrics(&self, event: &BackupMetricsEvent) {
        let duration_secs = (event.finished_at - event.started_at).num_seconds();
        match (&event.component, event.success) {
            (Some(component), true) => tracing::info!(
                job_id = %event.job_id,
                component = %component,
                size_bytes = event.size_bytes,
                duration_secs,
                encrypted = event.encrypted,
                compliant = event.compliant,
                "Component backup completed"
            ),
            (Some(component), false) => tracing::warn!(
                job_id = %event.job_id,
                component = %component,
                duration_secs,
                error = event.error.as_deref().unwrap_or("unknown"),
                "Component backup failed"
            ),
            (None, true) => tracing::info!(
                job_id = %event.job_id,
                size_bytes = event.size_bytes,
                duration_secs,
                compliant = event.compliant,
                "Backup job finished"
            ),
            (None, false) => tracing::warn!(
                job_id = %event.job_id,
                duration_secs,
                error = event.error.as_deref().unwrap_or("unknown"),
                "Backup job failed"
            ),
        }
    }

    async fn track_storage_metrics(&self, provider: StorageProvider, totals: &StorageTotals) {
        tracing::info!(
            provider = %provider,
            objects = totals.object_count,
            total_bytes = totals.total_bytes,
            "Storage totals"
        );
    }
}
