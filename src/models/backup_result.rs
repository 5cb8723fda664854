//! Backup execution results and run history records.

use crate::models::backup_job::BackupComponent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle of one backup execution.
///
/// Pending → InProgress → Failed, or → Completed → (integrity + compliance
/// gate) → Verified | Failed. Corrupted is reached when a later integrity
/// re-check finds a tampered artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Verified,
    Corrupted,
}

impl BackupStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BackupStatus::Verified | BackupStatus::Failed | BackupStatus::Corrupted
        )
    }
}

/// Result of one backup execution. Created at job start, updated as
/// components finish, finalized once, then appended to the job history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupResult {
    /// Execution identifier (embeds the UTC start timestamp)
    pub backup_id: String,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: BackupStatus,
    pub component_success: BTreeMap<BackupComponent, bool>,
    pub artifact_paths: Vec<String>,
    pub total_size_bytes: u64,
    /// SHA-256 over the sorted per-artifact checksums
    pub aggregate_checksum: Option<String>,
    pub error: Option<String>,
    pub compliance_verified: bool,
}

impl BackupResult {
    pub fn new(backup_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            backup_id: backup_id.into(),
            job_id: job_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: BackupStatus::Pending,
            component_success: BTreeMap::new(),
            artifact_paths: Vec::new(),
            total_size_bytes: 0,
            aggregate_checksum: None,
            error: None,
            compliance_verified: false,
        }
    }

    pub fn all_components_succeeded(&self) -> bool {
        !self.component_success.is_empty() && self.component_success.values().all(|ok| *ok)
    }
}

/// Aggregate view returned by `get_status` when no job id is given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub active_jobs: usize,
    pub total_runs: usize,
    pub verified: usize,
    pub failed: usize,
    pub corrupted: usize,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(BackupStatus::Verified.is_terminal());
        assert!(BackupStatus::Failed.is_terminal());
        assert!(BackupStatus::Corrupted.is_terminal());
        assert!(!BackupStatus::InProgress.is_terminal());
        assert!(!BackupStatus::Pending.is_terminal());
    }

    #[test]
    fn test_all_components_succeeded() {
        let mut result = BackupResult::new("db-x", "daily");
        assert!(!result.all_components_succeeded());

        result
            .component_success
            .insert(BackupComponent::Database, true);
        result.component_success.insert(BackupComponent::Files, true);
        assert!(result.all_components_succeeded());

        result
            .component_success
            .insert(BackupComponent::Config, false);
        assert!(!result.all_components_succeeded());
    }
}
