//! Restore requests, results and validation outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreType {
    DatabaseFull,
    /// Point-in-time recovery. Explicitly unsupported; requests fail fast.
    DatabasePitr,
    FilesFull,
    /// Selective file restore. Explicitly unsupported; requests fail fast.
    FilesSelective,
    ConfigFull,
    SystemFull,
}

impl std::fmt::Display for RestoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RestoreType::DatabaseFull => "database_full",
            RestoreType::DatabasePitr => "database_pitr",
            RestoreType::FilesFull => "files_full",
            RestoreType::FilesSelective => "files_selective",
            RestoreType::ConfigFull => "config_full",
            RestoreType::SystemFull => "system_full",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    #[serde(default = "new_restore_id")]
    pub restore_id: String,
    pub restore_type: RestoreType,
    /// Source backup execution id(s). Empty means "latest per component".
    #[serde(default)]
    pub source_backup_ids: Vec<String>,
    /// PITR target; carried for the explicit unsupported-operation error
    #[serde(default)]
    pub target_time: Option<DateTime<Utc>>,
    /// Selective-restore targets; carried for the explicit error
    #[serde(default)]
    pub target_paths: Vec<String>,
    #[serde(default = "default_true")]
    pub safety_checks: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// Skip failing safety checks and keep a failed post-validation state
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub compliance_required: bool,
}

fn new_restore_id() -> String {
    format!("restore-{}", Uuid::new_v4())
}

fn default_true() -> bool {
    true
}

impl RestoreRequest {
    pub fn new(restore_type: RestoreType) -> Self {
        Self {
            restore_id: new_restore_id(),
            restore_type,
            source_backup_ids: Vec::new(),
            target_time: None,
            target_paths: Vec::new(),
            safety_checks: true,
            dry_run: false,
            force: false,
            compliance_required: false,
        }
    }

    pub fn with_sources(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.source_backup_ids = ids.into_iter().collect();
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Pending → InProgress → Completed | Failed | RolledBack.
///
/// RolledBack is reached automatically from a failed post-validation; a
/// failed rollback leaves Failed carrying both errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoredItem {
    pub path: String,
    pub size_bytes: u64,
    /// Placeholder produced by a dry run; nothing was written
    pub dry_run: bool,
}

/// Named safety or post-restore check outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub name: String,
    pub passed: bool,
    pub message: Option<String>,
}

impl ValidationOutcome {
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: None,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResult {
    pub restore_id: String,
    pub restore_type: RestoreType,
    pub status: RestoreStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub restored_items: Vec<RestoredItem>,
    pub validations: Vec<ValidationOutcome>,
    /// Rollback snapshot taken before the destructive step
    pub rollback_backup_id: Option<String>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

impl RestoreResult {
    pub fn new(request: &RestoreRequest) -> Self {
        Self {
            restore_id: request.restore_id.clone(),
            restore_type: request.restore_type,
            status: RestoreStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            restored_items: Vec::new(),
            validations: Vec::new(),
            rollback_backup_id: None,
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn failed_validations(&self) -> Vec<&ValidationOutcome> {
        self.validations.iter().filter(|v| !v.passed).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let req = RestoreRequest::new(RestoreType::FilesFull);
        assert!(req.safety_checks);
        assert!(!req.dry_run);
        assert!(!req.force);
        assert!(req.restore_id.starts_with("restore-"));
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let req: RestoreRequest =
            serde_json::from_str(r#"{"restore_type": "database_full"}"#).unwrap();
        assert!(req.safety_checks);
        assert!(req.source_backup_ids.is_empty());
    }

    #[test]
    fn test_failed_validations_filter() {
        let mut result = RestoreResult::new(&RestoreRequest::new(RestoreType::ConfigFull));
        result.validations.push(ValidationOutcome::pass("integrity"));
        result
            .validations
            .push(ValidationOutcome::fail("health", "service unreachable"));
        let failed = result.failed_validations();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name, "health");
    }
}
