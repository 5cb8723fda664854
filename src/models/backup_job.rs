//! Backup job definitions: tiers, components and the job structure.
//!
//! `BackupJob` keeps its fields private so the compliance invariant
//! (compliance required ⇒ encryption enabled) cannot be broken by
//! construction; deserialization funnels through the same check.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Backup cadence / retention class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupTier {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl BackupTier {
    /// Default retention period for the tier, in days.
    pub fn default_retention_days(&self) -> i64 {
        match self {
            BackupTier::Hourly => 2,
            BackupTier::Daily => 30,
            BackupTier::Weekly => 90,
            BackupTier::Monthly => 365,
            BackupTier::Yearly => 2555, // 7 years, regulated retention floor
        }
    }

    /// Default component set for the tier. Hourly runs touch only the
    /// database; wider tiers cover everything.
    pub fn default_components(&self) -> BTreeSet<BackupComponent> {
        match self {
            BackupTier::Hourly => BTreeSet::from([BackupComponent::Database]),
            BackupTier::Daily => BTreeSet::from([
                BackupComponent::Database,
                BackupComponent::Files,
            ]),
            _ => BTreeSet::from([
                BackupComponent::Database,
                BackupComponent::Files,
                BackupComponent::Config,
            ]),
        }
    }
}

impl std::fmt::Display for BackupTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackupTier::Hourly => "hourly",
            BackupTier::Daily => "daily",
            BackupTier::Weekly => "weekly",
            BackupTier::Monthly => "monthly",
            BackupTier::Yearly => "yearly",
        };
        f.write_str(s)
    }
}

/// Component of the operational state covered by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupComponent {
    Database,
    Files,
    Config,
}

impl std::fmt::Display for BackupComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackupComponent::Database => "database",
            BackupComponent::Files => "files",
            BackupComponent::Config => "config",
        };
        f.write_str(s)
    }
}

/// A scheduled backup job. Immutable once handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawBackupJob", into = "RawBackupJob")]
pub struct BackupJob {
    id: String,
    tier: BackupTier,
    components: BTreeSet<BackupComponent>,
    /// Opaque schedule descriptor, parsed and evaluated by the external
    /// scheduler only.
    schedule: Option<String>,
    retention_days: i64,
    encryption_enabled: bool,
    compression_enabled: bool,
    compliance_required: bool,
    metadata: HashMap<String, String>,
}

/// Wire shape for `BackupJob`; converted through `TryFrom` so a value that
/// violates the compliance invariant never deserializes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawBackupJob {
    id: String,
    tier: BackupTier,
    components: BTreeSet<BackupComponent>,
    #[serde(default)]
    schedule: Option<String>,
    retention_days: i64,
    #[serde(default)]
    encryption_enabled: bool,
    #[serde(default)]
    compression_enabled: bool,
    #[serde(default)]
    compliance_required: bool,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl TryFrom<RawBackupJob> for BackupJob {
    type Error = EngineError;

    fn try_from(raw: RawBackupJob) -> Result<Self> {
        if raw.compliance_required && !raw.encryption_enabled {
            return Err(EngineError::Validation(format!(
                "job '{}': compliance requires encryption to be enabled",
                raw.id
            )));
        }
        Ok(Self {
            id: raw.id,
            tier: raw.tier,
            components: raw.components,
            schedule: raw.schedule,
            retention_days: raw.retention_days,
            encryption_enabled: raw.encryption_enabled,
            compression_enabled: raw.compression_enabled,
            compliance_required: raw.compliance_required,
            metadata: raw.metadata,
        })
    }
}

impl From<BackupJob> for RawBackupJob {
    fn from(job: BackupJob) -> Self {
        Self {
            id: job.id,
            tier: job.tier,
            components: job.components,
            schedule: job.schedule,
            retention_days: job.retention_days,
            encryption_enabled: job.encryption_enabled,
            compression_enabled: job.compression_enabled,
            compliance_required: job.compliance_required,
            metadata: job.metadata,
        }
    }
}

impl BackupJob {
    /// Create a job with the tier's default retention and components,
    /// encryption and compression on, compliance off.
    pub fn new(id: impl Into<String>, tier: BackupTier) -> Self {
        Self {
            id: id.into(),
            tier,
            components: tier.default_components(),
            schedule: None,
            retention_days: tier.default_retention_days(),
            encryption_enabled: true,
            compression_enabled: true,
            compliance_required: false,
            metadata: HashMap::new(),
        }
    }

    pub fn with_components(mut self, components: impl IntoIterator<Item = BackupComponent>) -> Self {
        self.components = components.into_iter().collect();
        self
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days;
        self
    }

    /// Disable encryption. Also drops the compliance requirement, which
    /// cannot exist without it.
    pub fn without_encryption(mut self) -> Self {
        self.encryption_enabled = false;
        self.compliance_required = false;
        self
    }

    pub fn without_compression(mut self) -> Self {
        self.compression_enabled = false;
        self
    }

    /// Require compliance verification. Forces encryption on.
    pub fn with_compliance(mut self) -> Self {
        self.compliance_required = true;
        self.encryption_enabled = true;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tier(&self) -> BackupTier {
        self.tier
    }

    pub fn components(&self) -> &BTreeSet<BackupComponent> {
        &self.components
    }

    pub fn schedule(&self) -> Option<&str> {
        self.schedule.as_deref()
    }

    pub fn retention_days(&self) -> i64 {
        self.retention_days
    }

    pub fn encryption_enabled(&self) -> bool {
        self.encryption_enabled
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression_enabled
    }

    pub fn compliance_required(&self) -> bool {
        self.compliance_required
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Fail-fast validation run before any execution side effect.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::Validation("job id must not be empty".into()));
        }
        if self.components.is_empty() {
            return Err(EngineError::Validation(format!(
                "job '{}': component set must not be empty",
                self.id
            )));
        }
        if self.retention_days <= 0 {
            return Err(EngineError::Validation(format!(
                "job '{}': retention must be positive, got {}",
                self.id, self.retention_days
            )));
        }
        // Upheld by construction; re-checked here so a future field addition
        // cannot bypass it.
        if self.compliance_required && !self.encryption_enabled {
            return Err(EngineError::Validation(format!(
                "job '{}': compliance requires encryption to be enabled",
                self.id
            )));
        }
        Ok(())
    }

    /// The static default job per tier: compliant, encrypted, compressed.
    pub fn default_jobs() -> Vec<BackupJob> {
        [
            BackupTier::Hourly,
            BackupTier::Daily,
            BackupTier::Weekly,
            BackupTier::Monthly,
            BackupTier::Yearly,
        ]
        .into_iter()
        .map(|tier| BackupJob::new(format!("{}-backup", tier), tier).with_compliance())
        .collect()
    }
}
