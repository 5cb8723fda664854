pub mod backup_job;
pub mod backup_result;
pub mod manifest;
pub mod restore;

pub use backup_job::{BackupComponent, BackupJob, BackupTier};
pub use backup_result::{BackupResult, BackupStatus, RunSummary};
pub use manifest::{
    ArtifactDetail, ArtifactManifest, BackupManifest, ConfigClass, DatabaseBackupKind, FileKind,
    SensitivityClass, MANIFEST_FILE, MANIFEST_VERSION,
};
pub use restore::{
    RestoreRequest, RestoreResult, RestoreStatus, RestoreType, RestoredItem, ValidationOutcome,
};
