//! Data model shared by the orchestrators.

pub mod artifact;
pub mod health;
pub mod manifest;
pub mod restore;

pub use artifact::{ArtifactKind, ArtifactRecord, FailurePolicy, StoredArtifact};
pub use health::{HealthCheckResult, RollbackTrigger};
pub use manifest::{BackupManifest, RunStatus, MANIFEST_SCHEMA_VERSION};
pub use restore::{RestoreRequest, RestoreScope};

/// File name of the manifest inside each run directory.
pub const MANIFEST_FILE: &str = "manifest.json";
