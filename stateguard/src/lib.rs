//! Stateguard library
//!
//! Backup, restore and health-driven rollback for the platform's stateful
//! services: the relational database, the cache, the file volume and the
//! configuration files.

pub mod adapters;
pub mod checksum;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod manifest;
pub mod models;
pub mod monitor;
pub mod notify;
pub mod remote;
pub mod restore;
pub mod utils;

// Re-export commonly used types
pub use config::RunConfig;
pub use executor::{BackupOrchestrator, BackupOutcome, BackupRequest};
pub use manifest::{ManifestService, VerifyReport};
pub use monitor::{HealthMonitor, MonitorReport};
pub use restore::{RestoreOrchestrator, RestoreReport, RestoreState};
pub use utils::errors::{Result, StateguardError};
