//! Error types for backup, restore and health monitoring.

use crate::models::ArtifactKind;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateguardError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Manifest not found: {0}")]
    ManifestNotFound(String),

    #[error("Invalid manifest: {0}")]
    Manifest(String),

    #[error("{kind} adapter failed ({}): {message}", criticality(.critical))]
    Adapter {
        kind: ArtifactKind,
        critical: bool,
        message: String,
    },

    #[error("Integrity check failed for manifest {manifest_id}: {}", format_kinds(.mismatches))]
    Integrity {
        manifest_id: String,
        mismatches: Vec<ArtifactKind>,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Transient I/O error: {0}")]
    Transient(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Operation already in progress: {0}")]
    Concurrency(String),

    #[error("Invalid restore state: {0}")]
    RestoreState(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StateguardError {
    pub fn adapter(kind: ArtifactKind, message: impl Into<String>) -> Self {
        StateguardError::Adapter {
            kind,
            critical: kind.is_critical(),
            message: message.into(),
        }
    }

    /// Errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            StateguardError::Transient(_) | StateguardError::Timeout { .. } => true,
            StateguardError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            StateguardError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Missing or invalid input that no retry can fix.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StateguardError::Configuration(_) | StateguardError::ManifestNotFound(_)
        )
    }
}

fn criticality(critical: &bool) -> &'static str {
    if *critical {
        "critical"
    } else {
        "non-critical"
    }
}

fn format_kinds(kinds: &[ArtifactKind]) -> String {
    kinds
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<config::ConfigError> for StateguardError {
    fn from(err: config::ConfigError) -> Self {
        StateguardError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StateguardError>;
