//! Artifact kinds, the per-kind failure policy, and artifact records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::checksum::sha256_file;
use crate::utils::errors::{Result, StateguardError};

/// The four stateful data sources the platform backs up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Database,
    Cache,
    Files,
    Config,
}

/// What a failed snapshot of a kind does to the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the run and mark it failed.
    Abort,
    /// Record the failure on the artifact and finish as partial.
    Degrade,
}

const FAILURE_POLICY: [(ArtifactKind, FailurePolicy); 4] = [
    (ArtifactKind::Database, FailurePolicy::Abort),
    (ArtifactKind::Cache, FailurePolicy::Degrade),
    (ArtifactKind::Files, FailurePolicy::Degrade),
    (ArtifactKind::Config, FailurePolicy::Degrade),
];

impl ArtifactKind {
    /// Snapshot order for backup runs.
    pub const BACKUP_ORDER: [ArtifactKind; 4] = [
        ArtifactKind::Database,
        ArtifactKind::Cache,
        ArtifactKind::Files,
        ArtifactKind::Config,
    ];

    /// Restore order: schema dependents start only after the database is back.
    pub const RESTORE_ORDER: [ArtifactKind; 4] = [
        ArtifactKind::Config,
        ArtifactKind::Files,
        ArtifactKind::Database,
        ArtifactKind::Cache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Database => "database",
            ArtifactKind::Cache => "cache",
            ArtifactKind::Files => "files",
            ArtifactKind::Config => "config",
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        FAILURE_POLICY
            .iter()
            .find(|(kind, _)| kind == self)
            .map(|(_, policy)| *policy)
            .unwrap_or(FailurePolicy::Degrade)
    }

    pub fn is_critical(&self) -> bool {
        self.policy() == FailurePolicy::Abort
    }

    /// Parse a comma separated target list (`db,cache,files,config`).
    pub fn parse_list(input: &str) -> Result<Vec<ArtifactKind>> {
        let mut kinds = Vec::new();
        for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let kind = part.parse::<ArtifactKind>()?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        if kinds.is_empty() {
            return Err(StateguardError::Configuration(
                "target list is empty".to_string(),
            ));
        }
        Ok(kinds)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = StateguardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "database" | "db" => Ok(ArtifactKind::Database),
            "cache" | "redis" => Ok(ArtifactKind::Cache),
            "files" | "volume" => Ok(ArtifactKind::Files),
            "config" => Ok(ArtifactKind::Config),
            other => Err(StateguardError::Configuration(format!(
                "unknown target '{other}' (expected database, cache, files or config)"
            ))),
        }
    }
}

/// One artifact produced by an adapter during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub kind: ArtifactKind,
    pub filename: String,
    pub size_bytes: u64,
    pub checksum_sha256: String,
    #[serde(default)]
    pub uploaded: bool,
}

impl ArtifactRecord {
    /// Describe an artifact that was just written, hashing it on the spot.
    pub fn from_file(kind: ArtifactKind, path: &Path) -> Result<Self> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                StateguardError::adapter(kind, format!("invalid artifact path {}", path.display()))
            })?
            .to_string();
        let size_bytes = std::fs::metadata(path)?.len();
        let checksum_sha256 = sha256_file(path)?;

        Ok(Self {
            kind,
            filename,
            size_bytes,
            checksum_sha256,
            uploaded: false,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.filename.is_empty()
            || self.filename.contains('/')
            || self.filename.contains('\\')
            || self.filename == "."
            || self.filename == ".."
            || self.filename == super::MANIFEST_FILE
        {
            return Err(StateguardError::Manifest(format!(
                "{} artifact has invalid filename '{}'",
                self.kind, self.filename
            )));
        }
        let well_formed = self.checksum_sha256.len() == 64
            && self
                .checksum_sha256
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !well_formed {
            return Err(StateguardError::Manifest(format!(
                "{} artifact has malformed sha256 '{}'",
                self.kind, self.checksum_sha256
            )));
        }
        Ok(())
    }
}

/// An artifact record together with where its bytes live locally.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub record: ArtifactRecord,
    pub path: PathBuf,
}
