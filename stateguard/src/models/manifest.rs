//! The persisted record of one backup run.
//!
//! A manifest is written once as `manifest.json` in the run directory and
//! never modified afterwards; retention pruning is the only thing that
//! removes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::ArtifactKind;
use super::ArtifactRecord;
use crate::utils::errors::{Result, StateguardError};

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupManifest {
    pub schema_version: u32,
    /// Run timestamp, also the run directory name.
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub hostname: String,
    pub status: RunStatus,
    pub is_restore_point: bool,
    /// For restore points: the manifest whose restore this snapshot protects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_point_for: Option<String>,
    pub artifacts: BTreeMap<ArtifactKind, ArtifactRecord>,
    /// Per-artifact failures recorded instead of aborting the run.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failures: BTreeMap<ArtifactKind, String>,
    pub duration_ms: u64,
}

impl BackupManifest {
    /// Build and validate a manifest. Malformed input is rejected here rather
    /// than surfacing when the manifest is read back.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        created_at: DateTime<Utc>,
        hostname: String,
        status: RunStatus,
        restore_point_for: Option<String>,
        artifacts: Vec<ArtifactRecord>,
        failures: BTreeMap<ArtifactKind, String>,
        duration_ms: u64,
    ) -> Result<Self> {
        let mut by_kind = BTreeMap::new();
        for record in artifacts {
            if by_kind.insert(record.kind, record).is_some() {
                return Err(StateguardError::Manifest(format!(
                    "run {id} recorded the same artifact kind twice"
                )));
            }
        }

        let manifest = Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            id,
            created_at,
            hostname,
            status,
            is_restore_point: restore_point_for.is_some(),
            restore_point_for,
            artifacts: by_kind,
            failures,
            duration_ms,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let manifest: BackupManifest = serde_json::from_slice(bytes)
            .map_err(|e| StateguardError::Manifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != MANIFEST_SCHEMA_VERSION {
            return Err(StateguardError::Manifest(format!(
                "unsupported schema version {}",
                self.schema_version
            )));
        }
        if self.id.is_empty()
            || !self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(StateguardError::Manifest(format!(
                "invalid manifest id '{}'",
                self.id
            )));
        }
        if self.is_restore_point != self.restore_point_for.is_some() {
            return Err(StateguardError::Manifest(format!(
                "manifest {} has inconsistent restore point fields",
                self.id
            )));
        }
        for (kind, record) in &self.artifacts {
            if *kind != record.kind {
                return Err(StateguardError::Manifest(format!(
                    "manifest {} files a {} artifact under {}",
                    self.id, record.kind, kind
                )));
            }
            record.validate()?;
        }
        if self.status == RunStatus::Success && !self.failures.is_empty() {
            return Err(StateguardError::Manifest(format!(
                "manifest {} is marked success but records failures",
                self.id
            )));
        }
        Ok(())
    }

    pub fn artifact(&self, kind: ArtifactKind) -> Option<&ArtifactRecord> {
        self.artifacts.get(&kind)
    }

    pub fn total_bytes(&self) -> u64 {
        self.artifacts.values().map(|a| a.size_bytes).sum()
    }
}
