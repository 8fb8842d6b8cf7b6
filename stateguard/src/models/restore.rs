//! Restore requests and the scopes they target.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ArtifactKind;
use crate::utils::errors::{Result, StateguardError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RestoreScope {
    Full,
    Only(ArtifactKind),
}

impl RestoreScope {
    pub fn includes(&self, kind: ArtifactKind) -> bool {
        match self {
            RestoreScope::Full => true,
            RestoreScope::Only(k) => *k == kind,
        }
    }

    /// Kinds in scope, in restore dependency order.
    pub fn restore_order(&self) -> Vec<ArtifactKind> {
        ArtifactKind::RESTORE_ORDER
            .into_iter()
            .filter(|k| self.includes(*k))
            .collect()
    }
}

impl fmt::Display for RestoreScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreScope::Full => f.write_str("full"),
            RestoreScope::Only(kind) => write!(f, "{kind}"),
        }
    }
}

impl FromStr for RestoreScope {
    type Err = StateguardError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("full") {
            return Ok(RestoreScope::Full);
        }
        s.parse::<ArtifactKind>().map(RestoreScope::Only)
    }
}

impl TryFrom<String> for RestoreScope {
    type Error = StateguardError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RestoreScope> for String {
    fn from(scope: RestoreScope) -> Self {
        scope.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub manifest_id: String,
    pub scope: RestoreScope,
    pub from_remote: bool,
    pub force: bool,
    pub verify_only: bool,
}

impl RestoreRequest {
    pub fn new(manifest_id: impl Into<String>, scope: RestoreScope) -> Self {
        Self {
            manifest_id: manifest_id.into(),
            scope,
            from_remote: false,
            force: false,
            verify_only: false,
        }
    }
}
