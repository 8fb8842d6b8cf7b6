//! The most recent restore point, kept so `restore rollback` needs no id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::utils::errors::{Result, StateguardError};

const POINTER_FILE: &str = "last-restore-point.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePointer {
    pub restore_point_id: String,
    /// Manifest whose restore the restore point protects
    pub restore_point_for: String,
    pub created_at: DateTime<Utc>,
}

fn pointer_path(state_dir: &Path) -> PathBuf {
    state_dir.join(POINTER_FILE)
}

impl RestorePointer {
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        fs::create_dir_all(state_dir)?;
        let path = pointer_path(state_dir);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load(state_dir: &Path) -> Result<Self> {
        match fs::read(pointer_path(state_dir)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StateguardError::RestoreState(
                "no restore point has been recorded; pass --to <restore-point-id>".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }
}
