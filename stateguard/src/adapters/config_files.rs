//! Configuration adapter: archives a fixed allow-list of paths under a root.
//!
//! A restore replaces each allow-listed entry wholesale, so paths created
//! after the snapshot do not survive it. Everything else under the root is
//! left alone.

use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::{blocking, record_artifact, DataSourceAdapter};
use crate::config::ConfigFilesConfig;
use crate::fs::archive::{self, STAGING_DIR};
use crate::models::{ArtifactKind, ArtifactRecord, StoredArtifact};
use crate::utils::errors::{Result, StateguardError};

const ARTIFACT_NAME: &str = "config.tar.zst";
const KIND: ArtifactKind = ArtifactKind::Config;

pub struct ConfigAdapter {
    config: ConfigFilesConfig,
}

impl ConfigAdapter {
    pub fn new(config: ConfigFilesConfig) -> Self {
        Self { config }
    }

    fn allow_list(&self) -> Vec<PathBuf> {
        self.config.include.iter().map(PathBuf::from).collect()
    }
}

#[async_trait]
impl DataSourceAdapter for ConfigAdapter {
    fn kind(&self) -> ArtifactKind {
        KIND
    }

    fn service(&self) -> Option<&str> {
        self.config.service.as_deref()
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn snapshot(&self, dest_dir: &Path) -> Result<ArtifactRecord> {
        let root = self.config.root.clone();
        let entries = self.allow_list();
        let dest = dest_dir.join(ARTIFACT_NAME);

        let stats = blocking(KIND, move || archive::archive_paths(&root, &entries, &dest)).await?;
        for skipped in &stats.skipped {
            warn!(path = %skipped.display(), "Allow-listed config path is missing, skipped");
        }
        info!(included = stats.included.len(), "Archived configuration");

        record_artifact(KIND, dest_dir.join(ARTIFACT_NAME)).await
    }

    async fn restore(&self, artifact: &StoredArtifact) -> Result<()> {
        let allowed = self.allow_list();
        let src = artifact.path.clone();
        let entries = blocking(KIND, move || archive::list_entries(&src)).await?;

        // Refuse archives carrying anything outside the allow-list
        if let Some(stray) = entries
            .iter()
            .find(|entry| !allowed.iter().any(|a| entry.starts_with(a)))
        {
            return Err(StateguardError::adapter(
                KIND,
                format!("archive entry {} is not allow-listed", stray.display()),
            ));
        }

        let root = self.config.root.clone();
        let src = artifact.path.clone();
        info!(root = %root.display(), "Restoring configuration");
        blocking(KIND, move || restore_allow_listed(&src, &root, &allowed)).await
    }
}

/// Extract into a staging directory under `root`, then swap every
/// allow-listed entry for its staged copy. An entry the archive lacks is
/// removed from the live tree.
fn restore_allow_listed(archive_path: &Path, root: &Path, allowed: &[PathBuf]) -> io::Result<()> {
    fs::create_dir_all(root)?;
    let staging = root.join(STAGING_DIR);
    remove_entry(&staging)?;
    if let Err(e) = archive::extract_archive(archive_path, &staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    for rel in outermost(allowed) {
        let live = root.join(rel);
        let staged = staging.join(rel);
        remove_entry(&live)?;
        if fs::symlink_metadata(&staged).is_ok() {
            if let Some(parent) = live.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&staged, &live)?;
        }
    }
    fs::remove_dir_all(&staging)
}

fn remove_entry(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Allow-list without duplicates or entries nested under another entry.
fn outermost(allowed: &[PathBuf]) -> Vec<&PathBuf> {
    let mut entries: Vec<&PathBuf> = allowed
        .iter()
        .filter(|p| !allowed.iter().any(|other| other != *p && p.starts_with(other)))
        .collect();
    entries.sort();
    entries.dedup();
    entries
}
