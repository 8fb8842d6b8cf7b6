//! Remote store backed by a mounted directory (NFS, SMB, a second disk).

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::{RemoteObject, RemoteStore};
use crate::fs::walker::list_files;
use crate::utils::errors::{Result, StateguardError};

const PARTIAL_SUFFIX: &str = ".partial";

pub struct FilesystemRemote {
    root: PathBuf,
}

impl FilesystemRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        if !crate::config::is_contained_relative(Path::new(key)) {
            return Err(StateguardError::Configuration(format!(
                "remote key '{key}' escapes the store root"
            )));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl RemoteStore for FilesystemRemote {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn upload(&self, local: &Path, key: &str) -> Result<()> {
        let dest = self.resolve(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = PathBuf::from(format!("{}{PARTIAL_SUFFIX}", dest.display()));

        // Copy under a temporary name so readers never see a truncated object
        if let Err(e) = tokio::fs::copy(local, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(StateguardError::Transient(format!("copy to {}: {e}", dest.display())));
        }
        tokio::fs::rename(&partial, &dest).await?;
        Ok(())
    }

    async fn download(&self, key: &str, local: &Path) -> Result<()> {
        let src = self.resolve(key)?;
        if !tokio::fs::try_exists(&src).await? {
            return Err(StateguardError::ManifestNotFound(format!(
                "{key} is not in {}",
                self.describe()
            )));
        }
        tokio::fs::copy(&src, local).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let base = self.root.join(prefix.trim_matches('/'));
        let files = tokio::task::spawn_blocking(move || list_files(&base, &[PARTIAL_SUFFIX]))
            .await
            .map_err(|e| StateguardError::Transient(format!("listing task failed: {e}")))??;

        let prefix = prefix.trim_matches('/');
        Ok(files
            .into_iter()
            .map(|f| {
                let rel = f.relative_path.to_string_lossy().to_string();
                RemoteObject {
                    key: if prefix.is_empty() { rel } else { format!("{prefix}/{rel}") },
                    size: f.size,
                    last_modified: f.modified,
                }
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        // Drop the run directory once its last object is gone
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }
}
