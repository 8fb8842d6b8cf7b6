//! File volume adapter.
//!
//! A host-mounted volume is archived on a dedicated blocking worker; a named
//! container volume is archived by a throwaway container that mounts it
//! read-only. Neither locks the volume against other readers.

use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::command::{CommandRunner, CommandSpec};
use super::{blocking, record_artifact, DataSourceAdapter};
use crate::config::FilesConfig;
use crate::fs::archive::{self, STAGING_DIR};
use crate::models::{ArtifactKind, ArtifactRecord, StoredArtifact};
use crate::utils::errors::{Result, StateguardError};

const ARTIFACT_NAME: &str = "files.tar.zst";
const RAW_TAR: &str = "files.tar";
const KIND: ArtifactKind = ArtifactKind::Files;
/// The container run plus the compression pass around it
const OPERATION_STEPS: u32 = 2;

enum Source {
    Path(PathBuf),
    Volume(String),
}

pub struct FilesAdapter {
    config: FilesConfig,
    source: Source,
    /// Holds the uncompressed tar handed to a restore container
    scratch_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl FilesAdapter {
    pub fn new(config: FilesConfig, scratch_dir: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        let source = match (&config.volume_path, &config.docker_volume) {
            (Some(path), _) => Source::Path(path.clone()),
            (None, Some(volume)) => Source::Volume(volume.clone()),
            // validate() guarantees one of the two
            (None, None) => Source::Path(PathBuf::new()),
        };
        Self {
            config,
            source,
            scratch_dir,
            runner,
        }
    }

    fn docker(&self, mounts: &[String], command: &[&str]) -> CommandSpec {
        let mut spec = CommandSpec::new("docker", self.command_timeout()).args(["run", "--rm"]);
        for mount in mounts {
            spec = spec.arg("-v").arg(mount);
        }
        spec.arg(&self.config.worker_image).args(command.iter().copied())
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn snapshot_volume(
        &self,
        volume: &str,
        dest_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<()> {
        let spec = self.docker(
            &[
                format!("{volume}:/volume:ro"),
                format!("{}:/backup", dest_dir.display()),
            ],
            &["tar", "-C", "/volume", "-cf", &format!("/backup/{RAW_TAR}"), "."],
        );
        let raw = dest_dir.join(RAW_TAR);
        if let Err(e) = self.runner.run_checked(&spec).await {
            let _ = tokio::fs::remove_file(&raw).await;
            return Err(StateguardError::adapter(KIND, e.to_string()));
        }
        let dest = dest_dir.join(ARTIFACT_NAME);
        blocking(KIND, move || archive::compress_file(&raw, &dest, Some(&cancel))).await
    }

    async fn restore_volume(&self, volume: &str, artifact: &Path) -> Result<()> {
        let scratch = self.scratch_dir.clone();
        let raw = scratch.join(RAW_TAR);
        let src = artifact.to_path_buf();
        let staged = raw.clone();
        blocking(KIND, move || {
            fs::create_dir_all(&scratch)?;
            archive::decompress_file(&src, &staged)
        })
        .await?;

        let spec = self.docker(
            &[
                format!("{volume}:/volume"),
                format!("{}:/backup:ro", self.scratch_dir.display()),
            ],
            &[
                "sh",
                "-c",
                &format!("find /volume -mindepth 1 -delete && tar -C /volume -xf /backup/{RAW_TAR}"),
            ],
        );
        let result = self.runner.run_checked(&spec).await;
        let _ = tokio::fs::remove_file(&raw).await;
        result
            .map(|_| ())
            .map_err(|e| StateguardError::adapter(KIND, e.to_string()))
    }
}

#[async_trait]
impl DataSourceAdapter for FilesAdapter {
    fn kind(&self) -> ArtifactKind {
        KIND
    }

    fn service(&self) -> Option<&str> {
        self.config.service.as_deref()
    }

    fn timeout(&self) -> Duration {
        self.command_timeout() * OPERATION_STEPS
    }

    async fn snapshot(&self, dest_dir: &Path) -> Result<ArtifactRecord> {
        let dest = dest_dir.join(ARTIFACT_NAME);
        let mut guard = SnapshotGuard::new(vec![dest.clone(), dest_dir.join(RAW_TAR)]);
        match &self.source {
            Source::Path(root) => {
                info!(volume = %root.display(), "Archiving volume");
                let root = root.clone();
                let cancel = guard.cancel.clone();
                let dest = dest.clone();
                blocking(KIND, move || archive::archive_directory(&root, &dest, Some(&cancel))).await?;
            }
            Source::Volume(volume) => {
                info!(volume = %volume, "Archiving container volume");
                self.snapshot_volume(volume, dest_dir, guard.cancel.clone()).await?;
            }
        }
        let record = record_artifact(KIND, dest).await?;
        guard.done = true;
        Ok(record)
    }

    async fn restore(&self, artifact: &StoredArtifact) -> Result<()> {
        match &self.source {
            Source::Path(root) => {
                info!(volume = %root.display(), "Restoring volume");
                let root = root.clone();
                let src = artifact.path.clone();
                blocking(KIND, move || restore_directory(&src, &root)).await
            }
            Source::Volume(volume) => {
                info!(volume = %volume, "Restoring container volume");
                self.restore_volume(volume, &artifact.path).await
            }
        }
    }
}

/// Stops the blocking archive worker and clears its output when a snapshot
/// ends without a record, including when its future is dropped on timeout.
struct SnapshotGuard {
    cancel: CancellationToken,
    leftovers: Vec<PathBuf>,
    done: bool,
}

impl SnapshotGuard {
    fn new(leftovers: Vec<PathBuf>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            leftovers,
            done: false,
        }
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Cancel first: the worker re-checks after publishing, so either it
        // sees the cancel or its rename happened before the removal below
        self.cancel.cancel();
        for path in &self.leftovers {
            let _ = fs::remove_file(path);
        }
    }
}

/// Extract into a staging directory inside the volume, then swap contents.
///
/// Staging inside the volume keeps every rename on one filesystem, which
/// also holds when the volume root is itself a mount point.
fn restore_directory(archive_path: &Path, root: &Path) -> io::Result<()> {
    fs::create_dir_all(root)?;
    let staging = root.join(STAGING_DIR);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    if let Err(e) = archive::extract_archive(archive_path, &staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_name().to_str() == Some(STAGING_DIR) {
            continue;
        }
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    for entry in fs::read_dir(&staging)? {
        let entry = entry?;
        fs::rename(entry.path(), root.join(entry.file_name()))?;
    }
    fs::remove_dir(&staging)
}
