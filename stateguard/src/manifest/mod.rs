//! Manifest persistence, lookup and verification.
//!
//! Local layout: `backup_dir/<run id>/manifest.json` next to the artifact
//! files it describes. A run directory without a manifest belongs to a run
//! that is still in progress (or was killed) and is ignored by listing and
//! pruning.

pub mod retention;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::checksum::sha256_file_async;
use crate::models::{
    ArtifactKind, ArtifactRecord, BackupManifest, RestoreScope, StoredArtifact, MANIFEST_FILE,
};
use crate::remote::{object_key, RemoteStore};
use crate::utils::errors::{Result, StateguardError};
use retention::{format_run_id, select_expired, RunEntry};

const MAX_ID_COLLISIONS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub kind: ArtifactKind,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub manifest_id: String,
    pub ok: bool,
    pub checked: Vec<ArtifactKind>,
    pub mismatches: Vec<Mismatch>,
}

impl VerifyReport {
    pub fn mismatched_kinds(&self) -> Vec<ArtifactKind> {
        self.mismatches.iter().map(|m| m.kind).collect()
    }
}

pub struct ManifestService {
    backup_dir: PathBuf,
    remote: Option<Arc<dyn RemoteStore>>,
    prefix: String,
}

impl ManifestService {
    pub fn new(
        backup_dir: impl Into<PathBuf>,
        remote: Option<Arc<dyn RemoteStore>>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            remote,
            prefix: prefix.into(),
        }
    }

    pub fn remote(&self) -> Option<&Arc<dyn RemoteStore>> {
        self.remote.as_ref()
    }

    pub fn run_dir(&self, id: &str) -> PathBuf {
        self.backup_dir.join(id)
    }

    pub fn artifact_path(&self, id: &str, record: &ArtifactRecord) -> PathBuf {
        self.run_dir(id).join(&record.filename)
    }

    pub fn remote_key(&self, id: &str, filename: &str) -> String {
        object_key(&self.prefix, id, filename)
    }

    /// Reserve a fresh run directory named after `started_at`.
    ///
    /// Directory creation is the reservation, so two runs in the same
    /// millisecond get distinct ids (`<ts>`, `<ts>-1`, ...).
    pub fn allocate_run(&self, started_at: DateTime<Utc>) -> Result<(String, PathBuf)> {
        fs::create_dir_all(&self.backup_dir)?;
        let base = format_run_id(started_at);

        for n in 0..MAX_ID_COLLISIONS {
            let id = if n == 0 { base.clone() } else { format!("{base}-{n}") };
            let dir = self.run_dir(&id);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StateguardError::Manifest(format!(
            "could not allocate a run directory for {base}"
        )))
    }

    /// Persist a manifest. Refuses to replace one that already exists.
    pub fn write(&self, manifest: &BackupManifest) -> Result<PathBuf> {
        manifest.validate()?;
        let dir = self.run_dir(&manifest.id);
        fs::create_dir_all(&dir)?;

        let path = dir.join(MANIFEST_FILE);
        let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
        fs::write(&tmp, manifest.to_json()?)?;
        fs::File::open(&tmp)?.sync_all()?;

        // hard_link fails if the target exists, unlike rename
        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {
                debug!(manifest_id = %manifest.id, "Wrote manifest");
                Ok(path)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(StateguardError::Manifest(
                format!("manifest {} already exists and is immutable", manifest.id),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub fn load(&self, id: &str) -> Result<BackupManifest> {
        check_id(id)?;
        let path = self.run_dir(id).join(MANIFEST_FILE);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StateguardError::ManifestNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let manifest = BackupManifest::from_json(&bytes)?;
        if manifest.id != id {
            return Err(StateguardError::Manifest(format!(
                "{} records id {}",
                path.display(),
                manifest.id
            )));
        }
        Ok(manifest)
    }

    /// Load locally, falling back to the remote copy of the manifest.
    pub async fn resolve(&self, id: &str) -> Result<BackupManifest> {
        check_id(id)?;
        match self.load(id) {
            Err(StateguardError::ManifestNotFound(_)) if self.remote.is_some() => {
                info!(manifest_id = %id, "Manifest not found locally, trying remote");
                self.download_manifest(id).await
            }
            other => other,
        }
    }

    /// All readable manifests, newest first. Unreadable ones are skipped.
    pub fn list(&self) -> Result<Vec<BackupManifest>> {
        let mut manifests = Vec::new();
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(manifests),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.load(&id) {
                Ok(manifest) => manifests.push(manifest),
                Err(StateguardError::ManifestNotFound(_)) => {
                    debug!(run = %id, "Skipping run directory without manifest");
                }
                Err(e) => warn!(run = %id, "Skipping unreadable manifest: {}", e),
            }
        }

        manifests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(manifests)
    }

    /// Locate an artifact's bytes, downloading it from remote when the local
    /// copy is missing.
    pub async fn stored_artifact(&self, id: &str, record: &ArtifactRecord) -> Result<StoredArtifact> {
        let path = self.artifact_path(id, record);
        if !tokio::fs::try_exists(&path).await? {
            let remote = self.remote.as_ref().ok_or_else(|| {
                StateguardError::ManifestNotFound(format!(
                    "{} artifact of {id} is missing locally and no remote is configured",
                    record.kind
                ))
            })?;
            tokio::fs::create_dir_all(self.run_dir(id)).await?;
            info!(manifest_id = %id, kind = %record.kind, "Fetching artifact from remote");
            remote
                .download(&self.remote_key(id, &record.filename), &path)
                .await?;
        }
        Ok(StoredArtifact {
            record: record.clone(),
            path,
        })
    }

    /// Recompute the checksum of every in-scope artifact and compare it to
    /// the recorded one. Local copies are checked first, remote as fallback.
    pub async fn verify(&self, id: &str, scope: RestoreScope) -> Result<VerifyReport> {
        let manifest = self.resolve(id).await?;
        let mut checked = Vec::new();
        let mut mismatches = Vec::new();

        if let RestoreScope::Only(kind) = scope {
            if manifest.artifact(kind).is_none() {
                mismatches.push(Mismatch {
                    kind,
                    reason: "not recorded in manifest".to_string(),
                });
            }
        }

        for (kind, record) in manifest.artifacts.iter() {
            if !scope.includes(*kind) {
                continue;
            }
            checked.push(*kind);

            let stored = match self.stored_artifact(id, record).await {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(manifest_id = %id, kind = %kind, "Artifact unavailable: {}", e);
                    mismatches.push(Mismatch {
                        kind: *kind,
                        reason: format!("unavailable: {e}"),
                    });
                    continue;
                }
            };

            let actual = sha256_file_async(stored.path.clone()).await?;
            if actual != record.checksum_sha256 {
                warn!(
                    manifest_id = %id,
                    kind = %kind,
                    expected = %record.checksum_sha256,
                    actual = %actual,
                    "Checksum mismatch"
                );
                mismatches.push(Mismatch {
                    kind: *kind,
                    reason: format!("expected {}, found {}", record.checksum_sha256, actual),
                });
            }
        }

        Ok(VerifyReport {
            manifest_id: id.to_string(),
            ok: mismatches.is_empty(),
            checked,
            mismatches,
        })
    }

    /// Download a run's manifest and every artifact it lists.
    pub async fn fetch_remote(&self, id: &str) -> Result<BackupManifest> {
        let manifest = self.download_manifest(id).await?;
        for record in manifest.artifacts.values() {
            self.stored_artifact(id, record).await?;
        }
        Ok(manifest)
    }

    async fn download_manifest(&self, id: &str) -> Result<BackupManifest> {
        check_id(id)?;
        let remote = self.remote.as_ref().ok_or_else(|| {
            StateguardError::Configuration("no remote store is configured".to_string())
        })?;
        let dir = self.run_dir(id);
        if let Ok(local) = self.load(id) {
            return Ok(local);
        }

        tokio::fs::create_dir_all(&dir).await?;
        let staged = dir.join(format!("{MANIFEST_FILE}.download"));
        let result = remote
            .download(&self.remote_key(id, MANIFEST_FILE), &staged)
            .await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&staged).await;
            let _ = tokio::fs::remove_dir(&dir).await;
            return Err(match e {
                StateguardError::ManifestNotFound(_) => StateguardError::ManifestNotFound(id.to_string()),
                other => other,
            });
        }

        let manifest = BackupManifest::from_json(&tokio::fs::read(&staged).await?)?;
        let _ = tokio::fs::remove_file(&staged).await;
        if manifest.id != id {
            return Err(StateguardError::Manifest(format!(
                "remote manifest for {id} records id {}",
                manifest.id
            )));
        }
        self.write(&manifest)?;
        Ok(manifest)
    }

    /// Delete local runs older than `cutoff`, keeping the `keep` newest.
    pub fn prune(&self, cutoff: DateTime<Utc>, keep: usize) -> Result<Vec<String>> {
        let runs = self
            .list()?
            .into_iter()
            .map(|m| RunEntry {
                id: m.id,
                created_at: m.created_at,
            })
            .collect();

        let expired = select_expired(runs, cutoff, keep);
        for id in &expired {
            fs::remove_dir_all(self.run_dir(id))?;
            info!(manifest_id = %id, "Pruned local run");
        }
        Ok(expired)
    }
}

/// A run id names exactly one directory under the backup dir.
fn check_id(id: &str) -> Result<()> {
    if !crate::config::is_contained_relative(Path::new(id)) || id.contains('/') {
        return Err(StateguardError::ManifestNotFound(id.to_string()));
    }
    Ok(())
}
