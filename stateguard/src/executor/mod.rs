//! Backup orchestrator - drives one backup run across all adapters.
//!
//! A run:
//! - takes the system-wide backup lock
//! - snapshots each target in fixed order, one at a time
//! - re-verifies every artifact it just wrote
//! - uploads artifacts with bounded parallelism and retry
//! - writes the manifest exactly once, whatever happened
//! - prunes aged runs locally and remotely, then notifies

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapters::{AdapterSet, DataSourceAdapter};
use crate::checksum::sha256_file_async;
use crate::config::RunConfig;
use crate::manifest::ManifestService;
use crate::models::{ArtifactKind, ArtifactRecord, BackupManifest, RunStatus, MANIFEST_FILE};
use crate::notify::{deliver, ArtifactOutcome, Event, Notifier};
use crate::remote::progress::format_bytes;
use crate::remote::{upload_with_retry, RetryPolicy};
use crate::utils::errors::{Result, StateguardError};
use crate::utils::lock::{Operation, RunLock};

/// What to back up and where the result goes
#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    /// Kinds to snapshot; empty means every configured adapter
    pub targets: Vec<ArtifactKind>,

    /// Skip remote upload even when a remote store is configured
    pub no_remote: bool,

    /// Set when this run protects a restore of the given manifest
    pub restore_point_for: Option<String>,
}

impl BackupRequest {
    pub fn restore_point(manifest_id: &str, targets: Vec<ArtifactKind>) -> Self {
        Self {
            targets,
            no_remote: false,
            restore_point_for: Some(manifest_id.to_string()),
        }
    }
}

/// Backup execution result
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub manifest: BackupManifest,

    /// Artifacts whose bytes on disk no longer matched right after writing
    pub integrity_failures: Vec<ArtifactKind>,

    /// Artifacts that exhausted their upload retries
    pub upload_failures: Vec<ArtifactKind>,

    pub pruned_local: Vec<String>,
    pub pruned_remote: Vec<String>,
}

impl BackupOutcome {
    pub fn status(&self) -> RunStatus {
        self.manifest.status
    }
}

/// Main backup orchestrator
pub struct BackupOrchestrator {
    config: Arc<RunConfig>,
    adapters: AdapterSet,
    manifests: Arc<ManifestService>,
    notifier: Arc<dyn Notifier>,
    cancel_token: CancellationToken,
}

impl BackupOrchestrator {
    pub fn new(
        config: Arc<RunConfig>,
        adapters: AdapterSet,
        manifests: Arc<ManifestService>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            adapters,
            manifests,
            notifier,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Create an orchestrator that stops at the next step boundary once `cancel_token` fires
    pub fn with_cancel(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    pub fn manifests(&self) -> &Arc<ManifestService> {
        &self.manifests
    }

    /// Execute a backup run.
    ///
    /// Errors are returned only when the run could not start (lock held,
    /// unknown target, unwritable backup directory). Everything after the run
    /// directory exists ends in a persisted manifest.
    pub async fn run(&self, request: BackupRequest) -> Result<BackupOutcome> {
        let _lock = RunLock::acquire(&self.config.paths.state_dir, Operation::Backup)?;
        let targets = self.resolve_targets(&request.targets)?;

        let started_at = Utc::now();
        let clock = Instant::now();
        let (run_id, run_dir) = self.manifests.allocate_run(started_at)?;
        let is_restore_point = request.restore_point_for.is_some();
        let kinds: Vec<ArtifactKind> = targets.iter().map(|a| a.kind()).collect();

        info!(
            manifest_id = %run_id,
            restore_point = is_restore_point,
            targets = ?kinds,
            "Starting backup run"
        );

        let mut records: Vec<ArtifactRecord> = Vec::new();
        let mut failures: BTreeMap<ArtifactKind, String> = BTreeMap::new();
        let mut critical_failure = false;
        let mut cancelled = false;

        for adapter in &targets {
            let kind = adapter.kind();
            // Cancellation is honoured only between artifacts
            if self.cancel_token.is_cancelled() {
                warn!(manifest_id = %run_id, "Backup cancelled before {} snapshot", kind);
                cancelled = true;
                break;
            }

            match snapshot_bounded(adapter.as_ref(), &run_dir).await {
                Ok(record) => {
                    info!(
                        manifest_id = %run_id,
                        kind = %kind,
                        size = %format_bytes(record.size_bytes),
                        sha256 = %record.checksum_sha256,
                        "Snapshot complete"
                    );
                    records.push(record);
                }
                Err(e) if adapter.is_critical() => {
                    error!(manifest_id = %run_id, kind = %kind, "Critical snapshot failed, aborting run: {}", e);
                    failures.insert(kind, e.to_string());
                    critical_failure = true;
                    break;
                }
                Err(e) => {
                    warn!(manifest_id = %run_id, kind = %kind, "Snapshot failed, continuing: {}", e);
                    failures.insert(kind, e.to_string());
                }
            }
        }

        let integrity_failures = reverify(&run_dir, &records).await;
        for kind in &integrity_failures {
            error!(manifest_id = %run_id, kind = %kind, "Artifact changed on disk after it was written");
            failures.insert(*kind, "checksum mismatch on re-verification".to_string());
        }

        let status = if cancelled {
            RunStatus::Cancelled
        } else if critical_failure || !integrity_failures.is_empty() || records.is_empty() {
            RunStatus::Failed
        } else if !failures.is_empty() {
            RunStatus::Partial
        } else {
            RunStatus::Success
        };

        let upload_allowed = !request.no_remote
            && matches!(status, RunStatus::Success | RunStatus::Partial)
            && (!is_restore_point || self.config.restore.upload_restore_points);
        let mut upload_failures = Vec::new();
        if upload_allowed && self.manifests.remote().is_some() {
            upload_failures = self.upload_artifacts(&run_id, &run_dir, &mut records).await;
        }

        let manifest = BackupManifest::new(
            run_id.clone(),
            started_at,
            local_hostname(),
            status,
            request.restore_point_for.clone(),
            records,
            failures,
            clock.elapsed().as_millis() as u64,
        )?;
        self.manifests.write(&manifest)?;

        if upload_allowed {
            self.upload_manifest(&run_id, &run_dir).await;
        }

        let (pruned_local, pruned_remote) =
            if is_restore_point || matches!(status, RunStatus::Cancelled | RunStatus::Failed) {
                (Vec::new(), Vec::new())
            } else {
                self.prune().await
            };

        info!(
            manifest_id = %run_id,
            status = %manifest.status,
            artifacts = manifest.artifacts.len(),
            total = %format_bytes(manifest.total_bytes()),
            duration_ms = manifest.duration_ms,
            "Backup run finished"
        );

        deliver(self.notifier.as_ref(), &completed_event(&manifest)).await;

        Ok(BackupOutcome {
            manifest,
            integrity_failures,
            upload_failures,
            pruned_local,
            pruned_remote,
        })
    }

    /// Apply retention locally and remotely. Failures are logged, not fatal.
    pub async fn prune(&self) -> (Vec<String>, Vec<String>) {
        let cutoff = Utc::now() - self.config.retention_window();
        let keep = self.config.retention.preserve_newest;

        let local = self.manifests.prune(cutoff, keep).unwrap_or_else(|e| {
            warn!("Local retention pruning failed: {}", e);
            Vec::new()
        });

        let remote = match self.manifests.remote() {
            Some(store) => store
                .delete_older_than(&self.config.remote.prefix, cutoff, keep)
                .await
                .unwrap_or_else(|e| {
                    warn!("Remote retention pruning failed: {}", e);
                    Vec::new()
                }),
            None => Vec::new(),
        };

        (local, remote)
    }

    fn resolve_targets(&self, requested: &[ArtifactKind]) -> Result<Vec<Arc<dyn DataSourceAdapter>>> {
        if self.adapters.is_empty() {
            return Err(StateguardError::Configuration(
                "no data sources are enabled".to_string(),
            ));
        }
        ArtifactKind::BACKUP_ORDER
            .into_iter()
            .filter(|kind| requested.is_empty() || requested.contains(kind))
            .filter_map(|kind| {
                if requested.is_empty() {
                    self.adapters.get(kind).cloned().map(Ok)
                } else {
                    Some(self.adapters.require(kind).cloned())
                }
            })
            .collect()
    }

    /// Upload every artifact concurrently, bounded by the configured
    /// parallelism. Marks records uploaded and returns those that failed.
    async fn upload_artifacts(
        &self,
        run_id: &str,
        run_dir: &Path,
        records: &mut [ArtifactRecord],
    ) -> Vec<ArtifactKind> {
        let Some(store) = self.manifests.remote().cloned() else {
            return Vec::new();
        };
        let policy = RetryPolicy::from_config(&self.config.remote);
        let semaphore = Arc::new(Semaphore::new(self.config.remote.parallelism.max(1)));

        let mut handles = Vec::with_capacity(records.len());
        for record in records.iter() {
            let sem = Arc::clone(&semaphore);
            let store = Arc::clone(&store);
            let local = run_dir.join(&record.filename);
            let key = self.manifests.remote_key(run_id, &record.filename);
            let kind = record.kind;

            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.map_err(|e| {
                    StateguardError::Transient(format!("upload semaphore closed: {e}"))
                })?;
                upload_with_retry(store.as_ref(), &local, &key, &policy)
                    .await
                    .map(|()| kind)
            }));
        }

        let mut failed = Vec::new();
        for (record, handle) in records.iter_mut().zip(handles) {
            match handle.await {
                Ok(Ok(_)) => record.uploaded = true,
                Ok(Err(e)) => {
                    warn!(manifest_id = %run_id, kind = %record.kind, "Upload gave up, keeping local copy only: {}", e);
                    failed.push(record.kind);
                }
                Err(e) => {
                    warn!(manifest_id = %run_id, kind = %record.kind, "Upload task panicked: {}", e);
                    failed.push(record.kind);
                }
            }
        }
        failed
    }

    async fn upload_manifest(&self, run_id: &str, run_dir: &Path) {
        let Some(store) = self.manifests.remote() else {
            return;
        };
        let policy = RetryPolicy::from_config(&self.config.remote);
        let key = self.manifests.remote_key(run_id, MANIFEST_FILE);
        if let Err(e) = upload_with_retry(store.as_ref(), &run_dir.join(MANIFEST_FILE), &key, &policy).await {
            warn!(manifest_id = %run_id, "Manifest upload failed: {}", e);
        }
    }
}

async fn snapshot_bounded(adapter: &dyn DataSourceAdapter, run_dir: &Path) -> Result<ArtifactRecord> {
    let kind = adapter.kind();
    let limit = adapter.timeout();
    let record = match tokio::time::timeout(limit, adapter.snapshot(run_dir)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(StateguardError::Timeout {
                operation: format!("{kind} snapshot"),
                after: limit,
            })
        }
    };
    if record.kind != kind {
        return Err(StateguardError::adapter(
            kind,
            format!("adapter returned a {} artifact", record.kind),
        ));
    }
    record.validate()?;
    Ok(record)
}

/// Kinds whose file no longer hashes to the checksum taken at creation.
async fn reverify(run_dir: &Path, records: &[ArtifactRecord]) -> Vec<ArtifactKind> {
    let mut mismatched = Vec::new();
    for record in records {
        match sha256_file_async(run_dir.join(&record.filename)).await {
            Ok(actual) if actual == record.checksum_sha256 => {}
            Ok(_) => mismatched.push(record.kind),
            Err(e) => {
                warn!(kind = %record.kind, "Could not re-read artifact: {}", e);
                mismatched.push(record.kind);
            }
        }
    }
    mismatched
}

fn completed_event(manifest: &BackupManifest) -> Event {
    let mut artifacts: Vec<ArtifactOutcome> = manifest
        .artifacts
        .values()
        .map(|r| ArtifactOutcome {
            kind: r.kind,
            size_bytes: Some(r.size_bytes),
            uploaded: r.uploaded,
            error: manifest.failures.get(&r.kind).cloned(),
        })
        .collect();
    for (kind, message) in &manifest.failures {
        if !manifest.artifacts.contains_key(kind) {
            artifacts.push(ArtifactOutcome {
                kind: *kind,
                size_bytes: None,
                uploaded: false,
                error: Some(message.clone()),
            });
        }
    }

    Event::BackupCompleted {
        manifest_id: manifest.id.clone(),
        hostname: manifest.hostname.clone(),
        status: manifest.status,
        is_restore_point: manifest.is_restore_point,
        artifacts,
        duration_ms: manifest.duration_ms,
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StoredArtifact;
    use crate::notify::LogNotifier;
    use crate::remote::memory::MemoryRemote;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Writes a fixed payload, or fails when told to.
    struct StubAdapter {
        kind: ArtifactKind,
        payload: Vec<u8>,
        fail: bool,
        delay: Duration,
        /// Record a checksum that does not match the bytes written
        misrecord: bool,
        /// Fired once this adapter's artifact is on disk
        cancel_after: Option<CancellationToken>,
        calls: Arc<Mutex<Vec<ArtifactKind>>>,
    }

    impl StubAdapter {
        fn new(kind: ArtifactKind, calls: &Arc<Mutex<Vec<ArtifactKind>>>) -> Self {
            Self {
                kind,
                payload: format!("{kind} payload").into_bytes(),
                fail: false,
                delay: Duration::ZERO,
                misrecord: false,
                cancel_after: None,
                calls: Arc::clone(calls),
            }
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    #[async_trait]
    impl DataSourceAdapter for StubAdapter {
        fn kind(&self) -> ArtifactKind {
            self.kind
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(200)
        }

        async fn snapshot(&self, dest_dir: &Path) -> Result<ArtifactRecord> {
            self.calls.lock().unwrap().push(self.kind);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(StateguardError::adapter(self.kind, "tool exited 1"));
            }
            let path = dest_dir.join(format!("{}.bin", self.kind));
            std::fs::write(&path, &self.payload)?;
            let mut record = ArtifactRecord::from_file(self.kind, &path)?;
            if self.misrecord {
                record.checksum_sha256 = "f".repeat(64);
            }
            if let Some(token) = &self.cancel_after {
                token.cancel();
            }
            Ok(record)
        }

        async fn restore(&self, _artifact: &StoredArtifact) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        _temp: TempDir,
        config: Arc<RunConfig>,
        manifests: Arc<ManifestService>,
        calls: Arc<Mutex<Vec<ArtifactKind>>>,
    }

    fn fixture(remote: Option<Arc<MemoryRemote>>) -> Fixture {
        let temp = TempDir::new().unwrap();
        let mut config = RunConfig::default();
        config.paths.backup_dir = temp.path().join("backups");
        config.paths.state_dir = temp.path().join("state");
        config.remote.backoff_ms = 1;
        let manifests = Arc::new(ManifestService::new(
            &config.paths.backup_dir,
            remote.map(|r| r as Arc<dyn crate::remote::RemoteStore>),
            "backups",
        ));
        Fixture {
            _temp: temp,
            config: Arc::new(config),
            manifests,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn orchestrator(f: &Fixture, adapters: AdapterSet) -> BackupOrchestrator {
        BackupOrchestrator::new(
            f.config.clone(),
            adapters,
            f.manifests.clone(),
            Arc::new(LogNotifier),
        )
    }

    #[tokio::test]
    async fn test_runs_targets_in_fixed_order() -> Result<()> {
        let f = fixture(None);
        let adapters = AdapterSet::new()
            .with(Arc::new(StubAdapter::new(ArtifactKind::Config, &f.calls)))
            .with(Arc::new(StubAdapter::new(ArtifactKind::Cache, &f.calls)))
            .with(Arc::new(StubAdapter::new(ArtifactKind::Database, &f.calls)));

        let outcome = orchestrator(&f, adapters).run(BackupRequest::default()).await?;
        assert_eq!(outcome.status(), RunStatus::Success);
        assert_eq!(
            *f.calls.lock().unwrap(),
            vec![ArtifactKind::Database, ArtifactKind::Cache, ArtifactKind::Config]
        );
        assert_eq!(f.manifests.load(&outcome.manifest.id)?, outcome.manifest);
        Ok(())
    }

    #[tokio::test]
    async fn test_critical_failure_aborts_but_persists_manifest() -> Result<()> {
        let f = fixture(None);
        let adapters = AdapterSet::new()
            .with(Arc::new(StubAdapter::new(ArtifactKind::Database, &f.calls).failing()))
            .with(Arc::new(StubAdapter::new(ArtifactKind::Files, &f.calls)));

        let outcome = orchestrator(&f, adapters).run(BackupRequest::default()).await?;
        assert_eq!(outcome.status(), RunStatus::Failed);
        assert_eq!(*f.calls.lock().unwrap(), vec![ArtifactKind::Database]);
        let stored = f.manifests.load(&outcome.manifest.id)?;
        assert!(stored.failures.contains_key(&ArtifactKind::Database));
        Ok(())
    }

    #[tokio::test]
    async fn test_non_critical_failure_degrades_to_partial() -> Result<()> {
        let f = fixture(None);
        let adapters = AdapterSet::new()
            .with(Arc::new(StubAdapter::new(ArtifactKind::Database, &f.calls)))
            .with(Arc::new(StubAdapter::new(ArtifactKind::Cache, &f.calls).failing()))
            .with(Arc::new(StubAdapter::new(ArtifactKind::Files, &f.calls)));

        let outcome = orchestrator(&f, adapters).run(BackupRequest::default()).await?;
        assert_eq!(outcome.status(), RunStatus::Partial);
        assert_eq!(outcome.manifest.artifacts.len(), 2);
        assert!(outcome.manifest.failures.contains_key(&ArtifactKind::Cache));
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_timeout_is_that_artifacts_failure() -> Result<()> {
        let f = fixture(None);
        let mut slow = StubAdapter::new(ArtifactKind::Files, &f.calls);
        slow.delay = Duration::from_secs(5);
        let adapters = AdapterSet::new()
            .with(Arc::new(StubAdapter::new(ArtifactKind::Database, &f.calls)))
            .with(Arc::new(slow));

        let outcome = orchestrator(&f, adapters).run(BackupRequest::default()).await?;
        assert_eq!(outcome.status(), RunStatus::Partial);
        assert!(outcome.manifest.failures[&ArtifactKind::Files].contains("timed out"));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_run_records_completed_artifacts() -> Result<()> {
        let f = fixture(None);
        let token = CancellationToken::new();
        token.cancel();
        let adapters = AdapterSet::new()
            .with(Arc::new(StubAdapter::new(ArtifactKind::Database, &f.calls)));

        let outcome = orchestrator(&f, adapters)
            .with_cancel(token)
            .run(BackupRequest::default())
            .await?;
        assert_eq!(outcome.status(), RunStatus::Cancelled);
        assert!(outcome.manifest.artifacts.is_empty());
        assert!(f.calls.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_between_artifacts_keeps_finished_ones() -> Result<()> {
        let f = fixture(None);
        let token = CancellationToken::new();
        let mut database = StubAdapter::new(ArtifactKind::Database, &f.calls);
        database.cancel_after = Some(token.clone());
        let adapters = AdapterSet::new()
            .with(Arc::new(database))
            .with(Arc::new(StubAdapter::new(ArtifactKind::Cache, &f.calls)))
            .with(Arc::new(StubAdapter::new(ArtifactKind::Files, &f.calls)));

        let outcome = orchestrator(&f, adapters)
            .with_cancel(token)
            .run(BackupRequest::default())
            .await?;
        assert_eq!(outcome.status(), RunStatus::Cancelled);
        assert_eq!(*f.calls.lock().unwrap(), vec![ArtifactKind::Database]);

        let stored = f.manifests.load(&outcome.manifest.id)?;
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert_eq!(
            stored.artifacts.keys().copied().collect::<Vec<_>>(),
            vec![ArtifactKind::Database]
        );
        assert!(stored.failures.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_reverify_mismatch_fails_run_and_skips_upload() -> Result<()> {
        let remote = Arc::new(MemoryRemote::default());
        let f = fixture(Some(remote.clone()));
        let mut config = (*f.config).clone();
        config.remote.enabled = true;
        config.remote.destination = Some("memory".to_string());
        let f = Fixture {
            config: Arc::new(config),
            ..f
        };
        let mut database = StubAdapter::new(ArtifactKind::Database, &f.calls);
        database.misrecord = true;
        let adapters = AdapterSet::new()
            .with(Arc::new(database))
            .with(Arc::new(StubAdapter::new(ArtifactKind::Config, &f.calls)));

        let outcome = orchestrator(&f, adapters).run(BackupRequest::default()).await?;
        assert_eq!(outcome.status(), RunStatus::Failed);
        assert_eq!(outcome.integrity_failures, vec![ArtifactKind::Database]);
        assert!(outcome.manifest.failures[&ArtifactKind::Database].contains("checksum mismatch"));
        // The file itself is there; only its bytes disagree with the record
        let run_dir = f.config.paths.backup_dir.join(&outcome.manifest.id);
        assert!(run_dir.join("database.bin").exists());

        assert!(outcome.manifest.artifacts.values().all(|r| !r.uploaded));
        assert!(remote.keys().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_uploads_mark_records_and_survive_exhaustion() -> Result<()> {
        let remote = Arc::new(MemoryRemote::default());
        let f = fixture(Some(remote.clone()));
        let mut config = (*f.config).clone();
        config.remote.enabled = true;
        config.remote.destination = Some("memory".to_string());
        let f = Fixture {
            config: Arc::new(config),
            ..f
        };
        let adapters = AdapterSet::new()
            .with(Arc::new(StubAdapter::new(ArtifactKind::Database, &f.calls)))
            .with(Arc::new(StubAdapter::new(ArtifactKind::Config, &f.calls)));

        let outcome = orchestrator(&f, adapters.clone()).run(BackupRequest::default()).await?;
        assert_eq!(outcome.status(), RunStatus::Success);
        assert!(outcome.manifest.artifacts.values().all(|r| r.uploaded));
        let id = outcome.manifest.id.clone();
        assert!(remote.keys().contains(&f.manifests.remote_key(&id, MANIFEST_FILE)));

        // Every attempt fails from here on
        remote
            .failures_before_success
            .store(u32::MAX, std::sync::atomic::Ordering::SeqCst);
        let outcome = orchestrator(&f, adapters).run(BackupRequest::default()).await?;
        assert_eq!(outcome.status(), RunStatus::Success);
        assert!(outcome.manifest.artifacts.values().all(|r| !r.uploaded));
        assert_eq!(outcome.upload_failures.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_target_is_configuration_error() {
        let f = fixture(None);
        let adapters = AdapterSet::new()
            .with(Arc::new(StubAdapter::new(ArtifactKind::Database, &f.calls)));
        let request = BackupRequest {
            targets: vec![ArtifactKind::Cache],
            ..BackupRequest::default()
        };
        assert!(matches!(
            orchestrator(&f, adapters).run(request).await,
            Err(StateguardError::Configuration(_))
        ));
    }
}
