//! Shared harness: in-memory data sources and a filesystem remote.

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use stateguard::adapters::{AdapterSet, DataSourceAdapter};
use stateguard::config::RunConfig;
use stateguard::executor::BackupOrchestrator;
use stateguard::manifest::ManifestService;
use stateguard::models::{ArtifactKind, ArtifactRecord, StoredArtifact};
use stateguard::notify::LogNotifier;
use stateguard::remote::{FilesystemRemote, RemoteStore};
use stateguard::restore::RestoreOrchestrator;
use stateguard::{Result, StateguardError};

pub type CallLog = Arc<Mutex<Vec<String>>>;

/// A data source whose live state is a string. Snapshots write it out,
/// restores replace it with the artifact's contents.
pub struct MemorySource {
    kind: ArtifactKind,
    live: Mutex<String>,
    calls: CallLog,
    fail_snapshot: bool,
}

impl MemorySource {
    pub fn new(kind: ArtifactKind, live: &str, calls: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            kind,
            live: Mutex::new(live.to_string()),
            calls: Arc::clone(calls),
            fail_snapshot: false,
        })
    }

    pub fn failing(kind: ArtifactKind, calls: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            kind,
            live: Mutex::new(String::new()),
            calls: Arc::clone(calls),
            fail_snapshot: true,
        })
    }

    pub fn live(&self) -> String {
        self.live.lock().unwrap().clone()
    }

    pub fn set_live(&self, value: &str) {
        *self.live.lock().unwrap() = value.to_string();
    }
}

#[async_trait]
impl DataSourceAdapter for MemorySource {
    fn kind(&self) -> ArtifactKind {
        self.kind
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn snapshot(&self, dest_dir: &Path) -> Result<ArtifactRecord> {
        self.calls.lock().unwrap().push(format!("snapshot:{}", self.kind));
        if self.fail_snapshot {
            return Err(StateguardError::adapter(self.kind, "dump tool exited 1"));
        }
        let path = dest_dir.join(format!("{}.dat", self.kind));
        std::fs::write(&path, self.live().as_bytes())?;
        ArtifactRecord::from_file(self.kind, &path)
    }

    async fn restore(&self, artifact: &StoredArtifact) -> Result<()> {
        self.calls.lock().unwrap().push(format!("restore:{}", self.kind));
        self.set_live(&std::fs::read_to_string(&artifact.path)?);
        Ok(())
    }
}

pub struct Harness {
    pub temp: TempDir,
    pub config: Arc<RunConfig>,
    pub manifests: Arc<ManifestService>,
    pub remote: Option<Arc<FilesystemRemote>>,
    pub calls: CallLog,
}

impl Harness {
    pub fn new(with_remote: bool) -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = RunConfig::default();
        config.paths.backup_dir = temp.path().join("backups");
        config.paths.state_dir = temp.path().join("state");
        config.remote.backoff_ms = 1;
        config.health.post_restore_interval_secs = 0;

        let remote = with_remote.then(|| Arc::new(FilesystemRemote::new(temp.path().join("remote"))));
        if with_remote {
            config.remote.enabled = true;
            config.remote.destination = Some(temp.path().join("remote").display().to_string());
        }
        let manifests = Arc::new(ManifestService::new(
            &config.paths.backup_dir,
            remote.clone().map(|r| r as Arc<dyn RemoteStore>),
            config.remote.prefix.clone(),
        ));

        Self {
            temp,
            config: Arc::new(config),
            manifests,
            remote,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn backup(&self, adapters: &AdapterSet) -> Arc<BackupOrchestrator> {
        Arc::new(BackupOrchestrator::new(
            self.config.clone(),
            adapters.clone(),
            self.manifests.clone(),
            Arc::new(LogNotifier),
        ))
    }

    pub fn restore(&self, adapters: &AdapterSet) -> RestoreOrchestrator {
        RestoreOrchestrator::new(
            self.config.clone(),
            adapters.clone(),
            self.backup(adapters),
            Arc::new(LogNotifier),
        )
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}
