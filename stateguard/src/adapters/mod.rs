//! Data source adapters.
//!
//! Each adapter produces and consumes exactly one artifact for one stateful
//! source. The orchestrators only see the [`DataSourceAdapter`] trait; the
//! concrete adapters talk to their stores through external tools run by a
//! [`CommandRunner`](command::CommandRunner).

pub mod cache;
pub mod command;
pub mod config_files;
pub mod database;
pub mod files;
pub mod service;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::RunConfig;
use crate::models::{ArtifactKind, ArtifactRecord, StoredArtifact};
use crate::utils::errors::{Result, StateguardError};

pub use cache::CacheAdapter;
pub use command::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use config_files::ConfigAdapter;
pub use database::DatabaseAdapter;
pub use files::FilesAdapter;
pub use service::{build_controller, ServiceController};

#[async_trait]
pub trait DataSourceAdapter: Send + Sync {
    fn kind(&self) -> ArtifactKind;

    /// Whether a snapshot failure aborts the whole run.
    fn is_critical(&self) -> bool {
        self.kind().is_critical()
    }

    /// Live process that must be stopped while this source is restored.
    fn service(&self) -> Option<&str> {
        None
    }

    /// Upper bound for a whole snapshot or restore, covering every external
    /// command it runs.
    fn timeout(&self) -> Duration;

    /// Write this source's artifact into `dest_dir` and describe it.
    async fn snapshot(&self, dest_dir: &Path) -> Result<ArtifactRecord>;

    /// Replace the live source with the artifact's contents.
    async fn restore(&self, artifact: &StoredArtifact) -> Result<()>;
}

/// The adapters configured for this host, keyed by kind.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: BTreeMap<ArtifactKind, Arc<dyn DataSourceAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one of the same kind.
    pub fn with(mut self, adapter: Arc<dyn DataSourceAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn from_config(config: &RunConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let mut set = Self::new();
        if config.database.enabled {
            set = set.with(Arc::new(DatabaseAdapter::new(
                config.database.clone(),
                runner.clone(),
            )));
        }
        if config.cache.enabled {
            set = set.with(Arc::new(CacheAdapter::new(config.cache.clone(), runner.clone())));
        }
        if config.files.enabled {
            set = set.with(Arc::new(FilesAdapter::new(
                config.files.clone(),
                config.paths.state_dir.join("scratch"),
                runner,
            )));
        }
        if config.config_files.enabled {
            set = set.with(Arc::new(ConfigAdapter::new(config.config_files.clone())));
        }
        set
    }

    pub fn get(&self, kind: ArtifactKind) -> Option<&Arc<dyn DataSourceAdapter>> {
        self.adapters.get(&kind)
    }

    /// Resolve a kind or fail with a configuration error naming it.
    pub fn require(&self, kind: ArtifactKind) -> Result<&Arc<dyn DataSourceAdapter>> {
        self.get(kind).ok_or_else(|| {
            StateguardError::Configuration(format!("no {kind} adapter is configured"))
        })
    }

    pub fn kinds(&self) -> Vec<ArtifactKind> {
        self.adapters.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Hash and size a freshly written artifact off the async runtime.
pub(crate) async fn record_artifact(kind: ArtifactKind, path: PathBuf) -> Result<ArtifactRecord> {
    tokio::task::spawn_blocking(move || ArtifactRecord::from_file(kind, &path))
        .await
        .map_err(|e| StateguardError::adapter(kind, format!("checksum task failed: {e}")))?
}

/// Run blocking archive work on the blocking pool, tagging failures with the kind.
pub(crate) async fn blocking<F, T>(kind: ArtifactKind, work: F) -> Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StateguardError::adapter(kind, format!("worker panicked: {e}")))?
        .map_err(|e| StateguardError::adapter(kind, e.to_string()))
}

/// Suffix for side-by-side copies made during a restore.
pub(crate) fn restore_suffix() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%S").to_string()
}
