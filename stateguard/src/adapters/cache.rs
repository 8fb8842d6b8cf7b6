//! In-memory cache adapter (Redis).
//!
//! The snapshot asks the server for a background save and waits, with a
//! bound, for LASTSAVE to advance before copying the resulting RDB file.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::command::{CommandRunner, CommandSpec};
use super::{record_artifact, DataSourceAdapter};
use crate::config::CacheConfig;
use crate::models::{ArtifactKind, ArtifactRecord, StoredArtifact};
use crate::utils::errors::{Result, StateguardError};

const ARTIFACT_NAME: &str = "cache.rdb";
const KIND: ArtifactKind = ArtifactKind::Cache;
const CLI_TIMEOUT: Duration = Duration::from_secs(10);

pub struct CacheAdapter {
    config: CacheConfig,
    runner: Arc<dyn CommandRunner>,
}

impl CacheAdapter {
    pub fn new(config: CacheConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    async fn cli(&self, command: &str) -> Result<String> {
        let mut spec = CommandSpec::new("redis-cli", CLI_TIMEOUT).args([
            "-h".to_string(),
            self.config.host.clone(),
            "-p".to_string(),
            self.config.port.to_string(),
            command.to_string(),
        ]);
        if let Some(password) = &self.config.password {
            spec = spec.env("REDISCLI_AUTH", password);
        }
        let output = self.runner.run_checked(&spec).await?;
        let reply = output.stdout.trim().to_string();
        // redis-cli exits 0 on server-side errors
        if reply.starts_with("ERR") || reply.starts_with("NOAUTH") {
            return Err(StateguardError::Transient(format!("{command}: {reply}")));
        }
        Ok(reply)
    }

    async fn last_save(&self) -> Result<i64> {
        let reply = self.cli("LASTSAVE").await?;
        reply
            .trim_start_matches("(integer) ")
            .parse()
            .map_err(|_| StateguardError::Transient(format!("unexpected LASTSAVE reply '{reply}'")))
    }

    async fn wait_for_save(&self, previous: i64) -> Result<()> {
        let wait = Duration::from_secs(self.config.save_timeout_secs);
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let deadline = Instant::now() + wait;

        loop {
            let current = self.last_save().await?;
            if current > previous {
                debug!(last_save = current, "Background save finished");
                return Ok(());
            }
            if Instant::now() + poll > deadline {
                return Err(StateguardError::Timeout {
                    operation: "cache background save".to_string(),
                    after: wait,
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn fail(err: StateguardError) -> StateguardError {
        match err {
            e @ StateguardError::Adapter { .. } => e,
            e => StateguardError::adapter(KIND, e.to_string()),
        }
    }
}

#[async_trait]
impl DataSourceAdapter for CacheAdapter {
    fn kind(&self) -> ArtifactKind {
        KIND
    }

    fn service(&self) -> Option<&str> {
        self.config.service.as_deref()
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.save_timeout_secs) + CLI_TIMEOUT * 3
    }

    async fn snapshot(&self, dest_dir: &Path) -> Result<ArtifactRecord> {
        let result: Result<PathBuf> = async {
            let before = self.last_save().await?;
            let reply = self.cli("BGSAVE").await?;
            info!(reply = %reply, "Requested background save");
            self.wait_for_save(before).await?;

            let path = dest_dir.join(ARTIFACT_NAME);
            tokio::fs::copy(&self.config.rdb_path, &path).await?;
            Ok(path)
        }
        .await;

        record_artifact(KIND, result.map_err(Self::fail)?).await
    }

    async fn restore(&self, artifact: &StoredArtifact) -> Result<()> {
        let target = &self.config.rdb_path;
        let mut staged = target.clone().into_os_string();
        staged.push(".restore");
        let staged = PathBuf::from(staged);

        info!(rdb = %target.display(), "Replacing cache snapshot file");
        let result: Result<()> = async {
            tokio::fs::copy(&artifact.path, &staged).await?;
            tokio::fs::rename(&staged, target).await?;
            Ok(())
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&staged).await;
        }
        result.map_err(Self::fail)
    }
}
