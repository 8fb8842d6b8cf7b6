//! Durable off-host copies of run directories.
//!
//! Objects are addressed by key `<prefix>/<run id>/<file name>`. Failures
//! here never abort a backup: upload exhaustion is recorded on the artifact
//! and the run degrades to a local-only backup.

pub mod filesystem;
pub mod http;
pub mod progress;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{RemoteConfig, RemoteKind};
use crate::manifest::retention::{parse_run_id, select_expired, RunEntry};
use crate::utils::errors::{Result, StateguardError};

pub use filesystem::FilesystemRemote;
pub use http::HttpRemote;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Human-readable destination for logs.
    fn describe(&self) -> String;

    async fn upload(&self, local: &Path, key: &str) -> Result<()>;
    async fn download(&self, key: &str, local: &Path) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove whole runs older than `cutoff`, always keeping the
    /// `preserve_newest` most recent ones. Returns the deleted run ids.
    async fn delete_older_than(
        &self,
        prefix: &str,
        cutoff: DateTime<Utc>,
        preserve_newest: usize,
    ) -> Result<Vec<String>> {
        let objects = self.list(prefix).await?;
        let runs = group_runs(prefix, &objects);

        let entries = runs
            .iter()
            .filter_map(|(id, keys)| {
                let created_at = parse_run_id(id).or_else(|| {
                    objects
                        .iter()
                        .filter(|o| keys.contains(&o.key))
                        .filter_map(|o| o.last_modified)
                        .max()
                })?;
                Some(RunEntry {
                    id: id.clone(),
                    created_at,
                })
            })
            .collect();

        let expired = select_expired(entries, cutoff, preserve_newest);
        for id in &expired {
            for key in runs.get(id).into_iter().flatten() {
                self.delete(key).await?;
            }
            info!(manifest_id = %id, store = %self.describe(), "Pruned remote run");
        }
        Ok(expired)
    }
}

/// Group object keys by the run id segment following `prefix`.
fn group_runs(prefix: &str, objects: &[RemoteObject]) -> BTreeMap<String, Vec<String>> {
    let mut runs: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let lead = format!("{}/", prefix.trim_end_matches('/'));
    for object in objects {
        let rest = object.key.strip_prefix(&lead).unwrap_or(&object.key);
        if let Some((id, _)) = rest.split_once('/') {
            runs.entry(id.to_string()).or_default().push(object.key.clone());
        }
    }
    runs
}

pub fn object_key(prefix: &str, run_id: &str, filename: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{run_id}/{filename}")
    } else {
        format!("{prefix}/{run_id}/{filename}")
    }
}

pub fn build_remote(config: &RemoteConfig) -> Result<Option<Arc<dyn RemoteStore>>> {
    if !config.enabled {
        return Ok(None);
    }
    let destination = config.destination.clone().ok_or_else(|| {
        StateguardError::Configuration("remote.destination is required".to_string())
    })?;
    let store: Arc<dyn RemoteStore> = match config.kind {
        RemoteKind::Filesystem => Arc::new(FilesystemRemote::new(destination)),
        RemoteKind::Http => Arc::new(HttpRemote::new(
            destination,
            config.token.clone(),
            config.upload_timeout(),
        )?),
    };
    Ok(Some(store))
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on each individual attempt
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            attempts: config.upload_attempts.max(1),
            initial_backoff: config.backoff(),
            max_backoff: Duration::from_secs(30),
            attempt_timeout: config.upload_timeout(),
        }
    }
}

/// Upload with bounded retries and exponential backoff.
///
/// Only transient and HTTP failures are retried; anything else (e.g. the
/// local file vanished) fails on the first attempt.
pub async fn upload_with_retry(
    store: &dyn RemoteStore,
    local: &Path,
    key: &str,
    policy: &RetryPolicy,
) -> Result<()> {
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;

    loop {
        let result = match tokio::time::timeout(policy.attempt_timeout, store.upload(local, key)).await
        {
            Ok(result) => result,
            Err(_) => Err(StateguardError::Timeout {
                operation: format!("upload of {key}"),
                after: policy.attempt_timeout,
            }),
        };

        match result {
            Ok(()) => {
                info!(key, attempt, "Uploaded to {}", store.describe());
                return Ok(());
            }
            Err(e) if attempt < policy.attempts && is_retryable(&e) => {
                warn!(key, attempt, "Upload failed, retrying in {}ms: {}", backoff.as_millis(), e);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
                attempt += 1;
            }
            Err(e) => {
                warn!(key, attempt, "Upload failed, giving up: {}", e);
                return Err(e);
            }
        }
    }
}

fn is_retryable(err: &StateguardError) -> bool {
    err.is_transient() || matches!(err, StateguardError::Http(_))
}
