//! Run configuration.
//!
//! Built once at process start from, in increasing precedence:
//! 1. Built-in defaults
//! 2. System-wide file (`/etc/stateguard/stateguard.toml`)
//! 3. The file passed with `--config`
//! 4. Environment variables prefixed `STATEGUARD_`, using `__` between
//!    section and key (e.g. `STATEGUARD_REMOTE__TOKEN`)
//!
//! The result is immutable and handed to every component; nothing below the
//! entry point reads the environment.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::utils::errors::{Result, StateguardError};

const SYSTEM_CONFIG: &str = "/etc/stateguard/stateguard.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub paths: PathsConfig,
    pub retention: RetentionConfig,
    pub remote: RemoteConfig,
    pub notifier: NotifierConfig,
    pub health: HealthConfig,
    pub services: ServicesConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub files: FilesConfig,
    pub config_files: ConfigFilesConfig,
    pub restore: RestoreConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Local root holding one directory per run
    pub backup_dir: PathBuf,

    /// Locks and the last restore point pointer
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Manifests older than this many days are pruned
    pub days: u32,

    /// Never prune below this many manifests
    pub preserve_newest: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKind {
    /// A mounted directory (NFS, SMB, second disk)
    Filesystem,
    /// An HTTP object endpoint accepting PUT/GET/DELETE
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub kind: RemoteKind,

    /// Directory path or base URL, depending on `kind`
    pub destination: Option<String>,

    /// Key prefix under which run directories are stored
    pub prefix: String,

    /// Bearer token for the HTTP store
    pub token: Option<String>,

    pub upload_attempts: u32,
    pub backoff_ms: u64,

    /// Concurrent artifact uploads
    pub parallelism: usize,

    pub upload_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// JSON webhook receiving run events; log-only when unset
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub urls: Vec<String>,
    pub expected_status: u16,
    pub timeout_secs: u64,

    /// Post-restore health polling
    pub post_restore_attempts: u32,
    pub post_restore_interval_secs: u64,

    /// Minimum success rate before a monitor report is degraded
    pub success_floor: f64,

    /// Command run once when the monitor crosses its failure threshold
    pub rollback_command: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    None,
    Systemd,
    Compose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub controller: ControllerKind,
    pub compose_file: Option<PathBuf>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub name: String,

    /// Database used to issue CREATE/ALTER/DROP DATABASE
    pub maintenance_db: String,

    pub service: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,

    /// Where the cache writes its point-in-time snapshot
    pub rdb_path: PathBuf,

    pub service: Option<String>,
    pub save_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub enabled: bool,

    /// Host path of the mounted volume
    pub volume_path: Option<PathBuf>,

    /// Named container volume, archived through a throwaway container
    pub docker_volume: Option<String>,

    pub worker_image: String,
    pub service: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFilesConfig {
    pub enabled: bool,
    pub root: PathBuf,

    /// Allow-listed paths relative to `root`; nothing else is archived
    pub include: Vec<String>,

    pub service: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    pub create_restore_point: bool,
    pub upload_restore_points: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// pretty or json
    pub format: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("/var/backups/platform"),
            state_dir: PathBuf::from("/var/lib/stateguard"),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: 7,
            preserve_newest: 3,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: RemoteKind::Filesystem,
            destination: None,
            prefix: "backups".to_string(),
            token: None,
            upload_attempts: 3,
            backoff_ms: 2000,
            parallelism: 4,
            upload_timeout_secs: 600,
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 10,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            expected_status: 200,
            timeout_secs: 5,
            post_restore_attempts: 10,
            post_restore_interval_secs: 6,
            success_floor: 0.95,
            rollback_command: Vec::new(),
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            controller: ControllerKind::None,
            compose_file: None,
            timeout_secs: 120,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            name: String::new(),
            maintenance_db: "postgres".to_string(),
            service: None,
            timeout_secs: 3600,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            rdb_path: PathBuf::from("/var/lib/redis/dump.rdb"),
            service: None,
            save_timeout_secs: 300,
            poll_interval_ms: 1000,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            volume_path: None,
            docker_volume: None,
            worker_image: "alpine:3.20".to_string(),
            service: None,
            timeout_secs: 1800,
        }
    }
}

impl Default for ConfigFilesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            root: PathBuf::from("/opt/platform"),
            include: Vec::new(),
            service: None,
            timeout_secs: 120,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            create_restore_point: true,
            upload_restore_points: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl RunConfig {
    /// Load and validate configuration from files and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name(SYSTEM_CONFIG).required(false));

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("STATEGUARD")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("health.urls")
                .with_list_parse_key("health.rollback_command")
                .with_list_parse_key("config_files.include")
                .try_parsing(true),
        );

        let config: RunConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject missing or contradictory inputs before any work starts.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(StateguardError::Configuration(msg));

        if self.retention.preserve_newest == 0 {
            return fail("retention.preserve_newest must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.health.success_floor) {
            return fail(format!(
                "health.success_floor must be within 0..=1, got {}",
                self.health.success_floor
            ));
        }
        if self.remote.enabled {
            if self.remote.destination.as_deref().unwrap_or("").is_empty() {
                return fail("remote.destination is required when remote.enabled".into());
            }
            if self.remote.upload_attempts == 0 {
                return fail("remote.upload_attempts must be at least 1".into());
            }
            if self.remote.parallelism == 0 {
                return fail("remote.parallelism must be at least 1".into());
            }
        }
        if self.database.enabled && self.database.name.is_empty() {
            return fail("database.name is required when database.enabled".into());
        }
        if self.files.enabled
            && self.files.volume_path.is_none() == self.files.docker_volume.is_none()
        {
            return fail("files needs exactly one of volume_path or docker_volume".into());
        }
        if self.config_files.enabled {
            if self.config_files.include.is_empty() {
                return fail("config_files.include must list at least one path".into());
            }
            for entry in &self.config_files.include {
                if !is_contained_relative(Path::new(entry)) {
                    return fail(format!(
                        "config_files.include entry '{entry}' must be relative to root and stay inside it"
                    ));
                }
            }
        }
        if self.services.controller == ControllerKind::Compose && self.services.compose_file.is_none()
        {
            return fail("services.compose_file is required for the compose controller".into());
        }
        Ok(())
    }

    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention.days))
    }
}

impl RemoteConfig {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl HealthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn post_restore_interval(&self) -> Duration {
        Duration::from_secs(self.post_restore_interval_secs)
    }
}

/// A relative path made only of normal components.
pub(crate) fn is_contained_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}
