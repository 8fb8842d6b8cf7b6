//! Stopping and starting the live processes that depend on a data source.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::command::{CommandRunner, CommandSpec};
use crate::config::{ControllerKind, ServicesConfig};
use crate::utils::errors::Result;

#[async_trait]
pub trait ServiceController: Send + Sync {
    async fn stop(&self, service: &str) -> Result<()>;
    async fn start(&self, service: &str) -> Result<()>;
}

pub fn build_controller(
    config: &ServicesConfig,
    runner: Arc<dyn CommandRunner>,
) -> Arc<dyn ServiceController> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match (config.controller, &config.compose_file) {
        (ControllerKind::Systemd, _) => Arc::new(SystemdController { runner, timeout }),
        (ControllerKind::Compose, Some(file)) => Arc::new(ComposeController {
            runner,
            compose_file: file.clone(),
            timeout,
        }),
        _ => Arc::new(NoopController),
    }
}

/// Leaves process management to the operator.
pub struct NoopController;

#[async_trait]
impl ServiceController for NoopController {
    async fn stop(&self, service: &str) -> Result<()> {
        info!(service, "No service controller configured, not stopping");
        Ok(())
    }

    async fn start(&self, service: &str) -> Result<()> {
        info!(service, "No service controller configured, not starting");
        Ok(())
    }
}

pub struct SystemdController {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl SystemdController {
    async fn systemctl(&self, verb: &str, service: &str) -> Result<()> {
        info!(service, "systemctl {}", verb);
        let spec = CommandSpec::new("systemctl", self.timeout).args([verb, service]);
        self.runner.run_checked(&spec).await.map(|_| ())
    }
}

#[async_trait]
impl ServiceController for SystemdController {
    async fn stop(&self, service: &str) -> Result<()> {
        self.systemctl("stop", service).await
    }

    async fn start(&self, service: &str) -> Result<()> {
        self.systemctl("start", service).await
    }
}

pub struct ComposeController {
    runner: Arc<dyn CommandRunner>,
    compose_file: PathBuf,
    timeout: Duration,
}

impl ComposeController {
    async fn compose(&self, verb: &str, service: &str) -> Result<()> {
        info!(service, "docker compose {}", verb);
        let spec = CommandSpec::new("docker", self.timeout)
            .arg("compose")
            .arg("-f")
            .arg(self.compose_file.to_string_lossy())
            .args([verb, service]);
        self.runner.run_checked(&spec).await.map(|_| ())
    }
}

#[async_trait]
impl ServiceController for ComposeController {
    async fn stop(&self, service: &str) -> Result<()> {
        self.compose("stop", service).await
    }

    async fn start(&self, service: &str) -> Result<()> {
        self.compose("start", service).await
    }
}
