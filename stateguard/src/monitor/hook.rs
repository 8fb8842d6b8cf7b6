//! What happens when the monitor decides a rollback is needed.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::adapters::{CommandRunner, CommandSpec};
use crate::models::RollbackTrigger;
use crate::utils::errors::{Result, StateguardError};

#[async_trait]
pub trait RollbackHook: Send + Sync {
    async fn trigger(&self, trigger: &RollbackTrigger) -> Result<()>;
}

/// Only records the decision; an operator performs the rollback.
pub struct LogRollbackHook;

#[async_trait]
impl RollbackHook for LogRollbackHook {
    async fn trigger(&self, trigger: &RollbackTrigger) -> Result<()> {
        error!(
            consecutive_failures = trigger.consecutive_failures,
            "Rollback required: {}", trigger.reason
        );
        Ok(())
    }
}

/// Runs a configured command, e.g. a deployment rollback script. The
/// trigger reason is passed in `STATEGUARD_ROLLBACK_REASON`.
pub struct CommandRollbackHook {
    argv: Vec<String>,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl CommandRollbackHook {
    pub fn new(argv: Vec<String>, runner: Arc<dyn CommandRunner>, timeout: Duration) -> Result<Self> {
        if argv.is_empty() {
            return Err(StateguardError::Configuration(
                "health.rollback_command is empty".to_string(),
            ));
        }
        Ok(Self { argv, runner, timeout })
    }
}

#[async_trait]
impl RollbackHook for CommandRollbackHook {
    async fn trigger(&self, trigger: &RollbackTrigger) -> Result<()> {
        let spec = CommandSpec::new(&self.argv[0], self.timeout)
            .args(self.argv[1..].iter().cloned())
            .env("STATEGUARD_ROLLBACK_REASON", &trigger.reason)
            .env(
                "STATEGUARD_CONSECUTIVE_FAILURES",
                trigger.consecutive_failures.to_string(),
            );
        info!(command = %spec, "Invoking rollback command");
        self.runner.run_checked(&spec).await.map(|_| ())
    }
}

pub fn build_hook(argv: &[String], runner: Arc<dyn CommandRunner>) -> Result<Arc<dyn RollbackHook>> {
    if argv.is_empty() {
        Ok(Arc::new(LogRollbackHook))
    } else {
        Ok(Arc::new(CommandRollbackHook::new(
            argv.to_vec(),
            runner,
            Duration::from_secs(300),
        )?))
    }
}
