//! External tool execution with bounded timeouts.
//!
//! Adapters never spawn processes directly; they go through a
//! [`CommandRunner`] so tests can script tool behaviour.

use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::utils::errors::{Result, StateguardError};

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Rendered without environment values, which may hold credentials.
impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. Errors only when the process could not be spawned
    /// or exceeded its timeout.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run and treat a non-zero exit as an error.
    async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run(spec).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(StateguardError::Transient(format!(
                "`{}` exited with {}: {}",
                spec,
                output
                    .code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                output.stderr.trim()
            )))
        }
    }
}

/// Runs commands as child processes; a child that outlives its timeout is killed.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec, "Running external command");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            StateguardError::Transient(format!("failed to spawn {}: {}", spec.program, e))
        })?;

        let output = tokio::time::timeout(spec.timeout, child.wait_with_output())
            .await
            .map_err(|_| StateguardError::Timeout {
                operation: spec.to_string(),
                after: spec.timeout,
            })??;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    //! A runner whose responses are produced by a closure, recording every call.

    use super::*;
    use std::sync::Mutex;

    type Handler = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync>;

    pub struct ScriptedRunner {
        handler: Handler,
        calls: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedRunner {
        pub fn new<F>(handler: F) -> Self
        where
            F: Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync + 'static,
        {
            Self {
                handler: Box::new(handler),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }

        pub fn rendered(&self) -> Vec<String> {
            self.calls().iter().map(|c| c.to_string()).collect()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(spec.clone());
            (self.handler)(spec)
        }
    }
}
