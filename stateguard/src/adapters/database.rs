//! Relational database adapter (PostgreSQL).
//!
//! Snapshots are custom-format logical dumps. A restore never touches the
//! live database until the dump has fully loaded into a side database; the
//! two are then swapped by renaming inside a single transaction.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::command::{CommandRunner, CommandSpec};
use super::{record_artifact, restore_suffix, DataSourceAdapter};
use crate::config::DatabaseConfig;
use crate::models::{ArtifactKind, ArtifactRecord, StoredArtifact};
use crate::utils::errors::{Result, StateguardError};

const ARTIFACT_NAME: &str = "database.dump";
const KIND: ArtifactKind = ArtifactKind::Database;
/// createdb, pg_restore, the swap and the final dropdb
const RESTORE_COMMANDS: u32 = 4;
/// Process start-up and teardown on top of the per-command budgets
const COMMAND_SLACK: Duration = Duration::from_secs(5);

pub struct DatabaseAdapter {
    config: DatabaseConfig,
    runner: Arc<dyn CommandRunner>,
}

impl DatabaseAdapter {
    pub fn new(config: DatabaseConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    fn command(&self, program: &str) -> CommandSpec {
        let mut spec = CommandSpec::new(program, self.command_timeout()).args([
            "--host".to_string(),
            self.config.host.clone(),
            "--port".to_string(),
            self.config.port.to_string(),
            "--username".to_string(),
            self.config.user.clone(),
        ]);
        if let Some(password) = &self.config.password {
            spec = spec.env("PGPASSWORD", password);
        }
        spec
    }

    /// Budget for any single client command.
    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    /// Run SQL against the maintenance database, one transaction per call.
    async fn psql(&self, statements: &[String]) -> Result<()> {
        let mut spec = self
            .command("psql")
            .args(["--no-psqlrc", "-v", "ON_ERROR_STOP=1", "--single-transaction"])
            .arg("--dbname")
            .arg(&self.config.maintenance_db);
        for sql in statements {
            spec = spec.arg("-c").arg(sql);
        }
        self.runner.run_checked(&spec).await.map(|_| ())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        // CREATE DATABASE cannot run inside a transaction block either
        let spec = self.command("createdb").arg(name);
        self.runner.run_checked(&spec).await.map(|_| ())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        // DROP DATABASE cannot run inside a transaction block
        let spec = self
            .command("dropdb")
            .args(["--if-exists", "--force", name]);
        self.runner.run_checked(&spec).await.map(|_| ())
    }

    fn fail(&self, stage: &str, err: StateguardError) -> StateguardError {
        StateguardError::adapter(KIND, format!("{stage}: {err}"))
    }
}

#[async_trait]
impl DataSourceAdapter for DatabaseAdapter {
    fn kind(&self) -> ArtifactKind {
        KIND
    }

    fn service(&self) -> Option<&str> {
        self.config.service.as_deref()
    }

    /// Covers every command of a restore, so the bound cannot fire once
    /// the swap has committed.
    fn timeout(&self) -> Duration {
        (self.command_timeout() + COMMAND_SLACK) * RESTORE_COMMANDS
    }

    async fn snapshot(&self, dest_dir: &Path) -> Result<ArtifactRecord> {
        let path = dest_dir.join(ARTIFACT_NAME);
        info!(database = %self.config.name, "Dumping database");

        let spec = self
            .command("pg_dump")
            .args(["--format=custom", "--no-owner", "--no-privileges"])
            .arg("--file")
            .arg(path.to_string_lossy())
            .arg(&self.config.name);

        if let Err(e) = self.runner.run_checked(&spec).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(self.fail("pg_dump", e));
        }
        if !path.exists() {
            return Err(StateguardError::adapter(KIND, "pg_dump produced no output file"));
        }

        record_artifact(KIND, path).await
    }

    async fn restore(&self, artifact: &StoredArtifact) -> Result<()> {
        let live = &self.config.name;
        let suffix = restore_suffix();
        let side = format!("{live}_restore_{suffix}");
        let retired = format!("{live}_pre_restore_{suffix}");

        info!(database = %live, side = %side, "Loading dump into side database");
        self.create_database(&side)
            .await
            .map_err(|e| self.fail("create side database", e))?;

        let load = self
            .command("pg_restore")
            .args(["--no-owner", "--no-privileges", "--exit-on-error"])
            .arg("--dbname")
            .arg(&side)
            .arg(artifact.path.to_string_lossy());

        if let Err(e) = self.runner.run_checked(&load).await {
            // The live database was never touched; discard the half-loaded copy
            if let Err(drop_err) = self.drop_database(&side).await {
                warn!(side = %side, "Failed to drop side database: {}", drop_err);
            }
            return Err(self.fail("pg_restore", e));
        }

        info!(database = %live, "Swapping restored database into place");
        self.psql(&[
            format!(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname IN ({}, {}) AND pid <> pg_backend_pid()",
                quote_literal(live),
                quote_literal(&side)
            ),
            format!(
                "ALTER DATABASE {} RENAME TO {}",
                quote_ident(live),
                quote_ident(&retired)
            ),
            format!(
                "ALTER DATABASE {} RENAME TO {}",
                quote_ident(&side),
                quote_ident(live)
            ),
        ])
        .await
        .map_err(|e| self.fail("swap", e))?;

        if let Err(e) = self.drop_database(&retired).await {
            warn!(retired = %retired, "Restore succeeded but the old database was kept: {}", e);
        }
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
