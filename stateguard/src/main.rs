//! Stateguard - main entry point
//!
//! Backup, restore and health-driven rollback for the platform's stateful
//! services. Logs go to stderr; stdout carries only the final summary.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use stateguard::adapters::{build_controller, AdapterSet, CommandRunner, ProcessRunner};
use stateguard::config::RunConfig;
use stateguard::daemon::ShutdownCoordinator;
use stateguard::executor::{BackupOrchestrator, BackupRequest};
use stateguard::manifest::ManifestService;
use stateguard::models::{ArtifactKind, RestoreRequest, RestoreScope, RunStatus};
use stateguard::monitor::{build_endpoints, build_hook, HealthMonitor, HttpHealthEndpoint};
use stateguard::notify::{build_notifier, Notifier};
use stateguard::remote::build_remote;
use stateguard::remote::progress::format_bytes;
use stateguard::restore::{RestoreOrchestrator, RestoreReport};
use stateguard::utils::lock::{Operation, RunLock};
use stateguard::utils::{self, StateguardError};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Print the summary as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take, inspect and prune backups
    #[command(subcommand)]
    Backup(BackupCommand),

    /// Restore a backup or roll back to a restore point
    #[command(subcommand)]
    Restore(RestoreCommand),

    /// Watch service health after a change
    #[command(subcommand)]
    Monitor(MonitorCommand),
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    /// Snapshot every configured source
    Run {
        /// Comma separated subset: db, cache, files, config
        #[arg(long)]
        targets: Option<String>,

        /// Keep artifacts local even when a remote store is configured
        #[arg(long)]
        no_remote: bool,
    },

    /// Recompute checksums of a stored run
    Verify {
        #[arg(long)]
        manifest: String,

        /// Limit verification to one kind
        #[arg(long, default_value = "full")]
        scope: RestoreScope,
    },

    /// List stored runs, newest first
    List,

    /// Apply retention without taking a backup
    Prune,
}

#[derive(Subcommand, Debug)]
enum RestoreCommand {
    /// Restore a stored run
    Run(RestoreRunArgs),

    /// Restore a restore point over the current state
    Rollback {
        /// Restore point id; defaults to the last one recorded
        #[arg(long)]
        to: Option<String>,

        /// Proceed over a failed integrity check
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct RestoreRunArgs {
    #[arg(long)]
    manifest: String,

    #[arg(long, default_value = "full")]
    scope: RestoreScope,

    /// Download the run from the remote store first
    #[arg(long)]
    from_remote: bool,

    /// Proceed over a failed integrity check
    #[arg(long)]
    force: bool,

    /// Verify only, change nothing
    #[arg(long)]
    verify_only: bool,
}

#[derive(Subcommand, Debug)]
enum MonitorCommand {
    /// Poll health endpoints and trigger rollback on sustained failure
    Health {
        /// Seconds to monitor for
        #[arg(long, default_value_t = 300)]
        duration: u64,

        /// Seconds between rounds
        #[arg(long, default_value_t = 10)]
        interval: u64,

        /// Consecutive failed rounds before rollback; 0 never triggers
        #[arg(long, default_value_t = 3)]
        threshold: u32,

        /// Endpoint to poll instead of the configured ones (repeatable)
        #[arg(long = "url")]
        urls: Vec<String>,
    },
}

/// Components shared by every command
struct App {
    config: Arc<RunConfig>,
    runner: Arc<dyn CommandRunner>,
    adapters: AdapterSet,
    manifests: Arc<ManifestService>,
    notifier: Arc<dyn Notifier>,
}

impl App {
    fn build(config: RunConfig) -> stateguard::Result<Self> {
        let config = Arc::new(config);
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
        let remote = build_remote(&config.remote)?;
        let manifests = Arc::new(ManifestService::new(
            &config.paths.backup_dir,
            remote,
            config.remote.prefix.clone(),
        ));
        Ok(Self {
            adapters: AdapterSet::from_config(&config, runner.clone()),
            notifier: build_notifier(&config.notifier)?,
            config,
            runner,
            manifests,
        })
    }

    fn backup(&self) -> BackupOrchestrator {
        BackupOrchestrator::new(
            self.config.clone(),
            self.adapters.clone(),
            self.manifests.clone(),
            self.notifier.clone(),
        )
    }

    fn restore(&self) -> stateguard::Result<RestoreOrchestrator> {
        Ok(RestoreOrchestrator::new(
            self.config.clone(),
            self.adapters.clone(),
            Arc::new(self.backup()),
            self.notifier.clone(),
        )
        .with_controller(build_controller(&self.config.services, self.runner.clone()))
        .with_endpoints(build_endpoints(&self.config.health)?))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    let config = match RunConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("stateguard: {e}");
            return ExitCode::from(startup_failure_code(&cli.command));
        }
    };

    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = utils::logger::init(log_level, &config.log.format) {
        eprintln!("stateguard: could not initialise logging: {e}");
    }

    tracing::info!("stateguard v{}", env!("CARGO_PKG_VERSION"));

    match run(&cli, config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("stateguard: {e:#}");
            ExitCode::from(startup_failure_code(&cli.command))
        }
    }
}

async fn run(cli: &Cli, config: RunConfig) -> Result<u8> {
    let app = App::build(config)?;

    match &cli.command {
        Command::Backup(BackupCommand::Run { targets, no_remote }) => {
            let request = BackupRequest {
                targets: match targets {
                    Some(list) => ArtifactKind::parse_list(list)?,
                    None => Vec::new(),
                },
                no_remote: *no_remote,
                restore_point_for: None,
            };

            let shutdown = ShutdownCoordinator::new();
            let listener = shutdown.spawn_listener();
            let outcome = app.backup().with_cancel(shutdown.token()).run(request).await;
            listener.abort();
            let outcome = outcome?;

            if cli.json {
                print_json(&BackupSummary::from(&outcome))?;
            } else {
                let m = &outcome.manifest;
                println!("{} {} ({}, {} ms)", m.id, m.status, format_bytes(m.total_bytes()), m.duration_ms);
                for record in m.artifacts.values() {
                    println!(
                        "  {:<8} {:>10}  {}{}",
                        record.kind,
                        format_bytes(record.size_bytes),
                        record.checksum_sha256,
                        if record.uploaded { "  uploaded" } else { "" }
                    );
                }
                for (kind, message) in &m.failures {
                    println!("  {kind:<8} FAILED  {message}");
                }
            }

            Ok(if outcome.status() == RunStatus::Cancelled {
                4
            } else if !outcome.integrity_failures.is_empty() {
                1
            } else {
                match outcome.status() {
                    RunStatus::Success => 0,
                    RunStatus::Partial => 2,
                    _ => 3,
                }
            })
        }

        Command::Backup(BackupCommand::Verify { manifest, scope }) => {
            let report = app.manifests.verify(manifest, *scope).await?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!("{} {}", report.manifest_id, if report.ok { "verified" } else { "MISMATCH" });
                for mismatch in &report.mismatches {
                    println!("  {:<8} {}", mismatch.kind, mismatch.reason);
                }
            }
            Ok(if report.ok { 0 } else { 1 })
        }

        Command::Backup(BackupCommand::List) => {
            let manifests = app.manifests.list()?;
            if cli.json {
                print_json(&manifests)?;
            } else {
                for m in &manifests {
                    let kinds: Vec<&str> = m.artifacts.keys().map(|k| k.as_str()).collect();
                    println!(
                        "{:<24} {:<9} {:>10}  {}{}",
                        m.id,
                        m.status,
                        format_bytes(m.total_bytes()),
                        kinds.join(","),
                        if m.is_restore_point { "  (restore point)" } else { "" }
                    );
                }
            }
            Ok(0)
        }

        Command::Backup(BackupCommand::Prune) => {
            let _lock = RunLock::acquire(&app.config.paths.state_dir, Operation::Backup)?;
            let (local, remote) = app.backup().prune().await;
            if cli.json {
                print_json(&serde_json::json!({ "pruned_local": local, "pruned_remote": remote }))?;
            } else {
                println!("pruned {} local and {} remote runs", local.len(), remote.len());
            }
            Ok(0)
        }

        Command::Restore(RestoreCommand::Run(args)) => {
            let mut request = RestoreRequest::new(args.manifest.clone(), args.scope);
            request.from_remote = args.from_remote;
            request.force = args.force;
            request.verify_only = args.verify_only;

            let report = app.restore()?.restore(request).await?;
            print_restore(cli.json, &report)?;
            Ok(report.exit_code() as u8)
        }

        Command::Restore(RestoreCommand::Rollback { to, force }) => {
            let report = app.restore()?.rollback(to.as_deref(), *force).await?;
            print_restore(cli.json, &report)?;
            Ok(report.exit_code() as u8)
        }

        Command::Monitor(MonitorCommand::Health {
            duration,
            interval,
            threshold,
            urls,
        }) => {
            let health = &app.config.health;
            let endpoints = if urls.is_empty() {
                build_endpoints(health)?
            } else {
                urls.iter()
                    .map(|url| {
                        HttpHealthEndpoint::new(url.clone(), health.expected_status, health.timeout())
                            .map(|e| Arc::new(e) as Arc<dyn stateguard::monitor::HealthEndpoint>)
                    })
                    .collect::<stateguard::Result<Vec<_>>>()?
            };
            if endpoints.is_empty() {
                return Err(StateguardError::Configuration(
                    "no health endpoints: set health.urls or pass --url".to_string(),
                )
                .into());
            }

            let hook = build_hook(&health.rollback_command, app.runner.clone())?;
            let report = HealthMonitor::new(hook, app.notifier.clone(), health.success_floor)
                .monitor(
                    &endpoints,
                    Duration::from_secs(*duration),
                    Duration::from_secs(*interval),
                    *threshold,
                )
                .await;

            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "{} rounds, {}/{} checks ok ({:.1}%, floor {:.1}%)",
                    report.rounds,
                    report.successes,
                    report.checks,
                    report.success_rate * 100.0,
                    report.success_floor * 100.0
                );
                if let Some(trigger) = &report.rollback {
                    println!("rollback triggered: {}", trigger.reason);
                }
            }

            Ok(if report.rollback_triggered() {
                1
            } else if report.degraded {
                2
            } else {
                0
            })
        }
    }
}

/// Exit code when a command fails before producing a result.
fn startup_failure_code(command: &Command) -> u8 {
    match command {
        Command::Backup(BackupCommand::Run { .. }) => 3,
        _ => 2,
    }
}

#[derive(Serialize)]
struct BackupSummary<'a> {
    manifest: &'a stateguard::models::BackupManifest,
    integrity_failures: &'a [ArtifactKind],
    upload_failures: &'a [ArtifactKind],
    pruned_local: &'a [String],
    pruned_remote: &'a [String],
}

impl<'a> From<&'a stateguard::BackupOutcome> for BackupSummary<'a> {
    fn from(outcome: &'a stateguard::BackupOutcome) -> Self {
        Self {
            manifest: &outcome.manifest,
            integrity_failures: &outcome.integrity_failures,
            upload_failures: &outcome.upload_failures,
            pruned_local: &outcome.pruned_local,
            pruned_remote: &outcome.pruned_remote,
        }
    }
}

fn print_restore(json: bool, report: &RestoreReport) -> Result<()> {
    if json {
        return print_json(report);
    }
    println!("{} {} ({})", report.manifest_id, report.state, report.scope);
    if report.forced {
        println!("  forced past an integrity mismatch");
    }
    if !report.restored.is_empty() {
        let kinds: Vec<&str> = report.restored.iter().map(|k| k.as_str()).collect();
        println!("  restored: {}", kinds.join(", "));
    }
    if let Some(failure) = &report.failure {
        println!("  failed: {}", failure.message);
    }
    if let Some(id) = &report.restore_point_id {
        if report.rollback_available && report.failure.is_some() {
            println!("  rollback: stateguard restore rollback --to {id}");
        } else {
            println!("  restore point: {id}");
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
