//! Restore orchestrator.
//!
//! A restore walks a fixed state machine:
//!
//! ```text
//! Requested -> Verifying -> RestorePointCreated -> Restoring -> PostCheck -> Completed
//!                  |                                  |             |
//!                  +---------> Failed <---------------+-------------+
//! ```
//!
//! Nothing is mutated before the manifest verifies (or the operator forces
//! past a mismatch) and a restore point protects the current state. A
//! failed scope stops the machine with every affected service left stopped.
//! Rollback re-enters the same machine from a restore point's manifest and
//! ends in `RolledBack`; it never takes a restore point of its own.

pub mod pointer;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::adapters::service::NoopController;
use crate::adapters::{AdapterSet, DataSourceAdapter, ServiceController};
use crate::config::RunConfig;
use crate::executor::{BackupOrchestrator, BackupRequest};
use crate::manifest::{ManifestService, VerifyReport};
use crate::models::{
    ArtifactKind, BackupManifest, RestoreRequest, RestoreScope, RunStatus, StoredArtifact,
};
use crate::monitor::{wait_until_healthy, HealthEndpoint, PostCheckOutcome};
use crate::notify::{deliver, Event, Notifier};
use crate::utils::errors::{Result, StateguardError};
use crate::utils::lock::{Operation, RunLock};
pub use pointer::RestorePointer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreState {
    Requested,
    Verifying,
    RestorePointCreated,
    Restoring,
    PostCheck,
    Completed,
    RolledBack,
    Failed,
}

impl RestoreState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreState::Requested => "requested",
            RestoreState::Verifying => "verifying",
            RestoreState::RestorePointCreated => "restore_point_created",
            RestoreState::Restoring => "restoring",
            RestoreState::PostCheck => "post_check",
            RestoreState::Completed => "completed",
            RestoreState::RolledBack => "rolled_back",
            RestoreState::Failed => "failed",
        }
    }
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which gate a failed restore stopped at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Integrity,
    Step,
    PostCheck,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreFailure {
    pub class: FailureClass,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub manifest_id: String,
    pub scope: RestoreScope,
    pub state: RestoreState,
    pub transitions: Vec<RestoreState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifyReport>,
    /// Proceeded over a failed integrity check
    pub forced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_point_id: Option<String>,
    pub restored: Vec<ArtifactKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RestoreFailure>,
    pub rollback_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_check: Option<PostCheckOutcome>,
    pub is_rollback: bool,
}

impl RestoreReport {
    fn new(request: &RestoreRequest, is_rollback: bool) -> Self {
        Self {
            manifest_id: request.manifest_id.clone(),
            scope: request.scope,
            state: RestoreState::Requested,
            transitions: vec![RestoreState::Requested],
            verify: None,
            forced: false,
            restore_point_id: None,
            restored: Vec::new(),
            failure: None,
            rollback_available: false,
            post_check: None,
            is_rollback,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.state, RestoreState::Completed | RestoreState::RolledBack)
    }

    /// 0 success, 1 integrity, 2 restore step, 3 post-restore health
    pub fn exit_code(&self) -> i32 {
        match self.failure.as_ref().map(|f| f.class) {
            None => 0,
            Some(FailureClass::Integrity) => 1,
            Some(FailureClass::Step) => 2,
            Some(FailureClass::PostCheck) => 3,
        }
    }

    fn enter(&mut self, state: RestoreState) {
        info!(
            manifest_id = %self.manifest_id,
            from = %self.state,
            state = %state,
            "Restore state transition"
        );
        self.state = state;
        self.transitions.push(state);
    }

    fn fail(&mut self, class: FailureClass, message: String) {
        error!(manifest_id = %self.manifest_id, class = ?class, "Restore failed: {}", message);
        self.failure = Some(RestoreFailure { class, message });
        self.enter(RestoreState::Failed);
    }
}

pub struct RestoreOrchestrator {
    config: Arc<RunConfig>,
    adapters: AdapterSet,
    manifests: Arc<ManifestService>,
    backup: Arc<BackupOrchestrator>,
    controller: Arc<dyn ServiceController>,
    endpoints: Vec<Arc<dyn HealthEndpoint>>,
    notifier: Arc<dyn Notifier>,
}

impl RestoreOrchestrator {
    pub fn new(
        config: Arc<RunConfig>,
        adapters: AdapterSet,
        backup: Arc<BackupOrchestrator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            adapters,
            manifests: Arc::clone(backup.manifests()),
            backup,
            controller: Arc::new(NoopController),
            endpoints: Vec::new(),
            notifier,
        }
    }

    pub fn with_controller(mut self, controller: Arc<dyn ServiceController>) -> Self {
        self.controller = controller;
        self
    }

    /// Endpoints polled after the restore; none skips the post-check.
    pub fn with_endpoints(mut self, endpoints: Vec<Arc<dyn HealthEndpoint>>) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Run a restore request to a terminal state.
    ///
    /// Errors are returned only when the machine never started: lock held,
    /// manifest missing, or an in-scope kind has no configured adapter.
    /// Integrity, step and post-check failures are reported in the
    /// [`RestoreReport`].
    pub async fn restore(&self, request: RestoreRequest) -> Result<RestoreReport> {
        let _lock = RunLock::acquire(&self.config.paths.state_dir, Operation::Restore)?;

        if request.from_remote {
            self.fetch_from_remote(&request.manifest_id).await?;
        }
        let manifest = self.manifests.resolve(&request.manifest_id).await?;
        if !matches!(manifest.status, RunStatus::Success) {
            warn!(
                manifest_id = %manifest.id,
                status = %manifest.status,
                "Restoring from a run that did not fully succeed"
            );
        }

        self.execute(request, &manifest, false).await
    }

    /// Restore a restore point over the current state.
    ///
    /// With no id, the most recently recorded restore point is used.
    pub async fn rollback(&self, to: Option<&str>, force: bool) -> Result<RestoreReport> {
        let _lock = RunLock::acquire(&self.config.paths.state_dir, Operation::Restore)?;

        let id = match to {
            Some(id) => id.to_string(),
            None => RestorePointer::load(&self.config.paths.state_dir)?.restore_point_id,
        };
        let manifest = self.manifests.resolve(&id).await?;
        if !manifest.is_restore_point {
            return Err(StateguardError::RestoreState(format!(
                "{id} is not a restore point"
            )));
        }
        info!(
            manifest_id = %id,
            protects = manifest.restore_point_for.as_deref().unwrap_or("-"),
            "Rolling back to restore point"
        );

        let mut request = RestoreRequest::new(id, RestoreScope::Full);
        request.force = force;
        self.execute(request, &manifest, true).await
    }

    async fn execute(
        &self,
        request: RestoreRequest,
        manifest: &BackupManifest,
        is_rollback: bool,
    ) -> Result<RestoreReport> {
        let kinds = self.plan(&request, manifest)?;
        let mut report = RestoreReport::new(&request, is_rollback);

        self.drive(&request, manifest, &kinds, &mut report).await;
        report.rollback_available = report.restore_point_id.is_some();

        if let Some(failure) = &report.failure {
            if report.rollback_available && failure.class != FailureClass::Integrity {
                warn!(
                    manifest_id = %report.manifest_id,
                    restore_point = report.restore_point_id.as_deref().unwrap_or("-"),
                    "Rollback is available: stateguard restore rollback --to <restore point>"
                );
            }
        }

        deliver(
            self.notifier.as_ref(),
            &Event::RestoreFinished {
                manifest_id: report.manifest_id.clone(),
                scope: report.scope,
                state: report.state,
                restore_point_id: report.restore_point_id.clone(),
                error: report.failure.as_ref().map(|f| f.message.clone()),
            },
        )
        .await;

        Ok(report)
    }

    /// Kinds this request will mutate, in restore order. Only kinds the
    /// manifest actually holds are restored.
    fn plan(&self, request: &RestoreRequest, manifest: &BackupManifest) -> Result<Vec<ArtifactKind>> {
        let kinds: Vec<ArtifactKind> = request
            .scope
            .restore_order()
            .into_iter()
            .filter(|kind| manifest.artifact(*kind).is_some())
            .collect();
        if !request.verify_only {
            for kind in &kinds {
                self.adapters.require(*kind)?;
            }
        }
        Ok(kinds)
    }

    async fn drive(
        &self,
        request: &RestoreRequest,
        manifest: &BackupManifest,
        kinds: &[ArtifactKind],
        report: &mut RestoreReport,
    ) {
        report.enter(RestoreState::Verifying);
        let verify = match self.manifests.verify(&manifest.id, request.scope).await {
            Ok(verify) => verify,
            Err(e) => {
                report.fail(FailureClass::Integrity, format!("verification did not complete: {e}"));
                return;
            }
        };
        let verified = verify.ok;
        let mismatched = verify.mismatched_kinds();
        report.verify = Some(verify);

        if !verified {
            if !request.force {
                let err = StateguardError::Integrity {
                    manifest_id: manifest.id.clone(),
                    mismatches: mismatched,
                };
                report.fail(FailureClass::Integrity, err.to_string());
                return;
            }
            warn!(
                manifest_id = %manifest.id,
                mismatches = %join_kinds(&mismatched),
                "Integrity check failed, continuing because the restore is forced"
            );
            report.forced = true;
        }

        if request.verify_only {
            report.enter(RestoreState::Completed);
            return;
        }
        if kinds.is_empty() {
            report.fail(
                FailureClass::Step,
                format!("manifest {} records nothing in scope {}", manifest.id, request.scope),
            );
            return;
        }

        if report.is_rollback {
            info!(manifest_id = %manifest.id, "Rollback does not take a restore point");
        } else if !self.config.restore.create_restore_point {
            warn!(manifest_id = %manifest.id, "Restore point disabled by configuration");
        } else if !self.take_restore_point(manifest, kinds, request.force, report).await {
            return;
        }

        report.enter(RestoreState::Restoring);
        if !self.restore_scopes(manifest, kinds, report).await {
            return;
        }

        report.enter(RestoreState::PostCheck);
        if self.endpoints.is_empty() {
            warn!(manifest_id = %manifest.id, "No health endpoints configured, skipping post-restore check");
        } else {
            let outcome = wait_until_healthy(
                &self.endpoints,
                self.config.health.post_restore_attempts,
                self.config.health.post_restore_interval(),
            )
            .await;
            let healthy = outcome.healthy;
            let attempts = outcome.attempts;
            report.post_check = Some(outcome);
            if !healthy {
                report.fail(
                    FailureClass::PostCheck,
                    format!("services unhealthy after {attempts} post-restore checks"),
                );
                return;
            }
        }

        report.enter(if report.is_rollback {
            RestoreState::RolledBack
        } else {
            RestoreState::Completed
        });
    }

    /// Snapshot what is about to be overwritten. Returns false when the
    /// machine has failed.
    async fn take_restore_point(
        &self,
        manifest: &BackupManifest,
        kinds: &[ArtifactKind],
        force: bool,
        report: &mut RestoreReport,
    ) -> bool {
        let outcome = self
            .backup
            .run(BackupRequest::restore_point(&manifest.id, kinds.to_vec()))
            .await;

        let problem = match outcome {
            Ok(outcome) if outcome.status() == RunStatus::Success => {
                let pointer = RestorePointer {
                    restore_point_id: outcome.manifest.id.clone(),
                    restore_point_for: manifest.id.clone(),
                    created_at: Utc::now(),
                };
                if let Err(e) = pointer.save(&self.config.paths.state_dir) {
                    warn!("Could not record the restore point pointer: {}", e);
                }
                info!(
                    manifest_id = %manifest.id,
                    restore_point = %outcome.manifest.id,
                    "Restore point created"
                );
                report.restore_point_id = Some(outcome.manifest.id);
                report.enter(RestoreState::RestorePointCreated);
                return true;
            }
            Ok(outcome) => format!(
                "restore point {} finished {}",
                outcome.manifest.id,
                outcome.status()
            ),
            Err(e) => format!("restore point could not be taken: {e}"),
        };

        if force {
            warn!(manifest_id = %manifest.id, "{}, continuing because the restore is forced", problem);
            true
        } else {
            report.fail(FailureClass::Step, problem);
            false
        }
    }

    /// Stop every dependent service, restore each kind in order, then start
    /// the services again. Returns false when the machine has failed; the
    /// services stay stopped in that case.
    async fn restore_scopes(
        &self,
        manifest: &BackupManifest,
        kinds: &[ArtifactKind],
        report: &mut RestoreReport,
    ) -> bool {
        let mut adapters = Vec::with_capacity(kinds.len());
        for kind in kinds {
            match self.adapters.require(*kind) {
                Ok(adapter) => adapters.push(Arc::clone(adapter)),
                Err(e) => {
                    report.fail(FailureClass::Step, e.to_string());
                    return false;
                }
            }
        }

        let mut services: Vec<String> = Vec::new();
        for adapter in &adapters {
            if let Some(service) = adapter.service() {
                if !services.iter().any(|s| s == service) {
                    services.push(service.to_string());
                }
            }
        }

        for service in &services {
            if let Err(e) = self.controller.stop(service).await {
                report.fail(FailureClass::Step, format!("could not stop {service}: {e}"));
                return false;
            }
        }

        for adapter in &adapters {
            let kind = adapter.kind();
            let result = match manifest.artifact(kind) {
                Some(record) => match self.manifests.stored_artifact(&manifest.id, record).await {
                    Ok(stored) => restore_bounded(adapter.as_ref(), &stored).await,
                    Err(e) => Err(e),
                },
                None => Err(StateguardError::ManifestNotFound(format!(
                    "{kind} artifact of {}",
                    manifest.id
                ))),
            };

            match result {
                Ok(()) => {
                    info!(manifest_id = %manifest.id, kind = %kind, "Scope restored");
                    report.restored.push(kind);
                }
                Err(e) => {
                    if !services.is_empty() {
                        warn!(services = ?services, "Leaving services stopped after failed restore");
                    }
                    report.fail(FailureClass::Step, format!("{kind} restore failed: {e}"));
                    return false;
                }
            }
        }

        for service in &services {
            if let Err(e) = self.controller.start(service).await {
                report.fail(FailureClass::Step, format!("could not start {service}: {e}"));
                return false;
            }
        }
        true
    }

    /// Download the manifest and its artifacts. Artifacts that fail to
    /// download surface later as verification mismatches.
    async fn fetch_from_remote(&self, id: &str) -> Result<()> {
        match self.manifests.fetch_remote(id).await {
            Ok(manifest) => {
                info!(manifest_id = %manifest.id, artifacts = manifest.artifacts.len(), "Fetched run from remote");
                Ok(())
            }
            Err(e) if e.is_configuration() => Err(e),
            Err(e) => {
                warn!(manifest_id = %id, "Remote fetch incomplete: {}", e);
                Ok(())
            }
        }
    }
}

async fn restore_bounded(adapter: &dyn DataSourceAdapter, artifact: &StoredArtifact) -> Result<()> {
    let limit = adapter.timeout();
    match tokio::time::timeout(limit, adapter.restore(artifact)).await {
        Ok(result) => result,
        Err(_) => Err(StateguardError::Timeout {
            operation: format!("{} restore", adapter.kind()),
            after: limit,
        }),
    }
}

fn join_kinds(kinds: &[ArtifactKind]) -> String {
    kinds
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
