mod common;

use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;

use common::{Harness, MemorySource};
use stateguard::adapters::{AdapterSet, FilesAdapter, ProcessRunner};
use stateguard::config::FilesConfig;
use stateguard::executor::BackupRequest;
use stateguard::models::{ArtifactKind, RestoreRequest, RestoreScope, RunStatus};
use stateguard::remote::RemoteStore;
use stateguard::restore::{FailureClass, RestoreState};
use stateguard::utils::lock::{Operation, RunLock};
use stateguard::{Result, StateguardError};

#[tokio::test]
async fn verify_passes_after_backup_and_flags_only_the_corrupted_artifact() -> Result<()> {
    let h = Harness::new(false);
    let adapters = AdapterSet::new()
        .with(MemorySource::new(ArtifactKind::Database, "rows v1", &h.calls))
        .with(MemorySource::new(ArtifactKind::Cache, "keys v1", &h.calls));

    let outcome = h.backup(&adapters).run(BackupRequest::default()).await?;
    let id = outcome.manifest.id.clone();
    assert_eq!(outcome.status(), RunStatus::Success);
    assert!(h.manifests.verify(&id, RestoreScope::Full).await?.ok);

    let record = &outcome.manifest.artifacts[&ArtifactKind::Cache];
    let path = h.manifests.artifact_path(&id, record);
    let mut bytes = fs::read(&path)?;
    bytes[0] ^= 0x01;
    fs::write(&path, bytes)?;

    let report = h.manifests.verify(&id, RestoreScope::Full).await?;
    assert!(!report.ok);
    assert_eq!(report.mismatched_kinds(), vec![ArtifactKind::Cache]);
    Ok(())
}

#[tokio::test]
async fn integrity_failure_without_force_never_restores() -> Result<()> {
    let h = Harness::new(false);
    let db = MemorySource::new(ArtifactKind::Database, "rows v1", &h.calls);
    let adapters = AdapterSet::new().with(db.clone());

    let outcome = h.backup(&adapters).run(BackupRequest::default()).await?;
    let id = outcome.manifest.id.clone();
    let path = h
        .manifests
        .artifact_path(&id, &outcome.manifest.artifacts[&ArtifactKind::Database]);
    fs::write(&path, "tampered")?;
    db.set_live("rows v2");
    h.clear_calls();

    let report = h
        .restore(&adapters)
        .restore(RestoreRequest::new(&id, RestoreScope::Full))
        .await?;

    assert_eq!(report.state, RestoreState::Failed);
    assert_eq!(report.failure.as_ref().map(|f| f.class), Some(FailureClass::Integrity));
    let message = report.failure.as_ref().map(|f| f.message.clone()).unwrap_or_default();
    assert!(message.ends_with(&format!("{id}: database")), "{message}");
    assert_eq!(report.exit_code(), 1);
    assert!(h.calls().iter().all(|c| !c.starts_with("restore:")));
    assert_eq!(db.live(), "rows v2");
    // No restore point is taken before verification passes
    assert_eq!(h.manifests.list()?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn forced_restore_proceeds_over_mismatch() -> Result<()> {
    let h = Harness::new(false);
    let db = MemorySource::new(ArtifactKind::Database, "rows v1", &h.calls);
    let adapters = AdapterSet::new().with(db.clone());

    let outcome = h.backup(&adapters).run(BackupRequest::default()).await?;
    let id = outcome.manifest.id.clone();
    let path = h
        .manifests
        .artifact_path(&id, &outcome.manifest.artifacts[&ArtifactKind::Database]);
    fs::write(&path, "rows v1 (damaged)")?;

    let mut request = RestoreRequest::new(&id, RestoreScope::Full);
    request.force = true;
    let report = h.restore(&adapters).restore(request).await?;

    assert_eq!(report.state, RestoreState::Completed);
    assert!(report.forced);
    assert_eq!(db.live(), "rows v1 (damaged)");
    Ok(())
}

#[tokio::test]
async fn full_restore_follows_dependency_order() -> Result<()> {
    let h = Harness::new(false);
    let adapters = AdapterSet::new()
        .with(MemorySource::new(ArtifactKind::Cache, "c", &h.calls))
        .with(MemorySource::new(ArtifactKind::Database, "d", &h.calls))
        .with(MemorySource::new(ArtifactKind::Config, "k", &h.calls))
        .with(MemorySource::new(ArtifactKind::Files, "f", &h.calls));

    let id = h.backup(&adapters).run(BackupRequest::default()).await?.manifest.id;
    assert_eq!(
        h.calls(),
        vec!["snapshot:database", "snapshot:cache", "snapshot:files", "snapshot:config"]
    );
    h.clear_calls();

    let report = h
        .restore(&adapters)
        .restore(RestoreRequest::new(&id, RestoreScope::Full))
        .await?;
    assert_eq!(report.state, RestoreState::Completed);

    let restores: Vec<String> = h
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("restore:"))
        .collect();
    assert_eq!(
        restores,
        vec!["restore:config", "restore:files", "restore:database", "restore:cache"]
    );
    assert_eq!(
        report.transitions,
        vec![
            RestoreState::Requested,
            RestoreState::Verifying,
            RestoreState::RestorePointCreated,
            RestoreState::Restoring,
            RestoreState::PostCheck,
            RestoreState::Completed,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn rollback_returns_sources_to_pre_restore_content() -> Result<()> {
    let h = Harness::new(false);
    let db = MemorySource::new(ArtifactKind::Database, "rows v1", &h.calls);
    let cache = MemorySource::new(ArtifactKind::Cache, "keys v1", &h.calls);
    let adapters = AdapterSet::new().with(db.clone()).with(cache.clone());

    let id = h.backup(&adapters).run(BackupRequest::default()).await?.manifest.id;
    db.set_live("rows v2");
    cache.set_live("keys v2");

    let restore = h.restore(&adapters);
    let report = restore.restore(RestoreRequest::new(&id, RestoreScope::Full)).await?;
    assert_eq!(report.state, RestoreState::Completed);
    assert_eq!((db.live(), cache.live()), ("rows v1".to_string(), "keys v1".to_string()));

    let restore_point = report.restore_point_id.clone().expect("restore point taken");
    let point = h.manifests.load(&restore_point)?;
    assert!(point.is_restore_point);
    assert_eq!(point.restore_point_for.as_deref(), Some(id.as_str()));

    let rollback = restore.rollback(Some(&restore_point), false).await?;
    assert_eq!(rollback.state, RestoreState::RolledBack);
    assert!(rollback.is_rollback);
    assert!(rollback.restore_point_id.is_none());
    assert_eq!((db.live(), cache.live()), ("rows v2".to_string(), "keys v2".to_string()));

    // Without --to the recorded restore point is used
    db.set_live("rows v3");
    let again = restore.rollback(None, false).await?;
    assert_eq!(again.manifest_id, restore_point);
    assert_eq!(db.live(), "rows v2");
    Ok(())
}

#[tokio::test]
async fn scoped_restore_only_touches_that_kind() -> Result<()> {
    let h = Harness::new(false);
    let db = MemorySource::new(ArtifactKind::Database, "rows v1", &h.calls);
    let cache = MemorySource::new(ArtifactKind::Cache, "keys v1", &h.calls);
    let adapters = AdapterSet::new().with(db.clone()).with(cache.clone());

    let id = h.backup(&adapters).run(BackupRequest::default()).await?.manifest.id;
    db.set_live("rows v2");
    cache.set_live("keys v2");

    let report = h
        .restore(&adapters)
        .restore(RestoreRequest::new(&id, RestoreScope::Only(ArtifactKind::Database)))
        .await?;

    assert_eq!(report.restored, vec![ArtifactKind::Database]);
    assert_eq!(db.live(), "rows v1");
    assert_eq!(cache.live(), "keys v2");

    let point = h.manifests.load(report.restore_point_id.as_deref().unwrap())?;
    assert_eq!(point.artifacts.keys().copied().collect::<Vec<_>>(), vec![ArtifactKind::Database]);
    Ok(())
}

#[tokio::test]
async fn missing_manifest_is_fatal() {
    let h = Harness::new(false);
    let adapters = AdapterSet::new().with(MemorySource::new(ArtifactKind::Database, "d", &h.calls));

    let mut request = RestoreRequest::new("20260101T000000000Z", RestoreScope::Full);
    request.force = true;
    assert!(matches!(
        h.restore(&adapters).restore(request).await,
        Err(StateguardError::ManifestNotFound(_))
    ));
}

#[tokio::test]
async fn concurrent_backup_fails_fast_without_a_manifest() -> Result<()> {
    let h = Harness::new(false);
    let adapters = AdapterSet::new().with(MemorySource::new(ArtifactKind::Database, "d", &h.calls));

    let held = RunLock::acquire(&h.config.paths.state_dir, Operation::Backup)?;
    let result = h.backup(&adapters).run(BackupRequest::default()).await;
    assert!(matches!(result, Err(StateguardError::Concurrency(_))));
    assert!(h.calls().is_empty());
    assert!(h.manifests.list()?.is_empty());

    drop(held);
    assert_eq!(
        h.backup(&adapters).run(BackupRequest::default()).await?.status(),
        RunStatus::Success
    );
    Ok(())
}

#[tokio::test]
async fn retention_keeps_the_newest_runs_locally_and_remotely() -> Result<()> {
    let h = Harness::new(true);
    let mut config = (*h.config).clone();
    config.retention.days = 0;
    config.retention.preserve_newest = 2;
    let h = Harness {
        config: Arc::new(config),
        ..h
    };
    let adapters = AdapterSet::new().with(MemorySource::new(ArtifactKind::Database, "d", &h.calls));

    let backup = h.backup(&adapters);
    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(backup.run(BackupRequest::default()).await?.manifest.id);
    }

    let kept: Vec<String> = h.manifests.list()?.into_iter().map(|m| m.id).collect();
    assert_eq!(kept.len(), 2);
    assert!(kept.contains(&ids[3]));
    assert!(kept.contains(&ids[2]));

    let remote = h.remote.as_ref().unwrap();
    let runs: BTreeSet<String> = remote
        .list(&h.config.remote.prefix)
        .await?
        .into_iter()
        .filter_map(|o| o.key.split('/').rev().nth(1).map(str::to_string))
        .collect();
    assert_eq!(runs.len(), 2);
    Ok(())
}

#[tokio::test]
async fn database_and_files_without_remote_stay_local() -> Result<()> {
    let h = Harness::new(false);
    let volume = h.temp.path().join("volume");
    fs::create_dir_all(volume.join("uploads"))?;
    fs::write(volume.join("uploads/avatar.png"), b"png bytes")?;
    fs::write(volume.join("index.html"), b"<html/>")?;

    let files = FilesAdapter::new(
        FilesConfig {
            enabled: true,
            volume_path: Some(volume.clone()),
            ..FilesConfig::default()
        },
        h.temp.path().join("scratch"),
        Arc::new(ProcessRunner),
    );
    let adapters = AdapterSet::new()
        .with(MemorySource::new(ArtifactKind::Database, "rows", &h.calls))
        .with(Arc::new(files));

    let outcome = h.backup(&adapters).run(BackupRequest::default()).await?;
    assert_eq!(outcome.status(), RunStatus::Success);
    assert_eq!(outcome.manifest.artifacts.len(), 2);
    assert!(outcome.manifest.artifacts.values().all(|r| !r.uploaded));

    // Damage the volume, then restore just the files scope
    fs::remove_file(volume.join("index.html"))?;
    fs::write(volume.join("stray.tmp"), b"x")?;
    let report = h
        .restore(&adapters)
        .restore(RestoreRequest::new(&outcome.manifest.id, RestoreScope::Only(ArtifactKind::Files)))
        .await?;

    assert_eq!(report.state, RestoreState::Completed);
    assert_eq!(fs::read(volume.join("index.html"))?, b"<html/>");
    assert_eq!(fs::read(volume.join("uploads/avatar.png"))?, b"png bytes");
    assert!(!volume.join("stray.tmp").exists());
    Ok(())
}

#[tokio::test]
async fn restore_from_remote_after_local_loss() -> Result<()> {
    let h = Harness::new(true);
    let db = MemorySource::new(ArtifactKind::Database, "rows v1", &h.calls);
    let adapters = AdapterSet::new().with(db.clone());

    let outcome = h.backup(&adapters).run(BackupRequest::default()).await?;
    assert!(outcome.manifest.artifacts.values().all(|r| r.uploaded));
    let id = outcome.manifest.id;
    fs::remove_dir_all(h.manifests.run_dir(&id))?;
    db.set_live("rows v2");

    let mut request = RestoreRequest::new(&id, RestoreScope::Full);
    request.from_remote = true;
    let report = h.restore(&adapters).restore(request).await?;

    assert_eq!(report.state, RestoreState::Completed);
    assert_eq!(db.live(), "rows v1");
    assert!(h.manifests.run_dir(&id).join("manifest.json").exists());
    Ok(())
}

#[tokio::test]
async fn critical_failure_still_persists_evidence() -> Result<()> {
    let h = Harness::new(false);
    let adapters = AdapterSet::new()
        .with(MemorySource::failing(ArtifactKind::Database, &h.calls))
        .with(MemorySource::new(ArtifactKind::Config, "k", &h.calls));

    let outcome = h.backup(&adapters).run(BackupRequest::default()).await?;
    assert_eq!(outcome.status(), RunStatus::Failed);
    assert_eq!(h.calls(), vec!["snapshot:database"]);

    let stored = h.manifests.load(&outcome.manifest.id)?;
    assert_eq!(stored.status, RunStatus::Failed);
    assert!(stored.failures[&ArtifactKind::Database].contains("dump tool exited 1"));
    Ok(())
}
