use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stateguard::models::RollbackTrigger;
use stateguard::monitor::{HealthEndpoint, HealthMonitor, RollbackHook};
use stateguard::notify::{Event, Notifier};
use stateguard::{Result, StateguardError};

/// Replays a fixed script of outcomes: `true` healthy, `false` refused.
struct Scripted {
    script: Vec<bool>,
    calls: AtomicU32,
}

impl Scripted {
    fn new(script: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            script: script.to_vec(),
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl HealthEndpoint for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn check(&self) -> Result<(u16, Duration)> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        match self.script.get(n).copied().unwrap_or(true) {
            true => Ok((200, Duration::from_millis(2))),
            false => Err(StateguardError::HealthCheck("connection refused".to_string())),
        }
    }
}

#[derive(Default)]
struct RecordingHook {
    triggers: Mutex<Vec<RollbackTrigger>>,
}

#[async_trait]
impl RollbackHook for RecordingHook {
    async fn trigger(&self, trigger: &RollbackTrigger) -> Result<()> {
        self.triggers.lock().unwrap().push(trigger.clone());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &Event) -> Result<()> {
        self.events.lock().unwrap().push(event.name());
        Ok(())
    }
}

fn endpoints(endpoint: &Arc<Scripted>) -> Vec<Arc<dyn HealthEndpoint>> {
    vec![endpoint.clone() as Arc<dyn HealthEndpoint>]
}

#[tokio::test]
async fn threshold_fires_exactly_once_after_the_third_failure() {
    let endpoint = Scripted::new(&[true, false, false, false, false, false]);
    let hook = Arc::new(RecordingHook::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let monitor = HealthMonitor::new(hook.clone(), notifier.clone(), 0.95);

    let report = monitor
        .monitor(&endpoints(&endpoint), Duration::from_millis(20), Duration::from_millis(1), 3)
        .await;

    let triggers = hook.triggers.lock().unwrap();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].consecutive_failures, 3);
    // One healthy round, then three failing ones; nothing polled after that
    assert_eq!(endpoint.calls.load(Ordering::SeqCst), 4);
    assert_eq!(report.rounds, 4);
    assert!(report.rollback_triggered());
    assert_eq!(*notifier.events.lock().unwrap(), vec!["rollback:triggered"]);
}

#[tokio::test]
async fn interleaved_failures_never_reach_threshold() {
    let endpoint = Scripted::new(&[false, false, true, false, false, true, false, false, true, true]);
    let hook = Arc::new(RecordingHook::default());
    let monitor = HealthMonitor::new(hook.clone(), Arc::new(RecordingNotifier::default()), 0.95);

    let report = monitor
        .monitor(&endpoints(&endpoint), Duration::from_millis(10), Duration::from_millis(1), 3)
        .await;

    assert!(hook.triggers.lock().unwrap().is_empty());
    assert!(!report.rollback_triggered());
    assert_eq!(report.checks, 10);
    assert!(report.degraded);
    assert_eq!(report.failures.len(), 6);
}

#[tokio::test]
async fn zero_threshold_only_reports() {
    let endpoint = Scripted::new(&[false; 5]);
    let hook = Arc::new(RecordingHook::default());
    let monitor = HealthMonitor::new(hook.clone(), Arc::new(RecordingNotifier::default()), 0.5);

    let report = monitor
        .monitor(&endpoints(&endpoint), Duration::from_millis(5), Duration::from_millis(1), 0)
        .await;

    assert!(hook.triggers.lock().unwrap().is_empty());
    assert_eq!(report.success_rate, 0.0);
    assert!(report.degraded);
}
