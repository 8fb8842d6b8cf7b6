//! Health monitoring after changes, and the rollback decision it drives.
//!
//! The monitor polls every endpoint once per round. A round fails if any
//! check fails; consecutive failed rounds are counted and reset by a fully
//! healthy round. Reaching the threshold fires the rollback hook exactly
//! once and ends monitoring immediately.

pub mod endpoint;
pub mod hook;

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::HealthConfig;
use crate::models::{HealthCheckResult, RollbackTrigger};
use crate::notify::{deliver, Event, Notifier};
use crate::utils::errors::Result;

pub use endpoint::{probe, HealthEndpoint, HttpHealthEndpoint};
pub use hook::{build_hook, CommandRollbackHook, LogRollbackHook, RollbackHook};

#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub rounds: u64,
    pub checks: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub success_floor: f64,
    /// Success rate fell below the floor, whether or not a rollback fired
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackTrigger>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_error: Option<String>,
    pub failures: Vec<HealthCheckResult>,
}

impl MonitorReport {
    pub fn rollback_triggered(&self) -> bool {
        self.rollback.is_some()
    }
}

pub struct HealthMonitor {
    hook: Arc<dyn RollbackHook>,
    notifier: Arc<dyn Notifier>,
    success_floor: f64,
}

impl HealthMonitor {
    pub fn new(hook: Arc<dyn RollbackHook>, notifier: Arc<dyn Notifier>, success_floor: f64) -> Self {
        Self {
            hook,
            notifier,
            success_floor,
        }
    }

    /// Poll for `duration` at a fixed `interval`. A `threshold` of zero
    /// never triggers a rollback.
    pub async fn monitor(
        &self,
        endpoints: &[Arc<dyn HealthEndpoint>],
        duration: Duration,
        interval: Duration,
        threshold: u32,
    ) -> MonitorReport {
        let interval = interval.max(Duration::from_millis(1));
        let total_rounds = ((duration.as_nanos() / interval.as_nanos()) as u64).max(1);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut report = MonitorReport {
            rounds: 0,
            checks: 0,
            successes: 0,
            success_rate: 1.0,
            success_floor: self.success_floor,
            degraded: false,
            rollback: None,
            hook_error: None,
            failures: Vec::new(),
        };
        let mut consecutive = 0u32;

        info!(
            endpoints = endpoints.len(),
            rounds = total_rounds,
            threshold,
            "Starting health monitoring"
        );

        for _ in 0..total_rounds {
            ticker.tick().await;
            report.rounds += 1;

            let mut round_ok = true;
            for endpoint in endpoints {
                let result = probe(endpoint.as_ref()).await;
                report.checks += 1;
                if result.success {
                    report.successes += 1;
                } else {
                    round_ok = false;
                    warn!(
                        endpoint = %result.endpoint,
                        status = ?result.status,
                        "Health check failed: {}",
                        result.error.as_deref().unwrap_or("unhealthy")
                    );
                    report.failures.push(result);
                }
            }

            if round_ok {
                consecutive = 0;
                continue;
            }
            consecutive += 1;

            if threshold > 0 && consecutive >= threshold {
                let trigger = RollbackTrigger {
                    reason: format!("{consecutive} consecutive failed health rounds"),
                    consecutive_failures: consecutive,
                    triggered_at: Utc::now(),
                };
                if let Err(e) = self.hook.trigger(&trigger).await {
                    warn!("Rollback hook failed: {}", e);
                    report.hook_error = Some(e.to_string());
                }
                deliver(self.notifier.as_ref(), &Event::RollbackTriggered(trigger.clone())).await;
                report.rollback = Some(trigger);
                break;
            }
        }

        if report.checks > 0 {
            report.success_rate = report.successes as f64 / report.checks as f64;
        }
        report.degraded = report.success_rate < self.success_floor;

        info!(
            rounds = report.rounds,
            success_rate = report.success_rate,
            degraded = report.degraded,
            rollback = report.rollback_triggered(),
            "Health monitoring finished"
        );
        report
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PostCheckOutcome {
    pub attempts: u32,
    pub healthy: bool,
    pub last_results: Vec<HealthCheckResult>,
}

/// Poll until every endpoint is healthy in the same attempt, at most
/// `attempts` times.
pub async fn wait_until_healthy(
    endpoints: &[Arc<dyn HealthEndpoint>],
    attempts: u32,
    interval: Duration,
) -> PostCheckOutcome {
    let mut last_results = Vec::new();
    for attempt in 1..=attempts.max(1) {
        if attempt > 1 {
            tokio::time::sleep(interval).await;
        }
        last_results.clear();
        for endpoint in endpoints {
            last_results.push(probe(endpoint.as_ref()).await);
        }
        if last_results.iter().all(|r| r.success) {
            info!(attempt, "Post-restore health check passed");
            return PostCheckOutcome {
                attempts: attempt,
                healthy: true,
                last_results,
            };
        }
        warn!(attempt, attempts, "Post-restore health check not yet passing");
    }
    PostCheckOutcome {
        attempts: attempts.max(1),
        healthy: false,
        last_results,
    }
}

/// HTTP endpoints for every configured health URL.
pub fn build_endpoints(config: &HealthConfig) -> Result<Vec<Arc<dyn HealthEndpoint>>> {
    config
        .urls
        .iter()
        .map(|url| {
            HttpHealthEndpoint::new(url.clone(), config.expected_status, config.timeout())
                .map(|e| Arc::new(e) as Arc<dyn HealthEndpoint>)
        })
        .collect()
}
