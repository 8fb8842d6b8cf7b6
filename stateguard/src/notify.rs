//! Run notifications.
//!
//! Delivery is best effort: a failed notification is logged and never
//! changes the outcome of the run that produced it.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NotifierConfig;
use crate::models::{ArtifactKind, RestoreScope, RollbackTrigger, RunStatus};
use crate::restore::RestoreState;
use crate::utils::errors::Result;

/// Events sent to the notifier endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    #[serde(rename = "backup:completed")]
    BackupCompleted {
        manifest_id: String,
        hostname: String,
        status: RunStatus,
        is_restore_point: bool,
        artifacts: Vec<ArtifactOutcome>,
        duration_ms: u64,
    },

    #[serde(rename = "restore:finished")]
    RestoreFinished {
        manifest_id: String,
        scope: RestoreScope,
        state: RestoreState,
        #[serde(skip_serializing_if = "Option::is_none")]
        restore_point_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "rollback:triggered")]
    RollbackTriggered(RollbackTrigger),
}

/// Per-artifact result reported in `backup:completed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactOutcome {
    pub kind: ArtifactKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub uploaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::BackupCompleted { .. } => "backup:completed",
            Event::RestoreFinished { .. } => "restore:finished",
            Event::RollbackTriggered(_) => "rollback:triggered",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &Event) -> Result<()>;
}

/// Send an event, logging instead of failing.
pub async fn deliver(notifier: &dyn Notifier, event: &Event) {
    if let Err(e) = notifier.notify(event).await {
        warn!(event = event.name(), "Notification failed: {}", e);
    }
}

pub fn build_notifier(config: &NotifierConfig) -> Result<Arc<dyn Notifier>> {
    match &config.webhook_url {
        Some(url) => Ok(Arc::new(WebhookNotifier::new(
            url.clone(),
            Duration::from_secs(config.timeout_secs),
        )?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}

/// Writes events to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &Event) -> Result<()> {
        info!(event = event.name(), payload = %serde_json::to_string(event)?, "Notification");
        Ok(())
    }
}

/// POSTs each event as JSON. Every delivery carries a fresh id in
/// `X-Stateguard-Delivery` so receivers can drop duplicates.
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &Event) -> Result<()> {
        let delivery = Uuid::new_v4();
        debug!(event = event.name(), %delivery, "Posting notification");
        self.client
            .post(&self.url)
            .header("X-Stateguard-Delivery", delivery.to_string())
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_event_wire_format() {
        let event = Event::BackupCompleted {
            manifest_id: "20261019T031500123Z".to_string(),
            hostname: "app-01".to_string(),
            status: RunStatus::Partial,
            is_restore_point: false,
            artifacts: vec![ArtifactOutcome {
                kind: ArtifactKind::Cache,
                size_bytes: None,
                uploaded: false,
                error: Some("BGSAVE timed out".to_string()),
            }],
            duration_ms: 1200,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "backup:completed");
        assert_eq!(json["payload"]["status"], "partial");
        assert_eq!(json["payload"]["artifacts"][0]["kind"], "cache");
        assert!(json["payload"]["artifacts"][0].get("size_bytes").is_none());
    }

    #[test]
    fn test_rollback_event_name() {
        let event = Event::RollbackTriggered(RollbackTrigger {
            reason: "3 consecutive failed rounds".to_string(),
            consecutive_failures: 3,
            triggered_at: Utc::now(),
        });
        assert_eq!(event.name(), "rollback:triggered");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["consecutive_failures"], 3);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_not_fatal() {
        let notifier = WebhookNotifier::new(
            "http://127.0.0.1:9/hook".to_string(),
            Duration::from_secs(1),
        )
        .unwrap();
        let event = Event::RollbackTriggered(RollbackTrigger {
            reason: "test".to_string(),
            consecutive_failures: 1,
            triggered_at: Utc::now(),
        });
        assert!(notifier.notify(&event).await.is_err());
        deliver(&notifier, &event).await;
    }
}
