//! Health check results and rollback triggers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    /// HTTP status, or `None` when the request timed out or never connected.
    pub status: Option<u16>,
    pub latency_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackTrigger {
    pub reason: String,
    pub consecutive_failures: u32,
    pub triggered_at: DateTime<Utc>,
}
