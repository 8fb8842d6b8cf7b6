//! Health endpoints polled by the monitor and the post-restore check.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use std::time::{Duration, Instant};

use crate::models::HealthCheckResult;
use crate::utils::errors::{Result, StateguardError};

#[async_trait]
pub trait HealthEndpoint: Send + Sync {
    fn name(&self) -> &str;

    fn expected_status(&self) -> u16 {
        200
    }

    /// Returns the observed status and latency. A timeout or connection
    /// failure is an error.
    async fn check(&self) -> Result<(u16, Duration)>;
}

/// Run one check and fold its outcome into a result record.
pub async fn probe(endpoint: &dyn HealthEndpoint) -> HealthCheckResult {
    let started = Instant::now();
    let outcome = endpoint.check().await;
    let timestamp = Utc::now();

    match outcome {
        Ok((status, latency)) => {
            let success = status == endpoint.expected_status();
            HealthCheckResult {
                timestamp,
                endpoint: endpoint.name().to_string(),
                status: Some(status),
                latency_ms: latency.as_millis() as u64,
                success,
                error: (!success).then(|| {
                    format!("expected {}, got {}", endpoint.expected_status(), status)
                }),
            }
        }
        Err(e) => HealthCheckResult {
            timestamp,
            endpoint: endpoint.name().to_string(),
            status: None,
            latency_ms: started.elapsed().as_millis() as u64,
            success: false,
            error: Some(e.to_string()),
        },
    }
}

pub struct HttpHealthEndpoint {
    url: String,
    expected: u16,
    client: Client,
}

impl HttpHealthEndpoint {
    pub fn new(url: impl Into<String>, expected: u16, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            expected,
            client,
        })
    }
}

#[async_trait]
impl HealthEndpoint for HttpHealthEndpoint {
    fn name(&self) -> &str {
        &self.url
    }

    fn expected_status(&self) -> u16 {
        self.expected
    }

    async fn check(&self) -> Result<(u16, Duration)> {
        let started = Instant::now();
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                StateguardError::HealthCheck(format!("{} timed out", self.url))
            } else {
                StateguardError::Http(e)
            }
        })?;
        Ok((response.status().as_u16(), started.elapsed()))
    }
}
