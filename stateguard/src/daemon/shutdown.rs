//! SIGTERM and SIGINT handling.
//!
//! A signal does not kill a run: it cancels a token that the backup
//! orchestrator checks between artifacts, so the run ends with a manifest
//! marked cancelled that lists exactly the artifacts already written.

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::utils::errors::Result;

/// Shutdown coordinator
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled on the first signal
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel without a signal
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait for SIGTERM or SIGINT, then cancel the token.
    pub async fn wait_for_signal(&self) -> Result<()> {
        #[cfg(unix)]
        {
            let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            tokio::select! {
                result = signal::ctrl_c() => {
                    result?;
                    info!("Received SIGINT, stopping at the next step boundary");
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM, stopping at the next step boundary");
                }
                _ = self.token.cancelled() => return Ok(()),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = signal::ctrl_c() => {
                    result?;
                    info!("Received Ctrl+C, stopping at the next step boundary");
                }
                _ = self.token.cancelled() => return Ok(()),
            }
        }

        self.token.cancel();
        Ok(())
    }

    /// Listen for signals in the background for the rest of the process.
    pub fn spawn_listener(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.wait_for_signal().await {
                warn!("Could not install signal handlers: {}", e);
            }
        })
    }
}
