//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! On a signal, new operations are refused and running ones are asked to
//! cancel. A backup that is already uploading or a restore that is already
//! draining keeps going, and shutdown waits for them up to a grace period.
//! The HTTP server keeps answering `/health` through that wait so peers do
//! not reclaim a lease that is still in use; [`trigger`](ShutdownCoordinator::trigger)
//! stops it afterwards.

use crate::api::operations::OperationTracker;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(200);

pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Resolves once [`trigger`](Self::trigger) is called.
    pub fn signalled(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.subscribe();
        async move {
            let _ = rx.recv().await;
        }
    }

    /// Wait for SIGTERM or SIGINT.
    pub async fn wait_for_signal(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            tokio::select! {
                res = signal::ctrl_c() => {
                    res?;
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
            }
        }
        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        Ok(())
    }

    pub fn trigger(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("No listener for shutdown signal: {}", e);
        }
    }

    /// Refuse new operations, cancel what can be cancelled and wait for the
    /// rest, up to `grace`. Returns whether everything finished in time.
    pub async fn drain(&self, operations: &OperationTracker, grace: Duration) -> bool {
        operations.close().await;
        let signalled = operations.cancel_all().await;
        if signalled > 0 {
            info!(operations = signalled, "Waiting for running operations");
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let running = operations.running().await;
            if running.is_empty() {
                info!("Graceful shutdown complete");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    running = ?running,
                    "Grace period expired with operations still running; their lease will expire"
                );
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
