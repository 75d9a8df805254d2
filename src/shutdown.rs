//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM/SIGINT, tells the accept loop to stop, then gives
//! in-flight sessions a bounded amount of time to finish on their own.

use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::Result;

/// Interval between active-session checks while draining
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// How long to wait for sessions to drain
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcast the shutdown signal
    pub fn trigger(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            debug!("No shutdown listeners left: {}", e);
        }
    }

    /// Wait for a shutdown signal (SIGTERM, SIGINT, Ctrl-C)
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
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

    /// Wait up to the shutdown timeout for in-flight sessions to finish.
    ///
    /// Returns `true` if every session finished in time.
    pub async fn drain(&self, connection_manager: &ConnectionManager) -> bool {
        let start_time = Instant::now();

        let mut last_count = connection_manager.active_sessions();
        info!(
            "Waiting for {} active sessions to close (timeout: {:?})",
            last_count, self.timeout
        );

        while last_count > 0 && start_time.elapsed() < self.timeout {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;

            let current_count = connection_manager.active_sessions();
            if current_count != last_count {
                debug!("Active sessions: {} -> {}", last_count, current_count);
                last_count = current_count;
            }
        }

        let elapsed = start_time.elapsed();
        if last_count == 0 {
            info!("All sessions closed gracefully in {:?}", elapsed);
            true
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} sessions still active",
                elapsed, last_count
            );
            false
        }
    }
}
