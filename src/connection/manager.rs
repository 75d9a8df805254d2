//! Connection Manager Implementation

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::{KeepAlivePolicy, RelayListener};
use crate::config::{RelayConfig, RelayMode};
use crate::metrics::Metrics;
use crate::protocol::ForwardTarget;
use crate::relay::{Dialer, LineScanner, RelayEngine};
use crate::resource::BufferPool;
use crate::tls::TlsContext;
use crate::Result;

/// Runs the accept loop and spawns one task per session
pub struct ConnectionManager {
    listener: Mutex<Option<RelayListener>>,
    local_addr: SocketAddr,
    engine: Arc<RelayEngine>,
    metrics: Arc<Metrics>,
    active_sessions: Arc<AtomicUsize>,
}

impl ConnectionManager {
    /// Create a manager around an already configured listener and engine
    pub fn new(listener: RelayListener, engine: RelayEngine, metrics: Arc<Metrics>) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            engine: Arc::new(engine),
            metrics,
            active_sessions: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Wire up listener, dialer, and engine for the configured mode.
    ///
    /// `listener` is bound by the caller; the TLS context must match the mode.
    pub fn from_config(
        listener: TcpListener,
        config: &RelayConfig,
        tls: TlsContext,
        pool: Arc<BufferPool>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let idle_metrics = Arc::clone(&metrics);
        let policy = KeepAlivePolicy::new(config.keepalive_period, config.idle_timeout)
            .with_idle_callback(Arc::new(move || idle_metrics.idle_expired()));

        let target = ForwardTarget::parse(&config.forward_addr);

        let (listener, dialer) = match (config.mode, tls) {
            (RelayMode::Server, TlsContext::Server(server_config)) => (
                RelayListener::tls(listener, server_config, policy.clone()),
                Dialer::plain(target, policy),
            ),
            (RelayMode::Client, TlsContext::Client(client_config)) => (
                RelayListener::plain(listener, policy.clone()),
                Dialer::tls(target, policy, &client_config, config.handshake_timeout)
                    .context("Failed to set up TLS dialer")?,
            ),
            (mode, tls) => bail!(
                "relay mode '{}' does not match TLS context for '{}'",
                mode,
                tls.mode()
            ),
        };
        let listener = listener.with_handshake_timeout(config.handshake_timeout);

        let mut engine = RelayEngine::new(dialer, pool);
        if let Some(pattern) = &config.inspect_pattern {
            let scanner = LineScanner::new(pattern)
                .with_context(|| format!("Invalid inspect pattern: {}", pattern))?;
            info!("Inspecting inbound lines for pattern {:?}", pattern);
            engine = engine.with_scanner(scanner);
        }

        Self::new(listener, engine, metrics).context("Failed to read listener address")
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sessions currently in flight, including ones still handshaking
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        self.engine.pool()
    }

    /// Accept connections until shutdown is signalled or accept fails.
    ///
    /// The listener is closed when this returns; in-flight sessions keep
    /// running to completion. An accept error is returned to the caller.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| anyhow!("accept loop is already running"))?;

        info!(
            "Relaying {} -> {}",
            self.local_addr,
            self.engine.target()
        );

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    let accepted = match accept_result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            return Err(e.into());
                        }
                    };

                    let guard = SessionGuard::new(
                        Arc::clone(&self.active_sessions),
                        Arc::clone(&self.metrics),
                    );
                    let engine = Arc::clone(&self.engine);
                    let metrics = Arc::clone(&self.metrics);

                    tokio::spawn(async move {
                        let _guard = guard;
                        let client_addr = accepted.peer_addr();

                        let inbound = match accepted.establish().await {
                            Ok(inbound) => inbound,
                            Err(e) => {
                                debug!(%client_addr, kind = e.kind(), "Dropping connection: {}", e);
                                metrics.handshake_failed();
                                return;
                            }
                        };

                        let stats = engine.handle(inbound, client_addr).await;
                        metrics.session_finished(&stats, engine.target().protocol());
                    });
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
            }
        }

        info!("Connection acceptance loop stopped");
        Ok(())
    }
}

/// Counts a session from spawn until its task exits
struct SessionGuard {
    active_sessions: Arc<AtomicUsize>,
    metrics: Arc<Metrics>,
}

impl SessionGuard {
    fn new(active_sessions: Arc<AtomicUsize>, metrics: Arc<Metrics>) -> Self {
        active_sessions.fetch_add(1, Ordering::Relaxed);
        metrics.session_started();
        Self {
            active_sessions,
            metrics,
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        self.metrics.session_closed();
    }
}
