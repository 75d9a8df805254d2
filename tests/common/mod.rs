//! Shared helpers for relay integration tests.
//!
//! Spawns loopback echo upstreams and relays on ephemeral ports, and opens
//! TLS client connections with self-signed material.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use tlsrelay::config::{RelayConfig, RelayMode};
use tlsrelay::metrics::Metrics;
use tlsrelay::resource::{BufferPool, MAX_FRAME_SIZE};
use tlsrelay::tls::{self, KeyMaterial, TlsContext};
use tlsrelay::ConnectionManager;

/// Loopback upstream that echoes every byte back
pub struct EchoServer {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
}

impl EchoServer {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&connections);

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Ok(Self { addr, connections })
    }
}

/// Address that refuses connections
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Relay running on an ephemeral loopback port
pub struct TestRelay {
    pub manager: Arc<ConnectionManager>,
    pub metrics: Arc<Metrics>,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<tlsrelay::Result<()>>,
}

impl TestRelay {
    pub fn addr(&self) -> SocketAddr {
        self.manager.local_addr()
    }

    pub fn active_sessions(&self) -> usize {
        self.manager.active_sessions()
    }

    pub fn frames_in_use(&self) -> usize {
        self.manager.pool().in_use()
    }

    /// Stop accepting and wait for the accept loop to exit
    pub async fn stop(self) -> tlsrelay::Result<()> {
        let _ = self.shutdown_tx.send(());
        self.handle.await.unwrap()
    }

    /// Wait until every session has finished and released its frames
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        wait_until(limit, || self.active_sessions() == 0 && self.frames_in_use() == 0).await
    }
}

/// Relay configuration for tests: loopback listener, short handshake bound
pub fn relay_config(mode: RelayMode, forward_addr: impl Into<String>) -> RelayConfig {
    RelayConfig {
        mode,
        listen_addr: "127.0.0.1:0".to_string(),
        forward_addr: forward_addr.into(),
        keepalive_period: Duration::from_secs(60),
        idle_timeout: Duration::ZERO,
        buffer_budget: 64 * MAX_FRAME_SIZE,
        handshake_timeout: Duration::from_secs(2),
        ..RelayConfig::default()
    }
}

/// In-memory identity shared by both relay ends
pub fn material() -> KeyMaterial {
    tls::init_crypto_provider();
    KeyMaterial::self_signed("localhost").unwrap()
}

pub async fn spawn_relay(config: RelayConfig, material: &KeyMaterial) -> TestRelay {
    let tls_context = TlsContext::for_mode(config.mode, material).unwrap();
    let listener = TcpListener::bind(config.listen_socket_addr().unwrap())
        .await
        .unwrap();
    let pool = Arc::new(BufferPool::new(config.buffer_budget, MAX_FRAME_SIZE));
    let metrics = Arc::new(Metrics::new().unwrap());

    let manager = Arc::new(
        ConnectionManager::from_config(listener, &config, tls_context, pool, Arc::clone(&metrics))
            .unwrap(),
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let runner = Arc::clone(&manager);
    let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

    TestRelay {
        manager,
        metrics,
        shutdown_tx,
        handle,
    }
}

/// Open a mutually authenticated TLS connection to a server-mode relay
pub async fn tls_connect(addr: SocketAddr, material: &KeyMaterial) -> io::Result<TlsStream<TcpStream>> {
    let config = tls::client_config(material).map_err(io::Error::other)?;
    let connector = TlsConnector::from(config);
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from("localhost").map_err(io::Error::other)?;
    connector.connect(server_name, stream).await
}

/// Poll `condition` until it holds or `limit` elapses
pub async fn wait_until<F>(limit: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
