//! Listener Wrapper
//!
//! Wraps the externally bound listening socket. In server mode every accepted
//! connection is upgraded with a TLS handshake; in client mode it is used as
//! plaintext. Keepalive and idle policy are applied to every accepted
//! connection before it reaches the relay.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::{BoxedConnection, KeepAlivePolicy};
use crate::error::RelayError;

/// Default bound on the server-side TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Listening socket plus the per-connection upgrade policy
pub struct RelayListener {
    inner: TcpListener,
    acceptor: Option<TlsAcceptor>,
    policy: KeepAlivePolicy,
    handshake_timeout: Duration,
}

impl RelayListener {
    /// Plaintext listener (client mode)
    pub fn plain(inner: TcpListener, policy: KeepAlivePolicy) -> Self {
        Self {
            inner,
            acceptor: None,
            policy,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// TLS-terminating listener (server mode)
    pub fn tls(
        inner: TcpListener,
        server_config: Arc<rustls::ServerConfig>,
        policy: KeepAlivePolicy,
    ) -> Self {
        Self {
            inner,
            acceptor: Some(TlsAcceptor::from(server_config)),
            policy,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn terminates_tls(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Accept the next raw connection and enable OS keepalive on it.
    ///
    /// The TLS upgrade is deferred to [`Accepted::establish`] so a slow
    /// handshake never holds up the accept loop.
    pub async fn accept(&self) -> Result<Accepted, RelayError> {
        let (stream, peer_addr) = self.inner.accept().await.map_err(RelayError::Accept)?;
        debug!(%peer_addr, "Accepted inbound connection");

        self.policy.apply_keepalive(&stream, peer_addr);

        Ok(Accepted {
            stream,
            peer_addr,
            acceptor: self.acceptor.clone(),
            policy: self.policy.clone(),
            handshake_timeout: self.handshake_timeout,
        })
    }
}

/// Inbound connection that has not yet been upgraded
pub struct Accepted {
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    policy: KeepAlivePolicy,
    handshake_timeout: Duration,
}

impl Accepted {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Run the TLS handshake if required and apply idle policy.
    ///
    /// On failure the raw connection is dropped and closed here.
    pub async fn establish(self) -> Result<BoxedConnection, RelayError> {
        let Accepted {
            stream,
            peer_addr,
            acceptor,
            policy,
            handshake_timeout,
        } = self;

        let Some(acceptor) = acceptor else {
            return Ok(policy.wrap(stream, peer_addr));
        };

        match timeout(handshake_timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls_stream)) => {
                debug!(%peer_addr, "Completed inbound TLS handshake");
                Ok(policy.wrap(tls_stream, peer_addr))
            }
            Ok(Err(source)) => Err(RelayError::Handshake {
                peer: peer_addr.to_string(),
                source,
            }),
            Err(_) => Err(RelayError::HandshakeTimeout {
                peer: peer_addr.to_string(),
                timeout: handshake_timeout,
            }),
        }
    }
}
