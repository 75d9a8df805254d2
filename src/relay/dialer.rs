//! Upstream Dialer
//!
//! Opens the outbound leg of a session. Server mode dials plaintext; client
//! mode dials and then completes a TLS handshake eagerly so handshake
//! failures surface here rather than on the first relayed byte.

use rustls::client::Resumption;
use rustls::pki_types::ServerName;
use rustls::HandshakeKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::connection::{BoxedConnection, KeepAlivePolicy};
use crate::error::RelayError;
use crate::protocol::ForwardTarget;
use crate::Result;

/// Bound on TCP connect (including name resolution)
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Entries kept in the client-side TLS session cache
pub const CLIENT_SESSION_CACHE_SIZE: usize = 5000;

/// Successfully established outbound leg
pub struct DialedConnection {
    pub stream: BoxedConnection,
    pub peer_addr: SocketAddr,
    /// Whether the TLS handshake resumed a prior session; `None` for plaintext
    pub resumed: Option<bool>,
}

struct TlsOrigin {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    handshake_timeout: Duration,
}

/// Dials the forward target for each session
pub struct Dialer {
    target: ForwardTarget,
    policy: KeepAlivePolicy,
    connect_timeout: Duration,
    tls: Option<TlsOrigin>,
}

impl Dialer {
    /// Plaintext dialer (server mode)
    pub fn plain(target: ForwardTarget, policy: KeepAlivePolicy) -> Self {
        Self {
            target,
            policy,
            connect_timeout: DIAL_TIMEOUT,
            tls: None,
        }
    }

    /// TLS-originating dialer (client mode).
    ///
    /// The supplied config is cloned; the clone gets the forward host as
    /// server name and its own bounded resumption cache.
    pub fn tls(
        target: ForwardTarget,
        policy: KeepAlivePolicy,
        client_config: &rustls::ClientConfig,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let host = target.host()?.to_string();
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| RelayError::InvalidServerName(host))?;

        let mut config = client_config.clone();
        config.resumption = Resumption::in_memory_sessions(CLIENT_SESSION_CACHE_SIZE);

        Ok(Self {
            target,
            policy,
            connect_timeout: DIAL_TIMEOUT,
            tls: Some(TlsOrigin {
                connector: TlsConnector::from(Arc::new(config)),
                server_name,
                handshake_timeout,
            }),
        })
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn target(&self) -> &ForwardTarget {
        &self.target
    }

    pub fn originates_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Establish one outbound connection
    pub async fn dial(&self) -> std::result::Result<DialedConnection, RelayError> {
        let addr = self.target.address();

        let stream = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(RelayError::Dial {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(RelayError::DialTimeout {
                    addr: addr.to_string(),
                    timeout: self.connect_timeout,
                })
            }
        };

        let peer_addr = stream.peer_addr()?;
        self.policy.apply_keepalive(&stream, peer_addr);

        let Some(origin) = &self.tls else {
            return Ok(DialedConnection {
                stream: self.policy.wrap(stream, peer_addr),
                peer_addr,
                resumed: None,
            });
        };

        let handshake = origin
            .connector
            .connect(origin.server_name.clone(), stream);

        // On error the raw stream was moved into the handshake and is closed with it.
        let tls_stream = match timeout(origin.handshake_timeout, handshake).await {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(source)) => {
                return Err(RelayError::Handshake {
                    peer: peer_addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(RelayError::HandshakeTimeout {
                    peer: peer_addr.to_string(),
                    timeout: origin.handshake_timeout,
                })
            }
        };

        let resumed = tls_stream.get_ref().1.handshake_kind() == Some(HandshakeKind::Resumed);
        if !resumed {
            debug!(upstream_addr = %peer_addr, "TLS connection did not resume a prior session");
        }

        Ok(DialedConnection {
            stream: self.policy.wrap(tls_stream, peer_addr),
            peer_addr,
            resumed: Some(resumed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = Dialer::plain(
            ForwardTarget::parse(&addr.to_string()),
            KeepAlivePolicy::new(Duration::from_secs(60), Duration::ZERO),
        );
        assert!(!dialer.originates_tls());

        let dialed = dialer.dial().await.unwrap();
        assert_eq!(dialed.peer_addr, addr);
        assert!(dialed.resumed.is_none());
    }

    #[tokio::test]
    async fn test_refused_dial_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = Dialer::plain(
            ForwardTarget::parse(&format!("resp://{}", addr)),
            KeepAlivePolicy::disabled(),
        );
        let err = dialer.dial().await.err().unwrap();
        assert_eq!(err.kind(), "dial");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_tls_dialer_requires_host() {
        crate::tls::init_crypto_provider();
        let material = crate::tls::KeyMaterial::self_signed("localhost").unwrap();
        let client_config = crate::tls::client_config(&material).unwrap();

        let missing_port = Dialer::tls(
            ForwardTarget::parse("localhost"),
            KeepAlivePolicy::disabled(),
            &client_config,
            Duration::from_secs(1),
        );
        assert!(missing_port.is_err());

        let dialer = Dialer::tls(
            ForwardTarget::parse("localhost:6380"),
            KeepAlivePolicy::disabled(),
            &client_config,
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(dialer.originates_tls());
    }
}
