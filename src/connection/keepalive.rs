//! Keepalive and Idle Policy
//!
//! Two independent behaviors, each disabled by a zero duration:
//! OS-level TCP keepalive probing, applied to the raw socket right after
//! accept or dial, and application-level idle-timeout closure, applied as a
//! wrapper around the final (possibly TLS) stream.

use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::idle::{IdleCallback, IdleTimeoutExt};
use super::{BoxedConnection, Connection};

/// Connections whose transport can be told to send keepalive probes
pub trait KeepAliveCapable {
    /// Raw socket backing the connection, if it exposes one
    fn keepalive_socket(&self) -> Option<SockRef<'_>>;
}

impl KeepAliveCapable for TcpStream {
    fn keepalive_socket(&self) -> Option<SockRef<'_>> {
        Some(SockRef::from(self))
    }
}

impl<S: KeepAliveCapable> KeepAliveCapable for tokio_rustls::server::TlsStream<S> {
    fn keepalive_socket(&self) -> Option<SockRef<'_>> {
        self.get_ref().0.keepalive_socket()
    }
}

impl<S: KeepAliveCapable> KeepAliveCapable for tokio_rustls::client::TlsStream<S> {
    fn keepalive_socket(&self) -> Option<SockRef<'_>> {
        self.get_ref().0.keepalive_socket()
    }
}

impl KeepAliveCapable for DuplexStream {
    fn keepalive_socket(&self) -> Option<SockRef<'_>> {
        None
    }
}

/// Keepalive period and idle timeout applied to every connection
#[derive(Clone, Default)]
pub struct KeepAlivePolicy {
    keepalive_period: Option<Duration>,
    idle_timeout: Option<Duration>,
    on_idle: Option<IdleCallback>,
}

impl KeepAlivePolicy {
    /// Build a policy; zero durations disable the matching behavior
    pub fn new(keepalive_period: Duration, idle_timeout: Duration) -> Self {
        Self {
            keepalive_period: (!keepalive_period.is_zero()).then_some(keepalive_period),
            idle_timeout: (!idle_timeout.is_zero()).then_some(idle_timeout),
            on_idle: None,
        }
    }

    /// Policy that leaves connections untouched
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Callback fired whenever a wrapped connection idles out
    pub fn with_idle_callback(mut self, callback: IdleCallback) -> Self {
        self.on_idle = Some(callback);
        self
    }

    pub fn keepalive_period(&self) -> Option<Duration> {
        self.keepalive_period
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn is_enabled(&self) -> bool {
        self.keepalive_period.is_some() || self.idle_timeout.is_some()
    }

    /// Turn on OS keepalive probing for `conn`.
    ///
    /// Failures are reported and the connection is used without the
    /// guarantee. Returns whether probing is now active.
    pub fn apply_keepalive<C>(&self, conn: &C, peer: SocketAddr) -> bool
    where
        C: KeepAliveCapable + ?Sized,
    {
        let Some(period) = self.keepalive_period else {
            return false;
        };

        let Some(socket) = conn.keepalive_socket() else {
            warn!(%peer, "Connection does not expose a socket, can't set keepalive period");
            return false;
        };

        match set_keepalive(&socket, period) {
            Ok(()) => {
                debug!(%peer, ?period, "Enabled TCP keepalive");
                true
            }
            Err(e) => {
                warn!(%peer, "Unable to set TCP keepalive period: {}", e);
                false
            }
        }
    }

    /// Wrap `conn` with idle-timeout closure when configured
    pub fn wrap<C: Connection>(&self, conn: C, peer: SocketAddr) -> BoxedConnection {
        match self.idle_timeout {
            Some(timeout) => {
                let on_idle = self.on_idle.clone();
                let wrapped = conn.with_idle_timeout(timeout).on_expire(move || {
                    debug!(%peer, ?timeout, "Closing idle connection");
                    if let Some(callback) = &on_idle {
                        callback();
                    }
                });
                Box::new(wrapped)
            }
            None => Box::new(conn),
        }
    }
}

impl fmt::Debug for KeepAlivePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeepAlivePolicy")
            .field("keepalive_period", &self.keepalive_period)
            .field("idle_timeout", &self.idle_timeout)
            .field("on_idle", &self.on_idle.is_some())
            .finish()
    }
}

fn set_keepalive(socket: &SockRef<'_>, period: Duration) -> io::Result<()> {
    socket.set_keepalive(true)?;
    let keepalive = TcpKeepalive::new().with_time(period);
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", windows))]
    let keepalive = keepalive.with_interval(period);
    socket.set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_zero_durations_disable() {
        let policy = KeepAlivePolicy::new(Duration::ZERO, Duration::ZERO);
        assert!(!policy.is_enabled());
        assert!(policy.keepalive_period().is_none());
        assert!(policy.idle_timeout().is_none());

        let policy = KeepAlivePolicy::new(Duration::from_secs(30), Duration::ZERO);
        assert_eq!(policy.keepalive_period(), Some(Duration::from_secs(30)));
        assert!(policy.idle_timeout().is_none());
    }

    #[tokio::test]
    async fn test_keepalive_applied_to_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();

        let policy = KeepAlivePolicy::new(Duration::from_secs(7), Duration::ZERO);
        assert!(policy.apply_keepalive(&client, addr));

        let socket = client.keepalive_socket().unwrap();
        assert!(socket.keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_keepalive_unsupported_is_reported_not_fatal() {
        let (conn, _peer) = tokio::io::duplex(64);
        let policy = KeepAlivePolicy::new(Duration::from_secs(7), Duration::ZERO);
        assert!(!policy.apply_keepalive(&conn, "127.0.0.1:9".parse().unwrap()));
    }
}
