//! Relay Error Types
//!
//! Errors raised on the relay path. Only [`RelayError::Accept`] is fatal to
//! the accept loop; everything else is scoped to a single session.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while accepting, dialing, or relaying a session
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to accept inbound connection: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out dialing {addr} after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("TLS handshake with {peer} failed: {source}")]
    Handshake {
        peer: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {peer} timed out after {timeout:?}")]
    HandshakeTimeout { peer: String, timeout: Duration },

    #[error("invalid TLS server name '{0}'")]
    InvalidServerName(String),

    #[error("relay I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Whether the error must stop the accept loop
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Accept(_))
    }

    /// Short stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Accept(_) => "accept",
            RelayError::Dial { .. } => "dial",
            RelayError::DialTimeout { .. } => "dial_timeout",
            RelayError::Handshake { .. } => "handshake",
            RelayError::HandshakeTimeout { .. } => "handshake_timeout",
            RelayError::InvalidServerName(_) => "server_name",
            RelayError::Io(_) => "io",
        }
    }
}

/// Marker carried inside the `io::Error` returned when a connection idles out
#[derive(Debug, Error)]
#[error("connection idle for longer than {0:?}")]
pub struct IdleExpired(pub Duration);

impl IdleExpired {
    /// Build the `io::Error` surfaced to readers and writers
    pub fn into_io_error(self) -> io::Error {
        io::Error::new(io::ErrorKind::TimedOut, self)
    }

    /// Check whether an I/O error was caused by idle expiry
    pub fn is_idle_expiry(err: &io::Error) -> bool {
        err.get_ref()
            .map(|inner| inner.is::<IdleExpired>())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_accept_is_fatal() {
        let accept = RelayError::Accept(io::Error::other("listener closed"));
        let dial = RelayError::DialTimeout {
            addr: "127.0.0.1:1".to_string(),
            timeout: Duration::from_secs(30),
        };

        assert!(accept.is_fatal());
        assert!(!dial.is_fatal());
        assert_eq!(dial.kind(), "dial_timeout");
    }

    #[test]
    fn test_idle_expiry_detection() {
        let idle = IdleExpired(Duration::from_millis(150)).into_io_error();
        assert_eq!(idle.kind(), io::ErrorKind::TimedOut);
        assert!(IdleExpired::is_idle_expiry(&idle));

        let keepalive = io::Error::from(io::ErrorKind::TimedOut);
        assert!(!IdleExpired::is_idle_expiry(&keepalive));
    }
}
