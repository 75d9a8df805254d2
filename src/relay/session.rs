//! Relay Session

use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::IdleExpired;

/// Which leg's source finished first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Inbound,
    Outbound,
}

/// Why the first direction finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum EndReason {
    Eof,
    IdleTimeout,
    Error(String),
}

impl EndReason {
    /// Classify the result of one copy direction
    pub fn from_result<T>(result: &io::Result<T>) -> Self {
        match result {
            Ok(_) => EndReason::Eof,
            Err(e) if IdleExpired::is_idle_expiry(e) => EndReason::IdleTimeout,
            Err(e) => EndReason::Error(e.to_string()),
        }
    }
}

/// Terminal state of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionOutcome {
    Relayed { ended_by: Side, reason: EndReason },
    DialFailed { error: String, response_sent: bool },
}

/// An in-flight pairing of one inbound and one outbound connection
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub target: String,
    pub start_time: Instant,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
}

/// Statistics for a finished session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub target: String,
    pub upstream_addr: Option<SocketAddr>,
    pub start_time: SystemTime,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_bytes: u64,
    pub outcome: SessionOutcome,
}

impl RelaySession {
    /// Create a new relay session
    pub fn new(client_addr: SocketAddr, target: impl Into<String>) -> Self {
        let session_id = Uuid::new_v4().to_string();
        let target = target.into();
        debug!(%session_id, %client_addr, %target, "Creating relay session");

        Self {
            session_id,
            client_addr,
            target,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    /// Bytes relayed from the inbound peer to the upstream
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes relayed from the upstream to the inbound peer
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Close the books on this session
    pub fn finish(&self, upstream_addr: Option<SocketAddr>, outcome: SessionOutcome) -> SessionStats {
        let duration = self.duration();

        SessionStats {
            session_id: self.session_id.clone(),
            client_addr: self.client_addr,
            target: self.target.clone(),
            upstream_addr,
            start_time: SystemTime::now() - duration,
            duration_ms: duration.as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            total_bytes: self.total_bytes(),
            outcome,
        }
    }
}

impl SessionStats {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn dial_failed(&self) -> bool {
        matches!(self.outcome, SessionOutcome::DialFailed { .. })
    }

    /// Emit the structured end-of-session record
    pub fn log(&self) {
        match &self.outcome {
            SessionOutcome::Relayed { ended_by, reason } => {
                info!(
                    session_id = %self.session_id,
                    client_addr = %self.client_addr,
                    upstream_addr = ?self.upstream_addr,
                    duration_ms = self.duration_ms,
                    bytes_up = self.bytes_up,
                    bytes_down = self.bytes_down,
                    ended_by = ?ended_by,
                    reason = ?reason,
                    "Relay session ended"
                );
            }
            SessionOutcome::DialFailed { error, response_sent } => {
                info!(
                    session_id = %self.session_id,
                    client_addr = %self.client_addr,
                    target = %self.target,
                    duration_ms = self.duration_ms,
                    response_sent = response_sent,
                    reason = %error,
                    "Relay session ended without upstream"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_accounting() {
        let session = RelaySession::new("127.0.0.1:12345".parse().unwrap(), "localhost:6379");
        assert_eq!(session.total_bytes(), 0);

        session.add_bytes_up(1024);
        session.add_bytes_down(2048);
        session.add_bytes_down(1);

        let stats = session.finish(
            Some("127.0.0.1:6379".parse().unwrap()),
            SessionOutcome::Relayed {
                ended_by: Side::Outbound,
                reason: EndReason::Eof,
            },
        );
        assert_eq!(stats.bytes_up, 1024);
        assert_eq!(stats.bytes_down, 2049);
        assert_eq!(stats.total_bytes, 3073);
        assert_eq!(stats.target, "localhost:6379");
        assert!(!stats.dial_failed());
    }

    #[test]
    fn test_end_reason_classification() {
        let idle: io::Result<u64> = Err(IdleExpired(Duration::from_millis(150)).into_io_error());
        assert_eq!(EndReason::from_result(&idle), EndReason::IdleTimeout);

        let reset: io::Result<u64> = Err(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(EndReason::from_result(&reset), EndReason::Error(_)));

        assert_eq!(EndReason::from_result(&Ok(10u64)), EndReason::Eof);
    }

    #[test]
    fn test_stats_serialize() {
        let session = RelaySession::new("127.0.0.1:1".parse().unwrap(), "resp://redis:6379");
        let stats = session.finish(
            None,
            SessionOutcome::DialFailed {
                error: "connection refused".to_string(),
                response_sent: true,
            },
        );

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["outcome"]["state"], "dial_failed");
        assert_eq!(json["outcome"]["response_sent"], true);
        assert!(json["upstream_addr"].is_null());
    }
}
