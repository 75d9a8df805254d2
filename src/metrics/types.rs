//! Metrics Types

use serde::Serialize;

/// Relay counters at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub dial_failures: u64,
    pub handshake_failures: u64,
    pub idle_expirations: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl MetricsSnapshot {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_up + self.bytes_down
    }
}
