//! Metrics Collector

use super::MetricsSnapshot;
use crate::protocol::ProtocolKind;
use crate::relay::SessionStats;
use crate::Result;
use anyhow::Context;
use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error};

/// Collects and exports metrics
pub struct Metrics {
    prometheus_registry: Registry,

    // Prometheus metrics
    sessions_total: Counter,
    active_sessions: Gauge,
    dial_failures_total: CounterVec,
    handshake_failures_total: Counter,
    idle_expirations_total: Counter,
    bytes_transferred_total: CounterVec,
    session_duration: Histogram,

    // Internal counters
    total_sessions: AtomicU64,
    dial_failures: AtomicU64,
    handshake_failures: AtomicU64,
    idle_expirations: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        let prometheus_registry = Registry::new();

        let sessions_total = Counter::new(
            "tlsrelay_sessions_total",
            "Total number of accepted relay sessions",
        )?;

        let active_sessions = Gauge::new(
            "tlsrelay_active_sessions",
            "Number of relay sessions currently in flight",
        )?;

        let dial_failures_total = CounterVec::new(
            Opts::new(
                "tlsrelay_dial_failures_total",
                "Sessions whose upstream could not be dialed",
            ),
            &["protocol"],
        )?;

        let handshake_failures_total = Counter::new(
            "tlsrelay_handshake_failures_total",
            "Inbound TLS handshakes that failed or timed out",
        )?;

        let idle_expirations_total = Counter::new(
            "tlsrelay_idle_expirations_total",
            "Connections closed by the idle timeout",
        )?;

        let bytes_transferred_total = CounterVec::new(
            Opts::new(
                "tlsrelay_bytes_transferred_total",
                "Total bytes relayed, by direction",
            ),
            &["direction"],
        )?;

        let session_duration = Histogram::with_opts(
            HistogramOpts::new(
                "tlsrelay_session_duration_seconds",
                "Duration of relay sessions in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 3600.0]),
        )?;

        prometheus_registry
            .register(Box::new(sessions_total.clone()))
            .context("Failed to register sessions_total")?;
        prometheus_registry
            .register(Box::new(active_sessions.clone()))
            .context("Failed to register active_sessions")?;
        prometheus_registry
            .register(Box::new(dial_failures_total.clone()))
            .context("Failed to register dial_failures_total")?;
        prometheus_registry
            .register(Box::new(handshake_failures_total.clone()))
            .context("Failed to register handshake_failures_total")?;
        prometheus_registry
            .register(Box::new(idle_expirations_total.clone()))
            .context("Failed to register idle_expirations_total")?;
        prometheus_registry
            .register(Box::new(bytes_transferred_total.clone()))
            .context("Failed to register bytes_transferred_total")?;
        prometheus_registry
            .register(Box::new(session_duration.clone()))
            .context("Failed to register session_duration")?;

        Ok(Self {
            prometheus_registry,
            sessions_total,
            active_sessions,
            dial_failures_total,
            handshake_failures_total,
            idle_expirations_total,
            bytes_transferred_total,
            session_duration,
            total_sessions: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            idle_expirations: AtomicU64::new(0),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        })
    }

    /// A connection was accepted and its session task spawned
    pub fn session_started(&self) {
        self.sessions_total.inc();
        self.active_sessions.inc();
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// A session task exited, on any path
    pub fn session_closed(&self) {
        self.active_sessions.dec();
    }

    /// Record the outcome of a session that reached the dial stage
    pub fn session_finished(&self, stats: &SessionStats, protocol: &ProtocolKind) {
        self.session_duration
            .observe(stats.duration().as_secs_f64());

        if stats.dial_failed() {
            self.dial_failures_total
                .with_label_values(&[protocol.name()])
                .inc();
            self.dial_failures.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.bytes_transferred_total
            .with_label_values(&["up"])
            .inc_by(stats.bytes_up as f64);
        self.bytes_transferred_total
            .with_label_values(&["down"])
            .inc_by(stats.bytes_down as f64);
        self.bytes_up.fetch_add(stats.bytes_up, Ordering::Relaxed);
        self.bytes_down.fetch_add(stats.bytes_down, Ordering::Relaxed);

        debug!(
            session_id = %stats.session_id,
            bytes_total = stats.total_bytes,
            "Recorded session statistics"
        );
    }

    /// Record a failed or timed-out inbound TLS handshake
    pub fn handshake_failed(&self) {
        self.handshake_failures_total.inc();
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed by the idle timeout
    pub fn idle_expired(&self) {
        self.idle_expirations_total.inc();
        self.idle_expirations.fetch_add(1, Ordering::Relaxed);
    }

    /// Export metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.prometheus_registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "Failed to encode Prometheus metrics");
                String::new()
            }
        }
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.get().max(0.0) as u64,
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            idle_expirations: self.idle_expirations.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{EndReason, RelaySession, SessionOutcome, Side};

    fn relayed(up: u64, down: u64) -> SessionStats {
        let session = RelaySession::new("127.0.0.1:5000".parse().unwrap(), "localhost:6379");
        session.add_bytes_up(up);
        session.add_bytes_down(down);
        session.finish(
            Some("127.0.0.1:6379".parse().unwrap()),
            SessionOutcome::Relayed {
                ended_by: Side::Inbound,
                reason: EndReason::Eof,
            },
        )
    }

    #[test]
    fn test_session_accounting() {
        let metrics = Metrics::new().unwrap();

        metrics.session_started();
        metrics.session_started();
        assert_eq!(metrics.snapshot().active_sessions, 2);

        metrics.session_finished(&relayed(100, 250), &ProtocolKind::Http);
        metrics.session_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_sessions, 2);
        assert_eq!(snapshot.active_sessions, 1);
        assert_eq!(snapshot.bytes_up, 100);
        assert_eq!(snapshot.bytes_down, 250);
    }

    #[test]
    fn test_dial_failures_labelled_by_protocol() {
        let metrics = Metrics::new().unwrap();
        let session = RelaySession::new("127.0.0.1:5000".parse().unwrap(), "redis:6379");
        let stats = session.finish(
            None,
            SessionOutcome::DialFailed {
                error: "refused".to_string(),
                response_sent: true,
            },
        );

        metrics.session_finished(&stats, &ProtocolKind::Resp);
        metrics.handshake_failed();
        metrics.idle_expired();

        let output = metrics.render();
        assert!(output.contains("tlsrelay_dial_failures_total{protocol=\"RESP\"} 1"));
        assert!(output.contains("tlsrelay_handshake_failures_total 1"));
        assert!(output.contains("tlsrelay_idle_expirations_total 1"));
        assert_eq!(metrics.snapshot().dial_failures, 1);
    }
}
