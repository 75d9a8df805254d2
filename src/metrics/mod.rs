//! Metrics Module
//!
//! Prometheus counters for the relay, rendered as text on demand.

pub mod collector;
pub mod types;

pub use collector::Metrics;
pub use types::MetricsSnapshot;
