//! Data Relay Module
//!
//! Dials the upstream for each accepted connection and relays bytes in both
//! directions until one side finishes.

pub mod dialer;
pub mod engine;
pub mod scanner;
pub mod session;

pub use dialer::{DialedConnection, Dialer};
pub use engine::RelayEngine;
pub use scanner::LineScanner;
pub use session::{EndReason, RelaySession, SessionOutcome, SessionStats, Side};
