//! Connection Management Module
//!
//! Handles inbound acceptance, keepalive and idle policy, and the accept loop.

pub mod idle;
pub mod keepalive;
pub mod listener;
pub mod manager;

use tokio::io::{AsyncRead, AsyncWrite};

pub use idle::{IdleCallback, IdleTimeout, IdleTimeoutExt};
pub use keepalive::{KeepAliveCapable, KeepAlivePolicy};
pub use listener::{Accepted, RelayListener};
pub use manager::ConnectionManager;

/// Bidirectional byte stream relayed by a session
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased connection; the TLS, idle, and plain variants all end up here
pub type BoxedConnection = Box<dyn Connection>;
