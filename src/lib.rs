//! tlsrelay Library
//!
//! TLS terminating/originating TCP relay. A listener accepts inbound
//! connections, each is paired with one outbound connection to a fixed
//! forward address, and bytes are copied both ways through pooled buffers
//! until either side finishes.

pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod relay;
pub mod resource;
pub mod shutdown;
pub mod tls;

pub use config::Config;
pub use connection::ConnectionManager;
pub use error::{IdleExpired, RelayError};
pub use relay::RelayEngine;
pub use resource::BufferPool;
pub use shutdown::ShutdownCoordinator;
pub use tls::TlsContext;

/// Common error type for the relay
pub type Result<T> = anyhow::Result<T>;
