//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::resource::DEFAULT_BUFFER_BUDGET;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub tls: TlsConfig,
    pub logging: LoggingConfig,
}

/// Which leg of the relay is TLS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Terminate TLS on inbound connections, forward plaintext
    #[default]
    Server,
    /// Accept plaintext, originate TLS to the forward address
    Client,
}

impl RelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMode::Server => "server",
            RelayMode::Client => "client",
        }
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "server" => Ok(RelayMode::Server),
            "client" => Ok(RelayMode::Client),
            other => Err(anyhow::anyhow!(
                "unknown mode '{}', expected 'server' or 'client'",
                other
            )),
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub mode: RelayMode,
    pub listen_addr: String,
    /// `host:port`, optionally prefixed with `http://` or `resp://`
    pub forward_addr: String,
    #[serde(with = "humantime_serde")]
    pub keepalive_period: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Regex that switches inbound copying to the line scanner
    pub inspect_pattern: Option<String>,
    pub buffer_budget: usize,
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: RelayMode::Server,
            listen_addr: "0.0.0.0:6380".to_string(),
            forward_addr: "localhost:6379".to_string(),
            keepalive_period: Duration::from_secs(2 * 60 * 60),
            idle_timeout: Duration::ZERO,
            inspect_pattern: None,
            buffer_budget: DEFAULT_BUFFER_BUDGET,
            handshake_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    /// Listen address as a socket address; a bare `:port` binds all interfaces
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        match self.listen_addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{}", port).parse(),
            None => self.listen_addr.parse(),
        }
    }
}

/// Key material configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Name for generated certificates; falls back to `$HOSTNAME`
    pub hostname: Option<String>,
    pub pkfile: PathBuf,
    pub certfile: PathBuf,
    pub cafile: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            pkfile: PathBuf::from("pk.pem"),
            certfile: PathBuf::from("cert.pem"),
            cafile: PathBuf::from("cert.pem"),
        }
    }
}

impl TlsConfig {
    /// Configured hostname, else `$HOSTNAME`, else `localhost`
    pub fn resolve_hostname(&self) -> String {
        self.hostname
            .clone()
            .filter(|h| !h.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Values supplied on the command line; `None` leaves the loaded value alone
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub mode: Option<RelayMode>,
    pub hostname: Option<String>,
    pub listen_addr: Option<String>,
    pub forward_addr: Option<String>,
    pub keepalive_period: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub pkfile: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
    pub cafile: Option<PathBuf>,
    pub inspect_pattern: Option<String>,
    pub log_level: Option<String>,
}
