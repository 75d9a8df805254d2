//! Forward Protocol Types

use anyhow::{anyhow, bail};
use bytes::Bytes;
use serde::Serialize;
use std::fmt;

use crate::protocol::constants::*;
use crate::Result;

/// Convention used to tell an inbound peer that the upstream is unreachable
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum ProtocolKind {
    Http,
    Resp,
    Unknown(String),
}

impl ProtocolKind {
    /// Classify a scheme name; no scheme at all means HTTP
    pub fn from_scheme(scheme: Option<&str>) -> Self {
        match scheme {
            None | Some(SCHEME_HTTP) => ProtocolKind::Http,
            Some(SCHEME_RESP) => ProtocolKind::Resp,
            Some(other) => ProtocolKind::Unknown(other.to_string()),
        }
    }

    /// Protocol name for logs and metric labels
    pub fn name(&self) -> &str {
        match self {
            ProtocolKind::Http => "HTTP",
            ProtocolKind::Resp => "RESP",
            ProtocolKind::Unknown(name) => name,
        }
    }

    /// Bytes to write on the inbound leg when the dial fails, if any
    pub fn bad_gateway_response(&self) -> Option<Bytes> {
        match self {
            ProtocolKind::Http => Some(Bytes::from_static(HTTP_BAD_GATEWAY)),
            ProtocolKind::Resp => Some(Bytes::from_static(RESP_BAD_GATEWAY)),
            ProtocolKind::Unknown(_) => None,
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Forward address with its scheme stripped and classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    address: String,
    protocol: ProtocolKind,
}

impl ForwardTarget {
    /// Split an optional `scheme://` prefix off a forward address
    pub fn parse(forward_addr: &str) -> Self {
        let (scheme, address) = match forward_addr.split_once(SCHEME_SEPARATOR) {
            Some((scheme, rest)) => (Some(scheme), rest),
            None => (None, forward_addr),
        };

        Self {
            address: address.to_string(),
            protocol: ProtocolKind::from_scheme(scheme),
        }
    }

    /// `host:port` to dial
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn protocol(&self) -> &ProtocolKind {
        &self.protocol
    }

    /// Host and port parts of the address; IPv6 brackets are removed
    pub fn host_and_port(&self) -> Result<(&str, u16)> {
        let (host, port) = self
            .address
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("forward address '{}' is missing a port", self.address))?;

        let port = port
            .parse::<u16>()
            .map_err(|e| anyhow!("invalid port in forward address '{}': {}", self.address, e))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if host.is_empty() {
            bail!("forward address '{}' is missing a host", self.address);
        }

        Ok((host, port))
    }

    /// Host used as the TLS server name when originating TLS
    pub fn host(&self) -> Result<&str> {
        self.host_and_port().map(|(host, _)| host)
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.protocol)
    }
}
