//! TLS Context
//!
//! Builds the rustls configurations for both relay modes from loaded key
//! material. Server mode requires and verifies client certificates against
//! the CA pool; client mode trusts the CA pool and presents the local
//! certificate chain.

pub mod loader;

use anyhow::{bail, Context};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::{Arc, Once};

pub use loader::KeyMaterial;

use crate::config::RelayMode;
use crate::Result;

static CRYPTO_PROVIDER: Once = Once::new();

/// Install the ring crypto provider for the process
pub fn init_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        // Fails only if another provider was installed first, which is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// TLS configuration handed to the relay core
#[derive(Clone)]
pub enum TlsContext {
    /// Terminates TLS on inbound connections
    Server(Arc<ServerConfig>),
    /// Originates TLS on outbound connections
    Client(Arc<ClientConfig>),
}

impl TlsContext {
    /// Build the context matching `mode`
    pub fn for_mode(mode: RelayMode, material: &KeyMaterial) -> Result<Self> {
        match mode {
            RelayMode::Server => server_config(material).map(TlsContext::Server),
            RelayMode::Client => client_config(material).map(TlsContext::Client),
        }
    }

    pub fn mode(&self) -> RelayMode {
        match self {
            TlsContext::Server(_) => RelayMode::Server,
            TlsContext::Client(_) => RelayMode::Client,
        }
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TlsContext::{:?}", self.mode())
    }
}

fn root_store(material: &KeyMaterial) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(material.ca_certs.iter().cloned());
    if ignored > 0 {
        tracing::warn!("Ignored {} unparsable CA certificates", ignored);
    }
    if added == 0 {
        bail!("CA bundle contains no usable certificates");
    }
    Ok(roots)
}

/// Server configuration requiring a client certificate issued by the CA pool
pub fn server_config(material: &KeyMaterial) -> Result<Arc<ServerConfig>> {
    init_crypto_provider();

    let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(material)?))
        .build()
        .context("Failed to build client certificate verifier")?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(material.certs.clone(), material.key.clone_key())
        .context("Failed to build TLS server configuration")?;

    Ok(Arc::new(config))
}

/// Client configuration trusting the CA pool and presenting the local chain
pub fn client_config(material: &KeyMaterial) -> Result<Arc<ClientConfig>> {
    init_crypto_provider();

    let config = ClientConfig::builder()
        .with_root_certificates(root_store(material)?)
        .with_client_auth_cert(material.certs.clone(), material.key.clone_key())
        .context("Failed to build TLS client configuration")?;

    Ok(Arc::new(config))
}
