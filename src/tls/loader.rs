//! Key Material Loading
//!
//! Reads the PEM private key, certificate chain, and CA bundle. Missing key
//! or certificate files are generated and saved so a fresh install can start
//! with a self-signed identity.

use anyhow::{anyhow, Context};
use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs;
use std::io::{BufReader, Write};
use std::path::Path;
use tracing::info;

use crate::config::TlsConfig;
use crate::Result;

/// Private key, certificate chain, and trusted CA certificates
pub struct KeyMaterial {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub ca_certs: Vec<CertificateDer<'static>>,
}

impl KeyMaterial {
    /// Load key material from disk, generating whatever is missing
    pub fn load(config: &TlsConfig, hostname: &str) -> Result<Self> {
        let key_pem = if config.pkfile.exists() {
            fs::read_to_string(&config.pkfile).with_context(|| {
                format!("Failed to read private key: {}", config.pkfile.display())
            })?
        } else {
            info!("Generating private key at {}", config.pkfile.display());
            let key_pair = KeyPair::generate().context("Failed to generate private key")?;
            let pem = key_pair.serialize_pem();
            write_private(&config.pkfile, pem.as_bytes())?;
            pem
        };

        if !config.certfile.exists() {
            info!(
                "Generating self-signed certificate for '{}' at {}",
                hostname,
                config.certfile.display()
            );
            let key_pair = KeyPair::from_pem(&key_pem).with_context(|| {
                format!("Unsupported private key in {}", config.pkfile.display())
            })?;
            let cert = CertificateParams::new(vec![hostname.to_string()])
                .with_context(|| format!("Invalid certificate hostname '{}'", hostname))?
                .self_signed(&key_pair)
                .context("Failed to self-sign certificate")?;
            fs::write(&config.certfile, cert.pem()).with_context(|| {
                format!("Failed to write certificate: {}", config.certfile.display())
            })?;
        }

        let key = parse_private_key(key_pem.as_bytes())
            .with_context(|| format!("Invalid private key: {}", config.pkfile.display()))?;
        let certs = read_certs(&config.certfile)?;
        let ca_certs = read_certs(&config.cafile)?;

        Ok(Self {
            certs,
            key,
            ca_certs,
        })
    }

    /// In-memory self-signed identity that also serves as its own CA
    pub fn self_signed(hostname: &str) -> Result<Self> {
        let generated = rcgen::generate_simple_self_signed(vec![hostname.to_string()])
            .with_context(|| format!("Failed to generate certificate for '{}'", hostname))?;

        let cert = generated.cert.der().clone();
        let key = PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der());

        Ok(Self {
            certs: vec![cert.clone()],
            key: PrivateKeyDer::Pkcs8(key),
            ca_certs: vec![cert],
        })
    }
}

impl Clone for KeyMaterial {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
            ca_certs: self.ca_certs.clone(),
        }
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("certs", &self.certs.len())
            .field("ca_certs", &self.ca_certs.len())
            .finish_non_exhaustive()
    }
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open certificates: {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates: {}", path.display()))?;

    if certs.is_empty() {
        return Err(anyhow!("No certificates found in {}", path.display()));
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))?
        .ok_or_else(|| anyhow!("no private key found"))
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to create private key: {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("Failed to write private key: {}", path.display()))?;
    Ok(())
}
