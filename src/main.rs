//! tlsrelay - TLS terminating/originating TCP relay
//!
//! Server mode terminates mutually authenticated TLS and forwards plaintext;
//! client mode accepts plaintext and forwards over TLS.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tlsrelay::{
    config::{CliOverrides, Config, ConfigManager, RelayMode},
    metrics::Metrics,
    resource::{BufferPool, MAX_FRAME_SIZE},
    tls::{self, KeyMaterial, TlsContext},
    ConnectionManager, ShutdownCoordinator,
};

/// CLI arguments for tlsrelay
#[derive(Parser, Debug)]
#[command(name = "tlsrelay")]
#[command(about = "TLS terminating/originating TCP relay")]
#[command(version)]
#[command(long_about = "
tlsrelay - TLS terminating/originating TCP relay

In server mode, accepts TLS connections (client certificates required) and
forwards plaintext to the forward address. In client mode, accepts plaintext
and forwards over TLS. Prefix the forward address with http:// or resp:// to
have unreachable upstreams reported to the client in that protocol.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  TLSRELAY_MODE              - server or client
  TLSRELAY_LISTEN_ADDR       - Listen address (e.g., 0.0.0.0:6380)
  TLSRELAY_FORWARD_ADDR      - Forward address (e.g., resp://localhost:6379)
  TLSRELAY_KEEPALIVE_PERIOD  - TCP keepalive period (e.g., 2h, 0s disables)
  TLSRELAY_IDLE_TIMEOUT      - Idle timeout (e.g., 5m, 0s disables)
  TLSRELAY_PRINT_IF_MATCH    - Log client address when inbound lines match
  TLSRELAY_BUFFER_BUDGET     - Total bytes for pooled relay buffers
  TLSRELAY_HOSTNAME          - Hostname for generated certificates
  TLSRELAY_PKFILE            - Private key file
  TLSRELAY_CERTFILE          - Certificate file
  TLSRELAY_CAFILE            - CA certificate file
  TLSRELAY_LOG_LEVEL         - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "tlsrelay.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Relay mode (overrides config file)
    #[arg(short, long, value_parser = parse_mode, help = "Relay mode: server or client")]
    pub mode: Option<RelayMode>,

    /// Hostname for generated certificates
    #[arg(long, help = "Hostname for generated certificates")]
    pub hostname: Option<String>,

    /// Listen address (overrides config file)
    #[arg(short, long, help = "Listen address (e.g., 0.0.0.0:6380)")]
    pub listen_addr: Option<String>,

    /// Forward address (overrides config file)
    #[arg(short, long, help = "Forward address (e.g., resp://localhost:6379)")]
    pub forward_addr: Option<String>,

    /// TCP keepalive period
    #[arg(long, value_parser = humantime::parse_duration, help = "TCP keepalive period (0s disables)")]
    pub keepalive_period: Option<Duration>,

    /// Idle timeout
    #[arg(long, value_parser = humantime::parse_duration, help = "Idle timeout (0s disables)")]
    pub idle_timeout: Option<Duration>,

    /// Private key file
    #[arg(long, help = "Private key file")]
    pub pkfile: Option<PathBuf>,

    /// Certificate file
    #[arg(long, help = "Certificate file")]
    pub certfile: Option<PathBuf>,

    /// CA certificate file
    #[arg(long, help = "CA certificate file")]
    pub cafile: Option<PathBuf>,

    /// Log the client address when an inbound line matches this regex
    #[arg(long, help = "Log client address when inbound lines match this regex (slow)")]
    pub print_if_match: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            mode: self.mode,
            hostname: self.hostname.clone(),
            listen_addr: self.listen_addr.clone(),
            forward_addr: self.forward_addr.clone(),
            keepalive_period: self.keepalive_period,
            idle_timeout: self.idle_timeout,
            pkfile: self.pkfile.clone(),
            certfile: self.certfile.clone(),
            cafile: self.cafile.clone(),
            inspect_pattern: self.print_if_match.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

fn parse_mode(s: &str) -> std::result::Result<RelayMode, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(&args.overrides());

    init_tracing(&config, args.verbose)?;

    config
        .validate()
        .context("Final configuration validation failed")?;

    info!("Starting tlsrelay v{}", env!("CARGO_PKG_VERSION"));

    if args.validate_config {
        info!("Configuration is valid");
        log_summary(&config);
        return Ok(());
    }

    log_summary(&config);

    let hostname = config.tls.resolve_hostname();
    tls::init_crypto_provider();
    let material = KeyMaterial::load(&config.tls, &hostname).context("Failed to load key material")?;
    let tls_context = TlsContext::for_mode(config.relay.mode, &material)?;

    let listen_addr = config
        .relay
        .listen_socket_addr()
        .with_context(|| format!("Invalid listen address: {}", config.relay.listen_addr))?;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to listen on {}", listen_addr))?;

    let pool = Arc::new(BufferPool::new(config.relay.buffer_budget, MAX_FRAME_SIZE));
    let metrics = Arc::new(Metrics::new()?);

    let connection_manager = Arc::new(ConnectionManager::from_config(
        listener,
        &config.relay,
        tls_context,
        pool,
        Arc::clone(&metrics),
    )?);

    let shutdown_coordinator = ShutdownCoordinator::new(config.relay.shutdown_timeout);

    let manager = Arc::clone(&connection_manager);
    let shutdown_rx = shutdown_coordinator.subscribe();
    let mut server_handle = tokio::spawn(async move { manager.run(shutdown_rx).await });

    info!(
        "tlsrelay listening on {} in {} mode",
        connection_manager.local_addr(),
        config.relay.mode
    );

    let accept_result = tokio::select! {
        result = &mut server_handle => Some(result),
        signal_result = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = signal_result {
                error!("Error setting up signal handlers: {}", e);
            }
            None
        }
    };

    let accept_result = match accept_result {
        Some(result) => result,
        None => {
            info!("Initiating graceful shutdown...");
            shutdown_coordinator.trigger();
            server_handle.await
        }
    };

    let accept_result = accept_result.context("Server task failed")?;
    if let Err(e) = &accept_result {
        error!("Accept loop failed: {:#}", e);
    }

    shutdown_coordinator.drain(&connection_manager).await;

    let snapshot = metrics.snapshot();
    info!(
        total_sessions = snapshot.total_sessions,
        dial_failures = snapshot.dial_failures,
        handshake_failures = snapshot.handshake_failures,
        idle_expirations = snapshot.idle_expirations,
        bytes_up = snapshot.bytes_up,
        bytes_down = snapshot.bytes_down,
        "Relay shutdown complete"
    );
    debug!("Final metrics:\n{}", metrics.render());

    accept_result
}

fn log_summary(config: &Config) {
    info!("Configuration summary:");
    info!("  Mode: {}", config.relay.mode);
    info!("  Listen address: {}", config.relay.listen_addr);
    info!("  Forward address: {}", config.relay.forward_addr);
    info!("  Keepalive period: {:?}", config.relay.keepalive_period);
    info!("  Idle timeout: {:?}", config.relay.idle_timeout);
    info!("  Buffer budget: {} bytes", config.relay.buffer_budget);
    if let Some(pattern) = &config.relay.inspect_pattern {
        info!("  Inspect pattern: {:?}", pattern);
    }
}

/// Initialize tracing/logging
fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let log_level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
