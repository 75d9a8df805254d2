//! Configuration Manager

use super::{CliOverrides, Config, RelayMode};
use crate::protocol::{ForwardTarget, ProtocolKind};
use crate::resource::{MAX_FRAME_SIZE, MIN_SLOTS};
use crate::Result;
use anyhow::{bail, Context};
use std::path::{Path, PathBuf};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "TLSRELAY_";

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        Self::load_from_vars(|name| std::env::var(name).ok())
    }

    /// Apply `TLSRELAY_*` variables from `lookup` over the defaults
    pub fn load_from_vars<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = Config::default();

        if let Some(mode) = var("MODE") {
            config.relay.mode = mode
                .parse::<RelayMode>()
                .with_context(|| format!("Invalid {}MODE: {}", ENV_PREFIX, mode))?;
        }

        if let Some(listen_addr) = var("LISTEN_ADDR") {
            config.relay.listen_addr = listen_addr;
        }

        if let Some(forward_addr) = var("FORWARD_ADDR") {
            config.relay.forward_addr = forward_addr;
        }

        if let Some(period) = var("KEEPALIVE_PERIOD") {
            config.relay.keepalive_period = humantime::parse_duration(&period)
                .with_context(|| format!("Invalid {}KEEPALIVE_PERIOD: {}", ENV_PREFIX, period))?;
        }

        if let Some(idle) = var("IDLE_TIMEOUT") {
            config.relay.idle_timeout = humantime::parse_duration(&idle)
                .with_context(|| format!("Invalid {}IDLE_TIMEOUT: {}", ENV_PREFIX, idle))?;
        }

        if let Some(pattern) = var("PRINT_IF_MATCH") {
            config.relay.inspect_pattern = Some(pattern).filter(|p| !p.is_empty());
        }

        if let Some(budget) = var("BUFFER_BUDGET") {
            config.relay.buffer_budget = budget
                .parse::<usize>()
                .with_context(|| format!("Invalid {}BUFFER_BUDGET: {}", ENV_PREFIX, budget))?;
        }

        if let Some(hostname) = var("HOSTNAME") {
            config.tls.hostname = Some(hostname);
        }

        if let Some(pkfile) = var("PKFILE") {
            config.tls.pkfile = PathBuf::from(pkfile);
        }

        if let Some(certfile) = var("CERTFILE") {
            config.tls.certfile = PathBuf::from(certfile);
        }

        if let Some(cafile) = var("CAFILE") {
            config.tls.cafile = PathBuf::from(cafile);
        }

        if let Some(log_level) = var("LOG_LEVEL") {
            config.logging.level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_relay_config()
            .with_context(|| "Relay configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_relay_config(&self) -> Result<()> {
        let relay = &self.relay;

        relay
            .listen_socket_addr()
            .with_context(|| format!("Invalid listen_addr: {}", relay.listen_addr))?;

        let target = ForwardTarget::parse(&relay.forward_addr);
        target
            .host_and_port()
            .with_context(|| format!("Invalid forward_addr: {}", relay.forward_addr))?;

        if let ProtocolKind::Unknown(scheme) = target.protocol() {
            tracing::warn!(
                "Unknown forward scheme '{}', dial failures will only be logged",
                scheme
            );
        }

        if let Some(pattern) = &relay.inspect_pattern {
            regex::bytes::Regex::new(pattern)
                .with_context(|| format!("Invalid inspect_pattern: {}", pattern))?;
        }

        if relay.buffer_budget < MIN_SLOTS * MAX_FRAME_SIZE {
            bail!(
                "buffer_budget must hold at least {} frames ({} bytes)",
                MIN_SLOTS,
                MIN_SLOTS * MAX_FRAME_SIZE
            );
        }

        if relay.handshake_timeout.is_zero() {
            bail!("handshake_timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, cli: &CliOverrides) {
        if let Some(mode) = cli.mode {
            self.relay.mode = mode;
            tracing::info!("CLI override: mode set to {}", mode);
        }

        if let Some(listen_addr) = &cli.listen_addr {
            self.relay.listen_addr = listen_addr.clone();
            tracing::info!("CLI override: listen address set to {}", listen_addr);
        }

        if let Some(forward_addr) = &cli.forward_addr {
            self.relay.forward_addr = forward_addr.clone();
            tracing::info!("CLI override: forward address set to {}", forward_addr);
        }

        if let Some(period) = cli.keepalive_period {
            self.relay.keepalive_period = period;
            tracing::info!("CLI override: keepalive period set to {:?}", period);
        }

        if let Some(idle) = cli.idle_timeout {
            self.relay.idle_timeout = idle;
            tracing::info!("CLI override: idle timeout set to {:?}", idle);
        }

        if let Some(pattern) = &cli.inspect_pattern {
            self.relay.inspect_pattern = Some(pattern.clone()).filter(|p| !p.is_empty());
            tracing::info!("CLI override: inspect pattern set to {:?}", pattern);
        }

        if let Some(hostname) = &cli.hostname {
            self.tls.hostname = Some(hostname.clone());
            tracing::info!("CLI override: hostname set to {}", hostname);
        }

        if let Some(pkfile) = &cli.pkfile {
            self.tls.pkfile = pkfile.clone();
            tracing::info!("CLI override: private key file set to {}", pkfile.display());
        }

        if let Some(certfile) = &cli.certfile {
            self.tls.certfile = certfile.clone();
            tracing::info!("CLI override: certificate file set to {}", certfile.display());
        }

        if let Some(cafile) = &cli.cafile {
            self.tls.cafile = cafile.clone();
            tracing::info!("CLI override: CA file set to {}", cafile.display());
        }

        if let Some(level) = &cli.log_level {
            self.logging.level = level.clone();
            tracing::info!("CLI override: log level set to {}", level);
        }
    }
}
