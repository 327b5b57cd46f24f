//! Configuration handling for the sockets service.
//!
//! Settings come from the shared YAML config file (under
//! `services.sockets.config`) and are then overridden by `SOCKETS_*`
//! environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sockets_session::{LinkOptions, SessionConfig, TlsIdentity, TlsOptions};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Sockets service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketsConfig {
    /// Default listen host
    pub listen_host: String,
    /// Default listen port
    pub listen_port: u16,
    /// Bound on connecting
    #[serde(with = "humantime_serde_compat")]
    pub connect_timeout: Duration,
    /// Bound on a TLS handshake
    #[serde(with = "humantime_serde_compat")]
    pub tls_timeout: Duration,
    /// Flush grace period on close
    #[serde(with = "humantime_serde_compat")]
    pub close_grace: Duration,
    /// Undelivered bytes at which reads pause
    pub high_water: usize,
    /// Undelivered bytes at which reads resume
    pub low_water: usize,
    /// Largest single read
    pub read_chunk: usize,
    /// Cap on queued write bytes per session
    pub max_pending_write_bytes: Option<usize>,
    /// Wait for `close` after the peer half-closes instead of closing at once
    pub allow_half_open: bool,
    /// Disable Nagle's algorithm
    pub no_delay: bool,
    /// Enable TCP keepalive
    pub keep_alive: bool,
    /// TLS files
    pub tls: TlsConfig,
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate file
    pub cert_file: String,
    /// Path to private key file
    pub key_file: String,
    /// Path to CA certificate file
    pub ca_file: String,
    /// SNI name for outbound upgrades
    pub server_name: String,
}

impl Default for SocketsConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 9000,
            connect_timeout: session.connect_timeout,
            tls_timeout: session.tls_timeout,
            close_grace: session.close_grace,
            high_water: session.high_water,
            low_water: session.low_water,
            read_chunk: session.read_chunk,
            max_pending_write_bytes: session.max_pending_write_bytes,
            allow_half_open: session.allow_half_open,
            no_delay: true,
            keep_alive: false,
            tls: TlsConfig::default(),
        }
    }
}

/// Serialize durations as humantime strings ("30s", "1m 30s")
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    sockets: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    config: Option<HashMap<String, String>>,
}

impl SocketsConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    if let Some(map) = root
                        .services
                        .and_then(|s| s.sockets)
                        .and_then(|s| s.config)
                    {
                        for (key, value) in map {
                            config.apply(&key, &value);
                        }
                    }
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?}, using defaults: {}",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            ),
        }

        config.apply_environment_overrides();
        config
            .session_config()
            .validate()
            .context("Invalid sockets configuration")?;

        info!(
            "Final sockets configuration: listen={}:{}, connect_timeout={}, high_water={}, low_water={}",
            config.listen_host,
            config.listen_port,
            humantime::format_duration(config.connect_timeout),
            config.high_water,
            config.low_water
        );
        Ok(config)
    }

    /// Apply one `services.sockets.*` key; unknown keys and bad values are ignored
    fn apply(&mut self, key: &str, value: &str) {
        let Some(name) = key.strip_prefix("services.sockets.") else {
            return;
        };
        let applied = match name {
            "listen_host" => {
                self.listen_host = value.to_string();
                true
            }
            "listen_port" => set_parsed(&mut self.listen_port, value),
            "connect_timeout" => set_duration(&mut self.connect_timeout, value),
            "tls_timeout" => set_duration(&mut self.tls_timeout, value),
            "close_grace" => set_duration(&mut self.close_grace, value),
            "high_water" => set_parsed(&mut self.high_water, value),
            "low_water" => set_parsed(&mut self.low_water, value),
            "read_chunk" => set_parsed(&mut self.read_chunk, value),
            "max_pending_write_bytes" => match value.parse::<usize>() {
                Ok(0) => {
                    self.max_pending_write_bytes = None;
                    true
                }
                Ok(cap) => {
                    self.max_pending_write_bytes = Some(cap);
                    true
                }
                Err(_) => false,
            },
            "allow_half_open" => set_bool(&mut self.allow_half_open, value),
            "no_delay" => set_bool(&mut self.no_delay, value),
            "keep_alive" => set_bool(&mut self.keep_alive, value),
            "tls.cert_file" => {
                self.tls.cert_file = value.to_string();
                true
            }
            "tls.key_file" => {
                self.tls.key_file = value.to_string();
                true
            }
            "tls.ca_file" => {
                self.tls.ca_file = value.to_string();
                true
            }
            "tls.server_name" => {
                self.tls.server_name = value.to_string();
                true
            }
            _ => return,
        };
        if !applied {
            warn!("Ignoring invalid value {:?} for {}", value, key);
        }
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        for (var, key) in [
            ("SOCKETS_LISTEN_HOST", "listen_host"),
            ("SOCKETS_LISTEN_PORT", "listen_port"),
            ("SOCKETS_CONNECT_TIMEOUT", "connect_timeout"),
            ("SOCKETS_TLS_TIMEOUT", "tls_timeout"),
            ("SOCKETS_CLOSE_GRACE", "close_grace"),
            ("SOCKETS_HIGH_WATER", "high_water"),
            ("SOCKETS_LOW_WATER", "low_water"),
            ("SOCKETS_ALLOW_HALF_OPEN", "allow_half_open"),
        ] {
            if let Ok(value) = std::env::var(var) {
                self.apply(&format!("services.sockets.{}", key), &value);
                info!("{} overridden by environment: {}", key, value);
            }
        }
    }

    /// Library configuration derived from these settings
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: self.connect_timeout,
            tls_timeout: self.tls_timeout,
            close_grace: self.close_grace,
            high_water: self.high_water,
            low_water: self.low_water,
            read_chunk: self.read_chunk,
            max_pending_write_bytes: self.max_pending_write_bytes,
            allow_half_open: self.allow_half_open,
            link: LinkOptions {
                no_delay: self.no_delay,
                keep_alive: self.keep_alive,
                local_address: None,
            },
        }
    }

    /// Client TLS options from the configured CA and optional identity
    pub fn client_tls(&self, server_name: &str) -> Result<TlsOptions> {
        let ca_pem = read_pem(&self.tls.ca_file, "CA certificate")?;
        self.client_tls_with_ca(server_name, ca_pem)
    }

    /// Client TLS options trusting `ca_pem`, with the configured identity if any
    pub fn client_tls_with_ca(&self, server_name: &str, ca_pem: String) -> Result<TlsOptions> {
        let mut options = TlsOptions::client(server_name, ca_pem);
        options.identity = self.identity()?;
        Ok(options)
    }

    /// Server TLS options from the configured identity, verifying clients if a CA is set
    pub fn server_tls(&self) -> Result<TlsOptions> {
        let identity = self
            .identity()?
            .context("TLS server requires tls.cert_file and tls.key_file")?;
        let mut options = TlsOptions::server(identity);
        if !self.tls.ca_file.is_empty() {
            options.ca_pem = Some(read_pem(&self.tls.ca_file, "CA certificate")?);
        }
        Ok(options)
    }

    fn identity(&self) -> Result<Option<TlsIdentity>> {
        if self.tls.cert_file.is_empty() || self.tls.key_file.is_empty() {
            return Ok(None);
        }
        Ok(Some(TlsIdentity {
            cert_chain_pem: read_pem(&self.tls.cert_file, "certificate")?,
            private_key_pem: read_pem(&self.tls.key_file, "private key")?,
        }))
    }
}

fn read_pem(path: &str, what: &str) -> Result<String> {
    if path.is_empty() {
        anyhow::bail!("No {} file configured", what);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {} from {}", what, path))
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, value: &str) -> bool {
    match value.trim().parse() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}

fn set_duration(slot: &mut Duration, value: &str) -> bool {
    match humantime::parse_duration(value.trim()) {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}

fn set_bool(slot: &mut bool, value: &str) -> bool {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => *slot = true,
        "false" | "0" | "no" => *slot = false,
        _ => return false,
    }
    true
}
