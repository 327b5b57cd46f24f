//! Session manager configuration and per-call options.

use crate::error::SocketError;
use crate::transport::{LinkOptions, TlsOptions};
use std::time::Duration;

/// Configuration shared by all sessions of a manager
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Default bound on the Connecting state
    pub connect_timeout: Duration,
    /// Bound on a TLS handshake
    pub tls_timeout: Duration,
    /// How long Closing may take before pending writes are abandoned
    pub close_grace: Duration,
    /// Undelivered Data bytes at which reads pause
    pub high_water: usize,
    /// Reads resume once undelivered Data drops below this many bytes
    pub low_water: usize,
    /// Largest single read, and so the largest Data payload
    pub read_chunk: usize,
    /// Hard cap on queued write bytes per session
    pub max_pending_write_bytes: Option<usize>,
    /// Keep a session Closing after the peer half-closes until `close` is
    /// called; when false a FIN closes the session without acknowledgement
    pub allow_half_open: bool,
    /// Socket options applied when a call does not override them
    pub link: LinkOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            tls_timeout: Duration::from_secs(15),
            close_grace: Duration::from_secs(5),
            high_water: 1024 * 1024,
            low_water: 256 * 1024,
            read_chunk: 64 * 1024,
            max_pending_write_bytes: None,
            allow_half_open: true,
            link: LinkOptions::default(),
        }
    }
}

impl SessionConfig {
    /// Check that thresholds are consistent
    pub fn validate(&self) -> Result<(), SocketError> {
        if self.read_chunk == 0 {
            return Err(SocketError::invalid("read_chunk must be positive"));
        }
        if self.high_water == 0 {
            return Err(SocketError::invalid("high_water must be positive"));
        }
        if self.low_water == 0 {
            return Err(SocketError::invalid("low_water must be positive"));
        }
        if self.low_water >= self.high_water {
            return Err(SocketError::invalid(format!(
                "low_water ({}) must be below high_water ({})",
                self.low_water, self.high_water
            )));
        }
        if self.connect_timeout.is_zero() || self.tls_timeout.is_zero() {
            return Err(SocketError::invalid("timeouts must be non-zero"));
        }
        Ok(())
    }
}

/// Options for `open`
#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    /// Overrides [`SessionConfig::connect_timeout`]
    pub connect_timeout: Option<Duration>,
    /// Upgrade to TLS right after connecting, before any queued write
    pub tls: Option<TlsOptions>,
    /// Overrides [`SessionConfig::link`]
    pub link: Option<LinkOptions>,
}

impl ConnectOptions {
    /// Connect and immediately negotiate TLS
    pub fn with_tls(tls: TlsOptions) -> Self {
        Self {
            tls: Some(tls),
            ..Self::default()
        }
    }
}

/// Options for `listen`
#[derive(Clone, Debug)]
pub struct ListenOptions {
    /// Accept backlog
    pub backlog: u32,
    /// Socket options applied to accepted connections
    pub link: Option<LinkOptions>,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            backlog: 1024,
            link: None,
        }
    }
}
