//! Error types for the proxy core.

use std::io;
use std::net::SocketAddr;

use relaygate_networking::NetworkError;
use thiserror::Error;

/// Proxy errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The address is already in use or otherwise unavailable.
    #[error("bind failed for {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The configured interface has no usable address.
    #[error("invalid interface: {0}")]
    InvalidInterface(#[from] NetworkError),

    /// Malformed handshake (bad method, bad url, bad port).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Selection found no healthy backend.
    #[error("no healthy backend in group {group}")]
    NoHealthyBackend { group: String },

    /// Connecting to the selected backend failed.
    #[error("connector failure: {target}: {detail}")]
    ConnectorFailure { target: String, detail: String },

    /// The listener or event loop was already closed.
    #[error("{0} is closed")]
    Closed(String),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),

    /// Socket-level error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::Bind { .. } => "bind_failed",
            ProxyError::InvalidInterface(_) => "invalid_interface",
            ProxyError::ProtocolViolation(_) => "protocol_violation",
            ProxyError::NoHealthyBackend { .. } => "no_healthy_backend",
            ProxyError::ConnectorFailure { .. } => "connector_failure",
            ProxyError::Closed(_) => "closed",
            ProxyError::Config(_) => "config_error",
            ProxyError::Io(_) => "io_error",
        }
    }

    /// Whether a caller may retry the request against another backend.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::NoHealthyBackend { .. } | ProxyError::ConnectorFailure { .. }
        )
    }
}

/// Result alias used across the crate.
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
