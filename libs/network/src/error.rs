//! Network Error Types
//!
//! Error handling for reactors, sockets and TLS handshakes. Errors raised on a
//! reactor thread are logged at the dispatch boundary; errors raised for a
//! caller on another thread (reactor not running, bad configuration) are
//! returned synchronously.

use std::net::SocketAddr;
use thiserror::Error;
use tpc_codec::ProtocolError;

/// Main network error type
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Task or registration offered to a reactor that is not running
    #[error("Reactor '{reactor}' is not running")]
    ReactorNotRunning { reactor: String },

    /// Connect, bind and accept failures
    #[error("Connection error: {message} (remote: {remote_addr:?})")]
    Connection {
        message: String,
        remote_addr: Option<SocketAddr>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Malformed frames; the connection that produced them is closed
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// TLS negotiation failures
    #[error("TLS handshake failed: {message} (remote: {remote_addr:?})")]
    Handshake {
        message: String,
        remote_addr: Option<SocketAddr>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation on a socket that is closing or closed
    #[error("Socket closed: {message}")]
    Closed { message: String },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Bounded waits that expired
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
}

/// Result type alias for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

impl NetworkError {
    pub fn reactor_not_running(reactor: impl Into<String>) -> Self {
        Self::ReactorNotRunning {
            reactor: reactor.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: Some(Box::new(source)),
        }
    }

    /// Create a handshake error with source
    pub fn handshake_with_source(
        message: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Handshake {
            message: message.into(),
            remote_addr,
            source: Some(Box::new(source)),
        }
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::Closed {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Protocol errors close the connection that raised them
    pub fn is_protocol(&self) -> bool {
        matches!(self, NetworkError::Protocol(_))
    }

    /// Whether the connection this error came from is unusable
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            NetworkError::Connection { .. }
                | NetworkError::Handshake { .. }
                | NetworkError::Closed { .. }
                | NetworkError::Io { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            NetworkError::ReactorNotRunning { .. } => "reactor_not_running",
            NetworkError::Connection { .. } => "connection",
            NetworkError::Protocol(_) => "protocol",
            NetworkError::Handshake { .. } => "handshake",
            NetworkError::Closed { .. } => "closed",
            NetworkError::Io { .. } => "io",
            NetworkError::Configuration { .. } => "configuration",
            NetworkError::Timeout { .. } => "timeout",
        }
    }
}

/// Convert standard I/O errors to network errors
impl From<std::io::Error> for NetworkError {
    fn from(error: std::io::Error) -> Self {
        NetworkError::Io {
            message: error.to_string(),
            source: error,
        }
    }
}
