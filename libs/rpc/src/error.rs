//! RPC Error Types

use thiserror::Error;
use tpc_codec::{BufferError, ProtocolError};
use tpc_network::NetworkError;

/// Errors surfaced by partition requests
#[derive(Error, Debug)]
pub enum RpcError {
    /// No response within the request's wait budget
    #[error("Request to partition {partition_id} timed out after {timeout_ms}ms")]
    Timeout { partition_id: u32, timeout_ms: u64 },

    /// The connection serving the partition closed with the request outstanding
    #[error("Connection serving partition {partition_id} closed")]
    ConnectionClosed { partition_id: u32 },

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Invalid partition {partition_id} (partition count {partition_count})")]
    InvalidPartition {
        partition_id: u32,
        partition_count: u32,
    },

    /// Response does not answer the request it was correlated with
    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse { expected: String, actual: String },

    /// Request payload a handler could not interpret
    #[error("Malformed request: {reason}")]
    MalformedRequest { reason: String },
}

impl RpcError {
    pub fn invalid_partition(partition_id: u32, partition_count: u32) -> Self {
        Self::InvalidPartition {
            partition_id,
            partition_count,
        }
    }

    pub fn unexpected_response(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedRequest {
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    /// Whether the failure says nothing about the request itself, only about
    /// the path to the partition
    pub fn is_transport(&self) -> bool {
        match self {
            RpcError::Timeout { .. } | RpcError::ConnectionClosed { .. } => true,
            RpcError::Network(e) => e.is_connection_failure(),
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            RpcError::Timeout { .. } => "timeout",
            RpcError::ConnectionClosed { .. } => "connection_closed",
            RpcError::Network(_) => "network",
            RpcError::Protocol(_) => "protocol",
            RpcError::Buffer(_) => "buffer",
            RpcError::InvalidPartition { .. } => "invalid_partition",
            RpcError::UnexpectedResponse { .. } => "unexpected_response",
            RpcError::MalformedRequest { .. } => "malformed_request",
        }
    }
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
