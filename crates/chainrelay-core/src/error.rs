//! Transport-level error types.

use thiserror::Error;

use crate::request::JsonRpcError;

/// Errors that can occur on a socket, an HTTP call or the connection pool.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, timeout, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The remote answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// WebSocket connection/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// The connection exists but is not `Open` right now.
    #[error("Connection to {url} is not open")]
    NotConnected { url: String },

    /// The connection spent its reconnect budget or was shut down.
    #[error("Connection to {url} is terminated")]
    Terminated { url: String },

    /// Every endpoint in the pool is terminated.
    #[error("All endpoints terminated")]
    AllEndpointsTerminated,

    /// The pool was built without endpoints.
    #[error("No endpoints configured")]
    NoEndpoints,

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` if this error is transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_)
                | Self::HttpStatus { .. }
                | Self::WebSocket(_)
                | Self::NotConnected { .. }
                | Self::Timeout { .. }
        )
    }

    /// Returns `true` if no amount of waiting on this connection will help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Terminated { .. } | Self::AllEndpointsTerminated | Self::NoEndpoints
        )
    }
}
