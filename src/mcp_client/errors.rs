//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur while connecting to or calling a tool server.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The capability handshake did not finish within its budget.
    #[error("server '{name}' handshake timed out after {timeout_ms}ms")]
    HandshakeTimeout {
        name: String,
        timeout_ms: u64,
    },

    /// The initialization handshake failed (bad response, server error).
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// JSON-RPC communication error (closed channel, malformed message, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A tool call exceeded its timeout budget.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout {
        tool: String,
        timeout_ms: u64,
    },

    /// No server is configured under this key.
    #[error("unknown server: '{name}'")]
    UnknownServer {
        name: String,
    },

    /// The server is configured but disabled.
    #[error("server '{name}' is disabled")]
    ServerDisabled {
        name: String,
    },

    /// Recent rebuilds failed; the pool refuses to respawn until the backoff expires.
    #[error("server '{name}' is backing off after {failures} failed connects ({retry_in_ms}ms left)")]
    BackoffActive {
        name: String,
        failures: u32,
        retry_in_ms: u64,
    },
}

impl McpError {
    /// Whether this error means no usable connection could be obtained,
    /// as opposed to a failure of the call itself.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            McpError::SpawnFailed { .. }
                | McpError::HandshakeTimeout { .. }
                | McpError::InitFailed { .. }
                | McpError::UnknownServer { .. }
                | McpError::ServerDisabled { .. }
                | McpError::BackoffActive { .. }
        )
    }

    /// Whether the channel broke mid-call and the connection should be evicted.
    pub fn is_transport_error(&self) -> bool {
        matches!(self, McpError::TransportError { .. })
    }
}
