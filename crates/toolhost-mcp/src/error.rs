//! Error types for server lifecycle and protocol operations.

use thiserror::Error;

/// Errors from starting servers and talking to them.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Server '{name}' is not configured")]
    NotConfigured { name: String },

    #[error("Server '{name}' is disabled")]
    ServerDisabled { name: String },

    #[error("Server '{name}' uses the {transport} transport, which cannot be started")]
    UnsupportedTransport { name: String, transport: String },

    #[error("Failed to spawn server '{name}': {source}")]
    SpawnFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("Server '{name}' did not become ready within {timeout_ms}ms")]
    StartTimeout { name: String, timeout_ms: u64 },

    #[error("Server '{name}' exited during startup ({status})")]
    StartFailed { name: String, status: String },

    #[error("Server '{name}' is not running")]
    ServerNotRunning { name: String },

    #[error("Server '{name}' stopped before responding")]
    ServerStopped { name: String },

    #[error("Protocol error from '{server}': {message}")]
    ProtocolError { server: String, message: String },

    #[error("JSON-RPC error from '{server}' (code {code}): {message}")]
    JsonRpc {
        server: String,
        code: i64,
        message: String,
    },

    #[error("Tool '{tool}' on '{server}' failed: {message}")]
    ToolExecutionError {
        server: String,
        tool: String,
        message: String,
    },

    #[error("Request '{method}' to '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("Request '{method}' to '{server}' was cancelled")]
    Cancelled { server: String, method: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    pub(crate) fn protocol(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProtocolError {
            server: server.into(),
            message: message.into(),
        }
    }

    /// True for failures where the server itself went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::ServerStopped { .. } | Self::ServerNotRunning { .. }
        )
    }
}
