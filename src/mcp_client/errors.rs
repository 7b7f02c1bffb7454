//! MCP Client error types.

use thiserror::Error;

use super::registry::ServerStatus;

/// Errors that can occur during transport, registry and client operations.
///
/// `Clone` so that a single terminal condition (process exit) can be
/// delivered to every request still waiting on the connection.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{server}': {reason}")]
    SpawnFailed { server: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{server}' initialization failed: {reason}")]
    InitFailed { server: String, reason: String },

    /// An operation needed a live connection and there is none.
    #[error("server '{server}' is not connected")]
    NotConnected { server: String },

    /// I/O failure on the process pipes.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// A line could not be decoded as a JSON-RPC message.
    #[error("invalid JSON-RPC message: {reason}")]
    InvalidMessage { reason: String },

    /// A response arrived but its payload did not have the expected shape.
    #[error("invalid '{method}' response: {reason}")]
    InvalidResponse { method: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No response arrived within the request budget.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// Server process exited or its output stream failed.
    #[error("server '{server}' process exited: {reason}")]
    ServerCrashed { server: String, reason: String },

    /// Tool is not in the server's advertised list.
    #[error("unknown tool '{name}' on server '{server}'")]
    UnknownTool { server: String, name: String },

    /// No registry entry with this id.
    #[error("server not registered: '{id}'")]
    ServerNotFound { id: String },

    /// A registry entry with this id already exists.
    #[error("server already registered: '{id}'")]
    DuplicateServer { id: String },

    /// The registry refused a transition for the server's current status.
    #[error("cannot {action} server '{id}' while it is {status}")]
    InvalidState {
        id: String,
        action: String,
        status: ServerStatus,
    },

    /// Configuration error (bad config file, invalid entries).
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl McpError {
    /// Whether the failure concerns the connection rather than the request.
    ///
    /// Connection-level failures mean a cached client should be rebuilt.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            McpError::NotConnected { .. }
                | McpError::TransportError { .. }
                | McpError::ServerCrashed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = McpError::Timeout {
            method: "tools/call".into(),
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "request 'tools/call' timed out after 250ms");

        let err = McpError::InvalidState {
            id: "fs".into(),
            action: "unregister".into(),
            status: ServerStatus::Running,
        };
        assert_eq!(err.to_string(), "cannot unregister server 'fs' while it is running");
    }

    #[test]
    fn test_is_connection_failure() {
        assert!(McpError::ServerCrashed {
            server: "fs".into(),
            reason: "stdout closed".into()
        }
        .is_connection_failure());
        assert!(!McpError::ServerError {
            code: -32601,
            message: "Method not found".into(),
            data: None
        }
        .is_connection_failure());
    }
}
