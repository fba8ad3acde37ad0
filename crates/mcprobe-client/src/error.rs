//! Error types for MCP operations.

use thiserror::Error;

/// Errors from MCP server communication.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to spawn MCP server '{name}': {source}")]
    SpawnFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("MCP handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("JSON-RPC error (code {code}): {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("Connection to MCP server closed")]
    ConnectionClosed,

    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Client is not connected")]
    NotConnected,

    #[error("Client is already connected; close() first")]
    AlreadyConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// The numeric code of a server-reported JSON-RPC error, if that is
    /// what this error is.
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::INVALID_PARAMS;

    #[test]
    fn rpc_code_on_rpc_error() {
        let err = McpError::Rpc {
            code: INVALID_PARAMS,
            message: "Missing required property: url".to_string(),
            data: None,
        };
        assert_eq!(err.rpc_code(), Some(-32602));
    }

    #[test]
    fn rpc_code_on_other_errors() {
        assert_eq!(McpError::NotConnected.rpc_code(), None);
        assert_eq!(McpError::ConnectionClosed.rpc_code(), None);
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = McpError::Rpc {
            code: -32602,
            message: "Only deepwiki.com domains are allowed".to_string(),
            data: None,
        };
        let text = err.to_string();
        assert!(text.contains("-32602"));
        assert!(text.contains("deepwiki.com"));
    }
}
