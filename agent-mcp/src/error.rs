//! Errors surfaced by the MCP layer.

use std::time::Duration;

use agent_primitives::ErrorKind;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{INTERNAL_ERROR, INVALID_PARAMS, JsonRpcError};

/// Errors surfaced by [`crate::McpClient`], [`crate::McpServer`] and handlers.
#[derive(Debug, Error)]
pub enum McpError {
    /// No response arrived in time. The server may still be working.
    #[error("`{method}` timed out after {after:?}")]
    Timeout {
        /// Method that was called.
        method: String,
        /// Configured timeout.
        after: Duration,
    },
    /// The peer went away.
    #[error("connection closed")]
    ConnectionClosed,
    /// The peer answered with a JSON-RPC error.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message.
        message: String,
        /// Optional error payload.
        data: Option<Value>,
    },
    /// A handler failed; reported to the peer as an internal error.
    #[error("{message}")]
    Handler {
        /// Failure description.
        message: String,
    },
    /// A result or params payload had the wrong shape.
    #[error("malformed payload: {source}")]
    Serialization {
        /// Underlying decode error.
        #[from]
        source: serde_json::Error,
    },
}

impl McpError {
    /// Creates a [`McpError::Handler`].
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Returns the taxonomy bucket for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Handler { .. } => ErrorKind::Execution,
            Self::Rpc { code, .. } => match *code {
                INVALID_PARAMS => ErrorKind::Validation,
                INTERNAL_ERROR => ErrorKind::Execution,
                _ => ErrorKind::Protocol,
            },
            Self::ConnectionClosed | Self::Serialization { .. } => ErrorKind::Protocol,
        }
    }
}

impl From<JsonRpcError> for McpError {
    fn from(error: JsonRpcError) -> Self {
        Self::Rpc {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

/// Result alias for MCP operations.
pub type McpResult<T> = Result<T, McpError>;
