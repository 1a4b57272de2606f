//! Errors surfaced by [`crate::AgentExchange`].

use agent_kernel::RuntimeError;
use agent_mcp::McpError;
use agent_primitives::{ErrorKind, InstanceId};
use agent_registry::RegistryError;
use agent_telemetry::AuditError;
use thiserror::Error;

/// Failure of a cross-component exchange operation.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Runtime manager failure.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    /// Registry or discovery failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// MCP failure.
    #[error(transparent)]
    Mcp(#[from] McpError),
    /// Audit failure.
    #[error(transparent)]
    Audit(#[from] AuditError),
    /// The instance is not live.
    #[error("instance {id} not found")]
    InstanceNotFound {
        /// Requested instance.
        id: InstanceId,
    },
}

impl ExchangeError {
    /// Returns the taxonomy bucket for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Runtime(err) => err.kind(),
            Self::Registry(err) => err.kind(),
            Self::Mcp(err) => err.kind(),
            Self::Audit(err) => err.kind(),
            Self::InstanceNotFound { .. } => ErrorKind::NotFound,
        }
    }
}

/// Result alias for exchange operations.
pub type ExchangeResult<T> = Result<T, ExchangeError>;
