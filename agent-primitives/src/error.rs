//! Shared error definitions for agent primitives.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Error as UuidError;

/// Result alias used throughout the agent primitives.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification every subsystem error maps into.
///
/// API layers translate these into caller-visible codes; the runtime crates
/// only promise that each of their errors reports one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad metadata, policy, or input.
    Validation,
    /// Missing grant or ownership.
    Permission,
    /// Unknown agent, instance, tool, resource, or prompt.
    NotFound,
    /// Execution or RPC deadline exceeded.
    Timeout,
    /// Fault raised by agent code.
    Execution,
    /// Malformed message or unsupported method.
    Protocol,
    /// Blocked code pattern or policy violation.
    Security,
}

/// Errors that can occur while manipulating agent primitive types.
#[derive(Debug, Error)]
pub enum Error {
    /// The provided identifier could not be parsed.
    #[error("invalid identifier: {source}")]
    InvalidId {
        /// Source parsing error from the UUID library.
        #[from]
        source: UuidError,
    },

    /// Capability identifier failed validation.
    #[error("invalid capability id `{id}`: {reason}")]
    InvalidCapabilityId {
        /// The offending identifier string.
        id: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Capability definition failed validation.
    #[error("invalid capability: {reason}")]
    InvalidCapability {
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Agent metadata failed validation.
    #[error("invalid agent metadata: {reason}")]
    InvalidMetadata {
        /// Human-readable reason for rejection.
        reason: String,
    },
}

impl Error {
    /// Returns the taxonomy bucket for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}
