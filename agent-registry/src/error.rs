//! Errors surfaced by the registry and its storage collaborator.

use agent_policy::PolicyError;
use agent_primitives::{AgentId, ErrorKind, UserId};
use thiserror::Error;

/// Errors surfaced by [`crate::AgentRegistry`] and [`crate::AgentStore`].
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Metadata or request shape failed validation.
    #[error("invalid {field}: {reason}")]
    Validation {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
    /// Code exceeds the publish size ceiling.
    #[error("code is {size} bytes, limit is {limit}")]
    CodeTooLarge {
        /// Submitted size.
        size: usize,
        /// Ceiling.
        limit: usize,
    },
    /// Code failed the engine's syntax check.
    #[error("syntax error on line {line}: {message}")]
    Syntax {
        /// 1-based line.
        line: usize,
        /// Parser message.
        message: String,
    },
    /// Code contains a construct that is never publishable.
    #[error("code contains blocked pattern `{pattern}`")]
    BlockedPattern {
        /// Pattern label.
        pattern: &'static str,
    },
    /// No agent has this id.
    #[error("agent {id} not found")]
    AgentNotFound {
        /// Missing agent.
        id: AgentId,
    },
    /// An agent with this id already exists.
    #[error("agent {id} already exists")]
    AlreadyExists {
        /// Conflicting agent.
        id: AgentId,
    },
    /// The caller may not perform the action on this agent.
    #[error("user `{user_id}` may not {action} agent {agent_id}")]
    NotAuthor {
        /// Target agent.
        agent_id: AgentId,
        /// Calling user.
        user_id: UserId,
        /// Attempted action.
        action: &'static str,
    },
    /// Review rating outside 1..=5.
    #[error("rating {rating} is outside 1..=5")]
    InvalidRating {
        /// Submitted rating.
        rating: u8,
    },
    /// Permission check failed.
    #[error(transparent)]
    Policy {
        /// Underlying policy error.
        #[from]
        source: PolicyError,
    },
}

impl RegistryError {
    /// Returns the taxonomy bucket for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. }
            | Self::CodeTooLarge { .. }
            | Self::Syntax { .. }
            | Self::AlreadyExists { .. }
            | Self::InvalidRating { .. } => ErrorKind::Validation,
            Self::BlockedPattern { .. } => ErrorKind::Security,
            Self::AgentNotFound { .. } => ErrorKind::NotFound,
            Self::NotAuthor { .. } => ErrorKind::Permission,
            Self::Policy { source } => source.kind(),
        }
    }

    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }
}

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
