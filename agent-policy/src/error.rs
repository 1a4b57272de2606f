//! Errors surfaced by the security subsystem.

use agent_primitives::{ErrorKind, ThreatId, UserId};
use thiserror::Error;

use crate::Permission;

/// Errors surfaced by policy validation and permission checks.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The policy requested something that is never allowed.
    #[error("security policy rejected: {}", violations.join("; "))]
    Violation {
        /// Every hard deny that applied.
        violations: Vec<String>,
    },
    /// The user lacks the requested grant.
    #[error("user `{user_id}` lacks permission `{permission}`")]
    PermissionDenied {
        /// User that was checked.
        user_id: UserId,
        /// Missing permission.
        permission: Permission,
    },
    /// The user exceeded one of their resource limits.
    #[error("quota exceeded for user `{user_id}`: {reason}")]
    QuotaExceeded {
        /// User whose quota was hit.
        user_id: UserId,
        /// Which limit was hit.
        reason: String,
    },
    /// No threat with the supplied id exists.
    #[error("threat {id} not found")]
    ThreatNotFound {
        /// Missing threat id.
        id: ThreatId,
    },
}

impl PolicyError {
    /// Returns the taxonomy bucket for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Violation { .. } => ErrorKind::Security,
            Self::PermissionDenied { .. } | Self::QuotaExceeded { .. } => ErrorKind::Permission,
            Self::ThreatNotFound { .. } => ErrorKind::NotFound,
        }
    }
}

/// Result alias for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;
