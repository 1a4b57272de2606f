//! Errors surfaced by the runtime manager.

use agent_policy::PolicyError;
use agent_primitives::{ErrorKind, InstanceId, UserId};
use thiserror::Error;

use crate::{InstanceStatus, TransitionError};

/// Errors surfaced by [`crate::RuntimeManager`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No live instance has this id.
    #[error("instance {id} not found")]
    InstanceNotFound {
        /// Missing instance.
        id: InstanceId,
    },
    /// The agent does not advertise the requested capability.
    #[error("capability `{capability}` not found on instance {instance_id}")]
    CapabilityNotFound {
        /// Target instance.
        instance_id: InstanceId,
        /// Requested capability.
        capability: String,
    },
    /// The instance cannot accept executions right now.
    #[error("instance {id} is {status:?} and cannot execute")]
    NotExecutable {
        /// Target instance.
        id: InstanceId,
        /// Its status.
        status: InstanceStatus,
    },
    /// The caller does not own the instance.
    #[error("user `{user_id}` does not own instance {id}")]
    NotOwner {
        /// Target instance.
        id: InstanceId,
        /// Calling user.
        user_id: UserId,
    },
    /// Permission, quota or policy failure.
    #[error(transparent)]
    Policy {
        /// Underlying policy error.
        #[from]
        source: PolicyError,
    },
    /// Status change not permitted.
    #[error(transparent)]
    Transition {
        /// Underlying transition error.
        #[from]
        source: TransitionError,
    },
    /// Runtime configuration is invalid.
    #[error("invalid runtime configuration: {0}")]
    InvalidConfig(&'static str),
    /// The manager was shut down.
    #[error("runtime manager has shut down")]
    ShutDown,
}

impl RuntimeError {
    /// Returns the taxonomy bucket for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InstanceNotFound { .. } | Self::CapabilityNotFound { .. } => ErrorKind::NotFound,
            Self::NotExecutable { .. } | Self::Transition { .. } | Self::InvalidConfig(_) => {
                ErrorKind::Validation
            }
            Self::NotOwner { .. } => ErrorKind::Permission,
            Self::Policy { source } => source.kind(),
            Self::ShutDown => ErrorKind::Execution,
        }
    }
}

/// Result alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
