//! Error types for the sandbox and for code running inside it.

use agent_policy::PolicyError;
use agent_primitives::ErrorKind;
use thiserror::Error;

use crate::{ErrorCode, SandboxState};

/// Fatal sandbox failures.
///
/// Faults inside agent code never produce these; they are folded into an
/// [`crate::ExecutionResult`]. These cover misuse of the sandbox itself and
/// policies that cannot be honoured.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Operation is not allowed from the current state.
    #[error("cannot {operation} a sandbox in state {state:?}")]
    InvalidState {
        /// State at the time of the call.
        state: SandboxState,
        /// Attempted operation.
        operation: &'static str,
    },
    /// The security policy failed validation during initialization.
    #[error(transparent)]
    Policy {
        /// Underlying policy error.
        #[from]
        source: PolicyError,
    },
    /// A native handler name collided with an existing registration.
    #[error("capability handler `{name}` is already registered")]
    DuplicateHandler {
        /// Name of the offending handler.
        name: String,
    },
}

impl SandboxError {
    /// Returns the taxonomy bucket for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState { .. } => ErrorKind::Execution,
            Self::Policy { source } => source.kind(),
            Self::DuplicateHandler { .. } => ErrorKind::Validation,
        }
    }
}

/// Result alias for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Fault raised by agent code or by the host surface it calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScriptError {
    /// Agent code failed.
    #[error("{message}")]
    Execution {
        /// Human-readable failure.
        message: String,
        /// Optional trace supplied by the engine.
        stack: Option<String>,
    },
    /// Source text failed the engine's syntax check.
    #[error("syntax error on line {line}: {message}")]
    Syntax {
        /// 1-based line of the fault.
        line: usize,
        /// What was wrong.
        message: String,
    },
    /// A reservation would exceed the memory ceiling.
    #[error("memory limit exceeded: {requested} bytes requested with {used} of {limit} bytes in use")]
    MemoryLimit {
        /// Bytes requested.
        requested: usize,
        /// Bytes already in use.
        used: usize,
        /// Ceiling in bytes.
        limit: usize,
    },
    /// The network filter rejected a call.
    #[error("network access denied: {reason}")]
    NetworkDenied {
        /// Why the call was rejected.
        reason: String,
    },
    /// The engine has no implementation for the capability.
    #[error("capability `{name}` has no implementation")]
    UnknownCapability {
        /// Requested capability.
        name: String,
    },
}

impl ScriptError {
    /// Creates an execution error from the supplied message.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            stack: None,
        }
    }

    /// Returns the result code reported to callers.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Execution { .. } | Self::UnknownCapability { .. } => ErrorCode::ExecutionError,
            Self::Syntax { .. } => ErrorCode::SyntaxError,
            Self::MemoryLimit { .. } => ErrorCode::MemoryLimitExceeded,
            Self::NetworkDenied { .. } => ErrorCode::NetworkDenied,
        }
    }

    pub(crate) fn stack(&self) -> Option<String> {
        match self {
            Self::Execution { stack, .. } => stack.clone(),
            _ => None,
        }
    }
}

/// Result alias for agent code.
pub type ScriptResult<T> = Result<T, ScriptError>;
