//! Sandboxed execution of agent capabilities.
//!
//! Every invocation gets a brand-new [`Sandbox`] from a [`SandboxFactory`].
//! The sandbox validates its [`agent_policy::SecurityPolicy`], allocates an
//! isolated [`SandboxHost`] (log capture, bounded timer, memory accounting,
//! filtered environment and an optional filtered network call), runs the code
//! through a [`ScriptEngine`] under a hard wall-clock timeout, and always
//! returns an [`ExecutionResult`]. Only misuse of the sandbox itself surfaces
//! as a [`SandboxError`].

#![warn(missing_docs, clippy::pedantic)]

pub mod engine;
pub mod error;
pub mod host;
pub mod network;
pub mod result;
pub mod sandbox;
mod syntax;

pub use engine::{CapabilityHandler, NativeEngine, ScriptEngine, ScriptInvocation};
pub use error::{SandboxError, SandboxResult, ScriptError, ScriptResult};
pub use host::SandboxHost;
pub use network::{NetworkClient, NetworkRequest, NetworkResponse};
pub use result::{
    ErrorCode, ExecutionContext, ExecutionError, ExecutionMetadata, ExecutionResult, LogLevel,
    LogRecord,
};
pub use sandbox::{DEFAULT_MEMORY_CEILING_MB, Sandbox, SandboxFactory, SandboxState};
