//! Runtime manager for the agent exchange.
//!
//! [`RuntimeManager`] owns agent instances, enforces a global concurrency
//! ceiling with a FIFO wait queue, and runs every capability call in a fresh
//! sandbox from [`agent_sandbox`]. Lifecycle signals go out on a broadcast bus
//! as [`RuntimeEvent`]s.

#![warn(missing_docs, clippy::pedantic)]

mod admission;
mod config;
mod error;
mod events;
mod instance;
mod manager;

pub use config::RuntimeConfig;
pub use error::{RuntimeError, RuntimeResult};
pub use events::RuntimeEvent;
pub use instance::{AgentInstance, InstanceEvent, InstanceStatus, ResourceSnapshot, TransitionError};
pub use manager::{
    CreateInstanceRequest, ExecutionRequest, RuntimeManager, RuntimeManagerBuilder, RuntimeStats,
};
