//! Agent execution runtime and marketplace.
//!
//! This crate bundles the exchange components behind feature flags so
//! embedders can pull in only what they need. With the `kernel`, `registry`,
//! `mcp` and `telemetry` features enabled (the default), [`AgentExchange`]
//! wires them together: catalog installs feed the runtime, instances can be
//! exposed as MCP tool servers, and runtime, registry and security signals
//! land in the audit log.

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared primitives for convenience.
pub use agent_primitives as primitives;

/// Configuration schema and loader (enabled by `config` feature).
#[cfg(feature = "config")]
pub use agent_config as config;

/// Security policy, code analysis and threats (enabled by `policy` feature).
#[cfg(feature = "policy")]
pub use agent_policy as policy;

/// Sandboxed executor (enabled by `sandbox` feature).
#[cfg(feature = "sandbox")]
pub use agent_sandbox as sandbox;

/// Instance runtime and admission control (enabled by `kernel` feature).
#[cfg(feature = "kernel")]
pub use agent_kernel as kernel;

/// Agent catalog and discovery (enabled by `registry` feature).
#[cfg(feature = "registry")]
pub use agent_registry as registry;

/// MCP server, client and transport (enabled by `mcp` feature).
#[cfg(feature = "mcp")]
pub use agent_mcp as mcp;

/// Audit log and tracing bootstrap (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use agent_telemetry as telemetry;

#[cfg(all(feature = "kernel", feature = "registry", feature = "mcp", feature = "telemetry"))]
mod bridge;
#[cfg(all(feature = "kernel", feature = "registry", feature = "mcp", feature = "telemetry"))]
mod error;
#[cfg(all(feature = "kernel", feature = "registry", feature = "mcp", feature = "telemetry"))]
mod exchange;
#[cfg(all(feature = "kernel", feature = "registry", feature = "mcp", feature = "telemetry"))]
mod tools;

#[cfg(all(feature = "kernel", feature = "registry", feature = "mcp", feature = "telemetry"))]
pub use bridge::SYSTEM_ACTOR;
#[cfg(all(feature = "kernel", feature = "registry", feature = "mcp", feature = "telemetry"))]
pub use error::{ExchangeError, ExchangeResult};
#[cfg(all(feature = "kernel", feature = "registry", feature = "mcp", feature = "telemetry"))]
pub use exchange::{AgentExchange, AgentExchangeBuilder};
#[cfg(all(feature = "kernel", feature = "registry", feature = "mcp", feature = "telemetry"))]
pub use tools::{instance_resource_uri, instance_server};
