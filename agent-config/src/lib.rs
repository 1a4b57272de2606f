//! Configuration management for the agent exchange.
//!
//! [`ExchangeConfig`] is the strongly typed schema; [`ConfigLoader`] layers an
//! optional TOML file and `AGENT_EXCHANGE_*` environment overrides on top of
//! the defaults.

#![warn(missing_docs, clippy::pedantic)]

mod loader;
mod schema;

pub use loader::{ConfigError, ConfigLoader, ConfigResult, ENV_PREFIX};
pub use schema::{
    AuditSettings, ExchangeConfig, McpSettings, RuntimeSettings, SandboxSettings,
    TelemetrySettings,
};
