//! Strongly typed configuration schema.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for an exchange process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Runtime manager settings.
    pub runtime: RuntimeSettings,
    /// Sandbox settings.
    pub sandbox: SandboxSettings,
    /// MCP client/server settings.
    pub mcp: McpSettings,
    /// Audit retention settings.
    pub audit: AuditSettings,
    /// Logging settings.
    pub telemetry: TelemetrySettings,
}

/// Admission control and scheduling knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Global ceiling on simultaneously running executions.
    pub max_concurrent_executions: usize,
    /// Interval between queue sweeps, in milliseconds.
    pub queue_sweep_interval_ms: u64,
    /// Timeout applied when neither the call nor the agent sets one.
    pub default_timeout_ms: u64,
}

impl RuntimeSettings {
    /// Queue sweep interval as a [`Duration`].
    #[must_use]
    pub const fn queue_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.queue_sweep_interval_ms)
    }

    /// Default execution timeout as a [`Duration`].
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 10,
            queue_sweep_interval_ms: 100,
            default_timeout_ms: 30_000,
        }
    }
}

/// Sandbox resource ceilings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Hard memory ceiling for every sandbox, in megabytes.
    pub memory_ceiling_mb: u32,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            memory_ceiling_mb: 128,
        }
    }
}

/// MCP protocol settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpSettings {
    /// Per-request client timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Protocol version advertised during the handshake.
    pub protocol_version: String,
}

impl McpSettings {
    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            protocol_version: "2024-11-05".into(),
        }
    }
}

/// Audit log retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// Days to keep low and medium risk records.
    pub retention_days: u32,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self { retention_days: 90 }
    }
}

/// Logging output configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            json: false,
        }
    }
}
