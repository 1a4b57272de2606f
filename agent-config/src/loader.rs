//! Layered configuration loading: defaults, TOML file, environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::ExchangeConfig;

/// Prefix recognised for environment overrides.
pub const ENV_PREFIX: &str = "AGENT_EXCHANGE_";

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read config file `{path}`: {source}")]
    Io {
        /// Path that failed to load.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Configuration file was not valid TOML for the schema.
    #[error("failed to parse config file: {source}")]
    Parse {
        /// Underlying TOML error.
        #[from]
        source: toml::de::Error,
    },
    /// An environment override carried an unparseable value.
    #[error("invalid value `{value}` for {key}")]
    InvalidOverride {
        /// Environment key.
        key: String,
        /// Offending value.
        value: String,
    },
    /// The merged configuration is unusable.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Builds an [`ExchangeConfig`] from defaults, an optional file, and env vars.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    overrides: BTreeMap<String, String>,
}

impl ConfigLoader {
    /// Creates a loader that starts from defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the given TOML file before applying overrides.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Captures `AGENT_EXCHANGE_*` variables from the process environment.
    #[must_use]
    pub fn with_process_env(self) -> Self {
        self.with_overrides(std::env::vars())
    }

    /// Adds explicit key/value overrides. Keys without the prefix are ignored.
    #[must_use]
    pub fn with_overrides<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let key = key.into();
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                self.overrides.insert(stripped.to_owned(), value.into());
            }
        }
        self
    }

    /// Produces the merged, validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed, an
    /// override is malformed, or validation fails.
    pub fn load(&self) -> ConfigResult<ExchangeConfig> {
        let mut config = match &self.file {
            Some(path) => read_file(path)?,
            None => ExchangeConfig::default(),
        };

        for (key, value) in &self.overrides {
            apply_override(&mut config, key, value)?;
        }

        validate(&config)?;
        Ok(config)
    }
}

fn read_file(path: &Path) -> ConfigResult<ExchangeConfig> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "loaded exchange config file");
    Ok(toml::from_str(&text)?)
}

fn apply_override(config: &mut ExchangeConfig, key: &str, value: &str) -> ConfigResult<()> {
    match key {
        "MAX_CONCURRENT_EXECUTIONS" => {
            config.runtime.max_concurrent_executions = parse(key, value)?;
        }
        "QUEUE_SWEEP_INTERVAL_MS" => config.runtime.queue_sweep_interval_ms = parse(key, value)?,
        "DEFAULT_TIMEOUT_MS" => config.runtime.default_timeout_ms = parse(key, value)?,
        "SANDBOX_MEMORY_CEILING_MB" => config.sandbox.memory_ceiling_mb = parse(key, value)?,
        "MCP_REQUEST_TIMEOUT_MS" => config.mcp.request_timeout_ms = parse(key, value)?,
        "AUDIT_RETENTION_DAYS" => config.audit.retention_days = parse(key, value)?,
        "LOG_LEVEL" => config.telemetry.log_level = value.to_owned(),
        "LOG_JSON" => config.telemetry.json = parse(key, value)?,
        other => debug!(key = other, "ignoring unknown config override"),
    }
    Ok(())
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidOverride {
            key: format!("{ENV_PREFIX}{key}"),
            value: value.to_owned(),
        })
}

fn validate(config: &ExchangeConfig) -> ConfigResult<()> {
    if config.runtime.max_concurrent_executions == 0 {
        return Err(ConfigError::Invalid(
            "max_concurrent_executions must be greater than zero",
        ));
    }
    if config.runtime.queue_sweep_interval_ms == 0 {
        return Err(ConfigError::Invalid(
            "queue_sweep_interval_ms must be greater than zero",
        ));
    }
    if config.runtime.default_timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "default_timeout_ms must be greater than zero",
        ));
    }
    if config.sandbox.memory_ceiling_mb == 0 {
        return Err(ConfigError::Invalid(
            "memory_ceiling_mb must be greater than zero",
        ));
    }
    if config.mcp.request_timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "request_timeout_ms must be greater than zero",
        ));
    }
    Ok(())
}
