//! Runtime manager configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

use agent_config::RuntimeSettings;

use crate::{RuntimeError, RuntimeResult};

const DEFAULT_MAX_CONCURRENT_EXECUTIONS: NonZeroUsize = NonZeroUsize::MIN.saturating_add(9);

/// Admission and scheduling settings for [`crate::RuntimeManager`].
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    max_concurrent_executions: NonZeroUsize,
    queue_sweep_interval: Duration,
    default_timeout: Duration,
}

impl RuntimeConfig {
    /// Creates a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] when either duration is zero.
    pub fn new(
        max_concurrent_executions: NonZeroUsize,
        queue_sweep_interval: Duration,
        default_timeout: Duration,
    ) -> RuntimeResult<Self> {
        if queue_sweep_interval.is_zero() {
            return Err(RuntimeError::InvalidConfig(
                "queue sweep interval must be greater than zero",
            ));
        }
        if default_timeout.is_zero() {
            return Err(RuntimeError::InvalidConfig(
                "default timeout must be greater than zero",
            ));
        }
        Ok(Self {
            max_concurrent_executions,
            queue_sweep_interval,
            default_timeout,
        })
    }

    /// Builds a configuration from loaded settings.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] for zero values.
    pub fn from_settings(settings: &RuntimeSettings) -> RuntimeResult<Self> {
        let max = NonZeroUsize::new(settings.max_concurrent_executions).ok_or(
            RuntimeError::InvalidConfig("max concurrent executions must be greater than zero"),
        )?;
        Self::new(
            max,
            settings.queue_sweep_interval(),
            settings.default_timeout(),
        )
    }

    /// Returns a copy with a different concurrency ceiling.
    #[must_use]
    pub const fn with_max_concurrent_executions(mut self, max: NonZeroUsize) -> Self {
        self.max_concurrent_executions = max;
        self
    }

    /// Global ceiling on simultaneously running executions.
    #[must_use]
    pub const fn max_concurrent_executions(self) -> NonZeroUsize {
        self.max_concurrent_executions
    }

    /// Interval between queue sweeps.
    #[must_use]
    pub const fn queue_sweep_interval(self) -> Duration {
        self.queue_sweep_interval
    }

    /// Timeout used when the agent declares none.
    #[must_use]
    pub const fn default_timeout(self) -> Duration {
        self.default_timeout
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: DEFAULT_MAX_CONCURRENT_EXECUTIONS,
            queue_sweep_interval: Duration::from_millis(100),
            default_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_settings_rejects_zero() {
        let settings = RuntimeSettings {
            max_concurrent_executions: 0,
            ..RuntimeSettings::default()
        };
        assert!(RuntimeConfig::from_settings(&settings).is_err());

        let config = RuntimeConfig::from_settings(&RuntimeSettings::default()).unwrap();
        assert_eq!(config.max_concurrent_executions().get(), 10);
        assert_eq!(config.queue_sweep_interval(), Duration::from_millis(100));
    }

    #[test]
    fn default_matches_default_settings() {
        let config = RuntimeConfig::default();
        let settings = RuntimeSettings::default();
        assert_eq!(
            config.max_concurrent_executions().get(),
            settings.max_concurrent_executions
        );
        assert_eq!(config.max_concurrent_executions().get(), 10);
        assert_eq!(config.default_timeout(), Duration::from_secs(30));
    }
}
