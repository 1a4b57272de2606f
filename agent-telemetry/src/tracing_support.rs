//! Structured tracing bootstrap.

use agent_config::TelemetrySettings;
use tracing_subscriber::EnvFilter;

use crate::TracingInitError;

/// Installs the global `fmt` subscriber.
///
/// `RUST_LOG` wins over `settings.log_level` when set. JSON lines are
/// emitted when `settings.json` is true.
///
/// # Errors
///
/// Fails when the filter directive is invalid or a global subscriber is
/// already installed.
pub fn init_tracing(settings: &TelemetrySettings) -> Result<(), TracingInitError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .map_err(|err| TracingInitError {
            message: err.to_string(),
        })?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| TracingInitError {
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_reported() {
        let settings = TelemetrySettings::default();
        let _ = init_tracing(&settings);
        assert!(init_tracing(&settings).is_err());
    }

    #[test]
    fn bad_directive_is_rejected_without_rust_log() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let settings = TelemetrySettings {
            log_level: "info,[".into(),
            json: false,
        };
        assert!(init_tracing(&settings).is_err());
    }
}
