//! Errors raised by the audit service and tracing bootstrap.

use std::path::PathBuf;

use agent_primitives::ErrorKind;
use thiserror::Error;

/// Errors surfaced by [`crate::AuditService`] and [`crate::AuditStore`]
/// implementations.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The backing store failed.
    #[error("audit store failure: {message}")]
    Store {
        /// Store-provided description.
        message: String,
    },
    /// Writing an export file failed.
    #[error("failed to write `{path}`: {source}")]
    Io {
        /// Target file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// CSV encoding failed.
    #[error("csv export failed: {message}")]
    Csv {
        /// Encoder message.
        message: String,
    },
    /// JSON encoding failed.
    #[error("json export failed: {source}")]
    Json {
        /// Underlying encoder error.
        #[from]
        source: serde_json::Error,
    },
}

impl AuditError {
    /// Creates an [`AuditError::Store`].
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Returns the taxonomy bucket for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store { .. } | Self::Io { .. } => ErrorKind::Execution,
            Self::Csv { .. } | Self::Json { .. } => ErrorKind::Protocol,
        }
    }
}

impl From<csv::Error> for AuditError {
    fn from(error: csv::Error) -> Self {
        Self::Csv {
            message: error.to_string(),
        }
    }
}

/// Result alias for audit operations.
pub type AuditResult<T> = Result<T, AuditError>;

/// The global tracing subscriber could not be installed.
#[derive(Debug, Error)]
#[error("failed to initialise tracing: {message}")]
pub struct TracingInitError {
    /// Subscriber or filter message.
    pub message: String,
}
