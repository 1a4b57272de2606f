//! Audit logging and observability for the agent exchange.
//!
//! [`AuditService`] persists [`AuditLogEntry`] records through an
//! [`AuditStore`], raises [`AuditSignal`]s inline, and derives summaries,
//! anomalies and exports. [`init_tracing`] installs the process-wide
//! subscriber.

#![warn(missing_docs, clippy::pedantic)]

pub mod audit;
mod error;
pub mod tracing_support;

pub use audit::{
    ActivitySummary, Anomaly, AnomalyKind, AuditFilter, AuditLogEntry, AuditOutcome,
    AuditService, AuditSignal, AuditStore, CountEntry, ExportFormat, InMemoryAuditStore,
    NewAuditEntry,
};
pub use error::{AuditError, AuditResult, TracingInitError};
pub use tracing_support::init_tracing;
