//! Structured audit records and the heuristics run over them.

mod entry;
mod report;
mod service;
mod store;

pub use entry::{AuditLogEntry, AuditOutcome, NewAuditEntry};
pub use report::{
    ActivitySummary, Anomaly, AnomalyKind, AuditSignal, CountEntry, DAY, ORIGIN_THRESHOLD,
    RAPID_FAILURE_THRESHOLD, RAPID_FAILURE_WINDOW,
};
pub use service::{AuditService, ExportFormat};
pub use store::{AuditFilter, AuditStore, InMemoryAuditStore};
