//! Security policy evaluation for the agent exchange.
//!
//! [`validate_policy`] applies the hard resource/network denies,
//! [`CodeAnalyzer`] scores source text against a configurable rule table, and
//! [`SecurityManager`] owns user permissions, threat records, and the
//! security signal bus.

#![warn(missing_docs, clippy::pedantic)]

pub mod analyzer;
pub mod decision;
pub mod error;
pub mod events;
pub mod manager;
pub mod permissions;
pub mod policy;
pub mod threats;

pub use analyzer::{AnalysisRule, CodeAnalysis, CodeAnalyzer, CodeIssue, IssueCategory};
pub use decision::{DenyRule, NetworkDecision};
pub use error::{PolicyError, PolicyResult};
pub use events::SecurityEvent;
pub use manager::{SecurityAuditRecord, SecurityManager, SecurityMetrics};
pub use permissions::{Permission, ResourceLimits, UserPermission};
pub use policy::{
    IsolationFlags, NetworkPolicy, ResourceCeilings, SecurityPolicy, validate_policy,
};
pub use threats::{NewThreat, ResponseAction, ThreatDetection, ThreatType};
