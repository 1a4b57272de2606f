//! Core shared types for the agent exchange.
//!
//! Everything here is plain data: identifiers, capability and metadata
//! descriptors, the shared [`RiskLevel`] scale, and the [`ErrorKind`]
//! taxonomy every subsystem error maps into.

#![warn(missing_docs, clippy::pedantic)]

mod capability;
mod error;
mod ids;
mod manifest;
mod risk;

/// Capability descriptors and supporting builders.
pub use capability::{AgentCapability, AgentCapabilityBuilder, CapabilityId};
/// Error type, result alias, and the cross-crate error taxonomy.
pub use error::{Error, ErrorKind, Result};
/// Unique identifiers used across the exchange.
pub use ids::{AgentId, AuditId, InstanceId, RequestId, ReviewId, ThreatId, UserId};
/// Published agent metadata.
pub use manifest::{AgentMetadata, AgentMetadataBuilder, ResourceDefaults};
/// Shared low/medium/high/critical classification.
pub use risk::RiskLevel;
