//! Audit records.

use std::fmt;

use agent_primitives::{AuditId, RiskLevel, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How an audited action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Completed.
    Success,
    /// Attempted and failed.
    Failure,
    /// Refused by policy before it ran.
    Blocked,
}

impl AuditOutcome {
    /// Lowercase label used in exports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored audit record. Records are append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Record id.
    pub id: AuditId,
    /// When the action happened.
    pub timestamp: DateTime<Utc>,
    /// Acting user.
    pub user_id: UserId,
    /// Dotted action name, e.g. `agent.publish` or `auth.login`.
    pub action: String,
    /// Kind of resource acted on.
    pub resource_type: String,
    /// Resource id, when there is one.
    pub resource_id: Option<String>,
    /// How the action ended.
    pub outcome: AuditOutcome,
    /// Risk classification.
    pub risk_level: RiskLevel,
    /// Free-form context.
    pub details: Value,
    /// Origin fingerprint such as a client address.
    pub origin: Option<String>,
}

impl AuditLogEntry {
    /// Whether the action name marks an authentication attempt.
    #[must_use]
    pub fn is_auth_action(&self) -> bool {
        self.action.starts_with("auth.") || self.action.starts_with("login")
    }
}

/// Input to [`crate::AuditService::log`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    user_id: UserId,
    action: String,
    resource_type: String,
    resource_id: Option<String>,
    outcome: AuditOutcome,
    risk_level: RiskLevel,
    details: Value,
    origin: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

impl NewAuditEntry {
    /// Starts a successful, low-risk record.
    pub fn new(
        user_id: impl Into<UserId>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: None,
            outcome: AuditOutcome::Success,
            risk_level: RiskLevel::Low,
            details: Value::Null,
            origin: None,
            timestamp: None,
        }
    }

    /// Sets the resource id.
    #[must_use]
    pub fn resource_id(mut self, id: impl ToString) -> Self {
        self.resource_id = Some(id.to_string());
        self
    }

    /// Sets the outcome.
    #[must_use]
    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Sets the risk level.
    #[must_use]
    pub fn risk(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    /// Attaches context.
    #[must_use]
    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Sets the origin fingerprint.
    #[must_use]
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Backdates the record. Defaults to the time of logging.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub(crate) fn into_entry(self) -> AuditLogEntry {
        AuditLogEntry {
            id: AuditId::random(),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            user_id: self.user_id,
            action: self.action,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            outcome: self.outcome,
            risk_level: self.risk_level,
            details: self.details,
            origin: self.origin,
        }
    }
}
