//! Audit persistence seam.

use agent_primitives::RiskLevel;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::entry::{AuditLogEntry, AuditOutcome};
use crate::AuditResult;

/// Selects audit records. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    /// Exact acting user.
    pub user_id: Option<String>,
    /// Action name prefix.
    pub action_prefix: Option<String>,
    /// Exact outcome.
    pub outcome: Option<AuditOutcome>,
    /// Lowest risk level included.
    pub min_risk: Option<RiskLevel>,
    /// Inclusive lower time bound.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper time bound.
    pub until: Option<DateTime<Utc>>,
    /// Maximum records returned, newest first.
    pub limit: Option<usize>,
}

impl AuditFilter {
    /// Records at or after `since`.
    #[must_use]
    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            ..Self::default()
        }
    }

    /// Restricts to one user.
    #[must_use]
    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Restricts to one outcome.
    #[must_use]
    pub fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Whether `entry` passes every set criterion.
    #[must_use]
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.user_id.as_ref().is_none_or(|user| *user == entry.user_id)
            && self
                .action_prefix
                .as_ref()
                .is_none_or(|prefix| entry.action.starts_with(prefix.as_str()))
            && self.outcome.is_none_or(|outcome| outcome == entry.outcome)
            && self.min_risk.is_none_or(|risk| entry.risk_level >= risk)
            && self.since.is_none_or(|since| entry.timestamp >= since)
            && self.until.is_none_or(|until| entry.timestamp < until)
    }
}

/// Storage for audit records.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Appends one record.
    async fn append(&self, entry: AuditLogEntry) -> AuditResult<()>;

    /// Returns matching records, newest first.
    async fn query(&self, filter: &AuditFilter) -> AuditResult<Vec<AuditLogEntry>>;

    /// Deletes records older than `before` whose risk is at most `max_risk`.
    /// Returns how many were removed.
    async fn purge(&self, before: DateTime<Utc>, max_risk: RiskLevel) -> AuditResult<usize>;
}

/// Process-local [`AuditStore`].
#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    entries: RwLock<Vec<AuditLogEntry>>,
}

impl InMemoryAuditStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, entry: AuditLogEntry) -> AuditResult<()> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn query(&self, filter: &AuditFilter) -> AuditResult<Vec<AuditLogEntry>> {
        let entries = self.entries.read().await;
        let mut matched: Vec<_> = entries
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn purge(&self, before: DateTime<Utc>, max_risk: RiskLevel) -> AuditResult<usize> {
        let mut entries = self.entries.write().await;
        let original = entries.len();
        entries.retain(|entry| entry.timestamp >= before || entry.risk_level > max_risk);
        Ok(original - entries.len())
    }
}
