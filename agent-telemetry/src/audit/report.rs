//! Summaries, anomalies and heuristic signals derived from audit records.

use std::collections::{BTreeMap, HashMap};

use agent_primitives::{AuditId, RiskLevel, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entry::{AuditLogEntry, AuditOutcome};

/// Failures by one user within [`RAPID_FAILURE_WINDOW`] that raise
/// [`AuditSignal::RapidFailures`].
pub const RAPID_FAILURE_THRESHOLD: usize = 5;
/// Window for the rapid-failure heuristic.
pub const RAPID_FAILURE_WINDOW: std::time::Duration = std::time::Duration::from_secs(5 * 60);
/// Distinct origins above which [`AuditSignal::MultipleOrigins`] fires.
pub const ORIGIN_THRESHOLD: usize = 5;
/// Window for the origin heuristic and anomaly scans.
pub const DAY: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// Raised inline by [`crate::AuditService::log`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditSignal {
    /// A user failed repeatedly in a short window.
    RapidFailures {
        /// Offending user.
        user_id: UserId,
        /// Failures in the window.
        failures: usize,
    },
    /// A high or critical risk action was recorded.
    HighRiskAction {
        /// Triggering record.
        entry_id: AuditId,
        /// Acting user.
        user_id: UserId,
        /// Action name.
        action: String,
        /// Recorded risk.
        risk_level: RiskLevel,
    },
    /// A user acted from too many origins in a day.
    MultipleOrigins {
        /// Offending user.
        user_id: UserId,
        /// Distinct origins seen.
        origins: usize,
    },
}

/// Name and occurrence count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountEntry {
    /// Counted value.
    pub name: String,
    /// Occurrences.
    pub count: usize,
}

/// Aggregate view over a time window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySummary {
    /// Records in the window.
    pub total: usize,
    /// Successful actions.
    pub success: usize,
    /// Failed actions.
    pub failure: usize,
    /// Blocked actions.
    pub blocked: usize,
    /// Records per risk level. Every level is present.
    pub by_risk: BTreeMap<RiskLevel, usize>,
    /// Ten most frequent actions.
    pub top_actions: Vec<CountEntry>,
    /// Ten most active users.
    pub top_users: Vec<CountEntry>,
}

impl ActivitySummary {
    pub(crate) fn from_entries(entries: &[AuditLogEntry]) -> Self {
        let mut summary = Self {
            total: entries.len(),
            by_risk: RiskLevel::ALL.iter().map(|level| (*level, 0)).collect(),
            ..Self::default()
        };
        let mut actions: HashMap<&str, usize> = HashMap::new();
        let mut users: HashMap<&str, usize> = HashMap::new();
        for entry in entries {
            match entry.outcome {
                AuditOutcome::Success => summary.success += 1,
                AuditOutcome::Failure => summary.failure += 1,
                AuditOutcome::Blocked => summary.blocked += 1,
            }
            *summary.by_risk.entry(entry.risk_level).or_default() += 1;
            *actions.entry(entry.action.as_str()).or_default() += 1;
            *users.entry(entry.user_id.as_str()).or_default() += 1;
        }
        summary.top_actions = top(actions, 10);
        summary.top_users = top(users, 10);
        summary
    }
}

fn top(counts: HashMap<&str, usize>, limit: usize) -> Vec<CountEntry> {
    let mut ranked: Vec<CountEntry> = counts
        .into_iter()
        .map(|(name, count)| CountEntry {
            name: name.to_owned(),
            count,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    ranked.truncate(limit);
    ranked
}

/// What an anomaly measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Share of failed actions.
    HighFailureRate,
    /// One user's action volume.
    ExcessiveActivity,
    /// One user's failed authentication attempts.
    AuthenticationFailures,
    /// Blocked actions across all users.
    BlockedActions,
}

/// One finding of [`crate::AuditService::detect_anomalies`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    /// What was measured.
    pub kind: AnomalyKind,
    /// Severity tier.
    pub severity: RiskLevel,
    /// Human-readable summary.
    pub description: String,
    /// Implicated user, for per-user findings.
    pub user_id: Option<UserId>,
    /// Measured value.
    pub value: f64,
    /// End of the scanned window.
    pub detected_at: DateTime<Utc>,
}

fn failure_rate_severity(rate: f64) -> Option<RiskLevel> {
    if rate > 0.5 {
        Some(RiskLevel::High)
    } else if rate > 0.3 {
        Some(RiskLevel::Medium)
    } else {
        None
    }
}

fn activity_severity(count: usize) -> Option<RiskLevel> {
    match count {
        n if n > 5000 => Some(RiskLevel::High),
        n if n > 1000 => Some(RiskLevel::Medium),
        _ => None,
    }
}

fn auth_failure_severity(count: usize) -> Option<RiskLevel> {
    match count {
        n if n > 50 => Some(RiskLevel::Critical),
        n if n > 25 => Some(RiskLevel::High),
        n if n > 10 => Some(RiskLevel::Medium),
        _ => None,
    }
}

fn blocked_severity(count: usize) -> Option<RiskLevel> {
    match count {
        n if n > 500 => Some(RiskLevel::Critical),
        n if n > 100 => Some(RiskLevel::High),
        _ => None,
    }
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn scan(entries: &[AuditLogEntry], now: DateTime<Utc>) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    let mut push = |kind, severity, description: String, user_id: Option<&str>, value: f64| {
        anomalies.push(Anomaly {
            kind,
            severity,
            description,
            user_id: user_id.map(str::to_owned),
            value,
            detected_at: now,
        });
    };

    let failures = entries
        .iter()
        .filter(|entry| entry.outcome == AuditOutcome::Failure)
        .count();
    if !entries.is_empty() {
        let rate = failures as f64 / entries.len() as f64;
        if let Some(severity) = failure_rate_severity(rate) {
            push(
                AnomalyKind::HighFailureRate,
                severity,
                format!("{:.1}% of actions failed in the last 24h", rate * 100.0),
                None,
                rate,
            );
        }
    }

    let mut activity: BTreeMap<&str, usize> = BTreeMap::new();
    let mut auth_failures: BTreeMap<&str, usize> = BTreeMap::new();
    for entry in entries {
        *activity.entry(entry.user_id.as_str()).or_default() += 1;
        if entry.outcome == AuditOutcome::Failure && entry.is_auth_action() {
            *auth_failures.entry(entry.user_id.as_str()).or_default() += 1;
        }
    }
    for (user, count) in activity {
        if let Some(severity) = activity_severity(count) {
            push(
                AnomalyKind::ExcessiveActivity,
                severity,
                format!("user {user} performed {count} actions in the last 24h"),
                Some(user),
                count as f64,
            );
        }
    }
    for (user, count) in auth_failures {
        if let Some(severity) = auth_failure_severity(count) {
            push(
                AnomalyKind::AuthenticationFailures,
                severity,
                format!("user {user} failed authentication {count} times in the last 24h"),
                Some(user),
                count as f64,
            );
        }
    }

    let blocked = entries
        .iter()
        .filter(|entry| entry.outcome == AuditOutcome::Blocked)
        .count();
    if let Some(severity) = blocked_severity(blocked) {
        push(
            AnomalyKind::BlockedActions,
            severity,
            format!("{blocked} actions were blocked in the last 24h"),
            None,
            blocked as f64,
        );
    }
    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_use_strict_thresholds() {
        assert_eq!(failure_rate_severity(0.3), None);
        assert_eq!(failure_rate_severity(0.31), Some(RiskLevel::Medium));
        assert_eq!(failure_rate_severity(0.51), Some(RiskLevel::High));
        assert_eq!(activity_severity(1000), None);
        assert_eq!(activity_severity(5001), Some(RiskLevel::High));
        assert_eq!(auth_failure_severity(11), Some(RiskLevel::Medium));
        assert_eq!(auth_failure_severity(26), Some(RiskLevel::High));
        assert_eq!(auth_failure_severity(51), Some(RiskLevel::Critical));
        assert_eq!(blocked_severity(100), None);
        assert_eq!(blocked_severity(101), Some(RiskLevel::High));
        assert_eq!(blocked_severity(501), Some(RiskLevel::Critical));
    }
}
