//! Threat records and automated response mapping.

use std::time::Duration;

use agent_primitives::{AgentId, InstanceId, RiskLevel, ThreatId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Duration of the temporary block dispatched for user-centric threats.
pub const TEMPORARY_BLOCK: Duration = Duration::from_secs(60 * 60);

/// Class of detected threat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    /// Published or running code behaves maliciously.
    MaliciousCode,
    /// Instance consumes resources abusively.
    ResourceAbuse,
    /// Unusual user behaviour.
    SuspiciousActivity,
    /// Repeated authentication failures.
    BruteForce,
    /// Data leaving through unexpected channels.
    DataExfiltration,
    /// Attempt to gain grants the user does not hold.
    PrivilegeEscalation,
    /// Request volume above the allowed rate.
    RateLimitAbuse,
}

/// Input accepted by `SecurityManager::detect_threat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewThreat {
    /// Threat class.
    pub threat_type: ThreatType,
    /// Severity.
    pub severity: RiskLevel,
    /// Human-readable description.
    pub description: String,
    /// Implicated user, if any.
    #[serde(default)]
    pub user_id: Option<UserId>,
    /// Implicated agent, if any.
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    /// Implicated instance, if any.
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
    /// Supporting evidence.
    #[serde(default)]
    pub evidence: Value,
}

impl NewThreat {
    /// Starts a threat report.
    #[must_use]
    pub fn new(threat_type: ThreatType, severity: RiskLevel, description: impl Into<String>) -> Self {
        Self {
            threat_type,
            severity,
            description: description.into(),
            user_id: None,
            agent_id: None,
            instance_id: None,
            evidence: Value::Null,
        }
    }

    /// Attaches the implicated user.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attaches the implicated agent.
    #[must_use]
    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    /// Attaches the implicated instance.
    #[must_use]
    pub fn with_instance(mut self, instance_id: InstanceId) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    /// Attaches evidence.
    #[must_use]
    pub fn with_evidence(mut self, evidence: Value) -> Self {
        self.evidence = evidence;
        self
    }
}

/// Persisted threat record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatDetection {
    /// Record id.
    pub id: ThreatId,
    /// Threat class.
    pub threat_type: ThreatType,
    /// Severity.
    pub severity: RiskLevel,
    /// Human-readable description.
    pub description: String,
    /// Implicated user.
    pub user_id: Option<UserId>,
    /// Implicated agent.
    pub agent_id: Option<AgentId>,
    /// Implicated instance.
    pub instance_id: Option<InstanceId>,
    /// Supporting evidence.
    pub evidence: Value,
    /// Detection time.
    pub detected_at: DateTime<Utc>,
    /// Whether an operator closed the threat.
    pub resolved: bool,
    /// Resolution time.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator who resolved it.
    pub resolved_by: Option<UserId>,
}

impl ThreatDetection {
    pub(crate) fn record(threat: NewThreat) -> Self {
        Self {
            id: ThreatId::random(),
            threat_type: threat.threat_type,
            severity: threat.severity,
            description: threat.description,
            user_id: threat.user_id,
            agent_id: threat.agent_id,
            instance_id: threat.instance_id,
            evidence: threat.evidence,
            detected_at: Utc::now(),
            resolved: false,
            resolved_at: None,
            resolved_by: None,
        }
    }
}

/// Automated response requested for a critical threat.
///
/// These are signals for a responder; the security manager never mutates
/// infrastructure itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResponseAction {
    /// Pull the agent from the catalog and stop its instances.
    QuarantineAgent {
        /// Agent to quarantine.
        agent_id: AgentId,
    },
    /// Temporarily refuse the user's requests.
    BlockUser {
        /// User to block.
        user_id: UserId,
        /// Block length in seconds.
        duration_secs: u64,
    },
    /// Throttle the user.
    EnforceRateLimit {
        /// User to throttle.
        user_id: UserId,
    },
    /// Stop the offending executions.
    TerminateProcesses {
        /// Instance to stop, if known.
        instance_id: Option<InstanceId>,
        /// Owning user, if known.
        user_id: Option<UserId>,
    },
    /// Hand to a human.
    FlagForReview,
}

impl ResponseAction {
    /// Picks the response for a threat.
    #[must_use]
    pub fn for_threat(threat: &ThreatDetection) -> Self {
        let block = |user_id: &UserId| Self::BlockUser {
            user_id: user_id.clone(),
            duration_secs: TEMPORARY_BLOCK.as_secs(),
        };

        match (threat.threat_type, &threat.agent_id, &threat.user_id) {
            (ThreatType::MaliciousCode | ThreatType::DataExfiltration, Some(agent_id), _) => {
                Self::QuarantineAgent {
                    agent_id: *agent_id,
                }
            }
            (
                ThreatType::SuspiciousActivity
                | ThreatType::BruteForce
                | ThreatType::PrivilegeEscalation
                | ThreatType::DataExfiltration,
                _,
                Some(user_id),
            ) => block(user_id),
            (ThreatType::RateLimitAbuse, _, Some(user_id)) => Self::EnforceRateLimit {
                user_id: user_id.clone(),
            },
            (ThreatType::ResourceAbuse, _, user_id) => Self::TerminateProcesses {
                instance_id: threat.instance_id,
                user_id: user_id.clone(),
            },
            _ => Self::FlagForReview,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_mapping() {
        let agent = AgentId::random();
        let malicious = ThreatDetection::record(
            NewThreat::new(ThreatType::MaliciousCode, RiskLevel::Critical, "bad code")
                .with_agent(agent),
        );
        assert_eq!(
            ResponseAction::for_threat(&malicious),
            ResponseAction::QuarantineAgent { agent_id: agent }
        );

        let brute = ThreatDetection::record(
            NewThreat::new(ThreatType::BruteForce, RiskLevel::Critical, "logins").with_user("u1"),
        );
        assert!(matches!(
            ResponseAction::for_threat(&brute),
            ResponseAction::BlockUser { duration_secs: 3600, .. }
        ));

        let orphan = ThreatDetection::record(NewThreat::new(
            ThreatType::MaliciousCode,
            RiskLevel::Critical,
            "unknown origin",
        ));
        assert_eq!(
            ResponseAction::for_threat(&orphan),
            ResponseAction::FlagForReview
        );
    }
}
