//! Forwards component signals into the audit log and audit signals into
//! threat records.

use std::future::Future;
use std::sync::Arc;

use agent_kernel::RuntimeEvent;
use agent_policy::{NewThreat, SecurityEvent, SecurityManager, ThreatType};
use agent_primitives::RiskLevel;
use agent_registry::RegistryEvent;
use agent_sandbox::ErrorCode;
use agent_telemetry::{AuditOutcome, AuditService, AuditSignal, NewAuditEntry};
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Actor recorded for actions no user initiated directly.
pub const SYSTEM_ACTOR: &str = "system";

fn forward<E, F, Fut>(
    mut events: broadcast::Receiver<E>,
    bus: &'static str,
    mut handle: F,
) -> JoinHandle<()>
where
    E: Clone + Send + 'static,
    F: FnMut(E) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => handle(event).await,
                Err(RecvError::Lagged(skipped)) => warn!(bus, skipped, "audit bridge lagged"),
                Err(RecvError::Closed) => break,
            }
        }
        debug!(bus, "audit bridge stopped");
    })
}

async fn record(audit: &AuditService, entry: NewAuditEntry) {
    if let Err(err) = audit.log(entry).await {
        warn!(error = %err, "failed to record audit entry");
    }
}

pub(crate) fn runtime_events(
    events: broadcast::Receiver<RuntimeEvent>,
    audit: AuditService,
) -> JoinHandle<()> {
    forward(events, "runtime", move |event| {
        let audit = audit.clone();
        async move {
            if let Some(entry) = runtime_entry(&event) {
                record(&audit, entry).await;
            }
        }
    })
}

pub(crate) fn security_events(
    events: broadcast::Receiver<SecurityEvent>,
    audit: AuditService,
) -> JoinHandle<()> {
    forward(events, "security", move |event| {
        let audit = audit.clone();
        async move {
            if let Some(entry) = security_entry(&event) {
                record(&audit, entry).await;
            }
        }
    })
}

pub(crate) fn registry_events(
    events: broadcast::Receiver<RegistryEvent>,
    audit: AuditService,
) -> JoinHandle<()> {
    forward(events, "registry", move |event| {
        let audit = audit.clone();
        async move { record(&audit, registry_entry(&event)).await }
    })
}

pub(crate) fn audit_signals(
    signals: broadcast::Receiver<AuditSignal>,
    security: Arc<SecurityManager>,
) -> JoinHandle<()> {
    forward(signals, "audit", move |signal| {
        let security = Arc::clone(&security);
        async move {
            let threat = signal_threat(&signal);
            security.detect_threat(threat).await;
        }
    })
}

fn runtime_entry(event: &RuntimeEvent) -> Option<NewAuditEntry> {
    let entry = match event {
        RuntimeEvent::InstanceCreated {
            instance_id,
            agent_id,
            user_id,
        } => NewAuditEntry::new(user_id.clone(), "instance.create", "instance")
            .resource_id(instance_id)
            .details(json!({ "agent_id": agent_id })),
        RuntimeEvent::ExecutionCompleted {
            request_id,
            instance_id,
            user_id,
            success,
            error_code,
            execution_time_ms,
        } => {
            let outcome = if *success {
                AuditOutcome::Success
            } else {
                AuditOutcome::Failure
            };
            let risk = match error_code {
                Some(ErrorCode::NetworkDenied | ErrorCode::MemoryLimitExceeded) => {
                    RiskLevel::Medium
                }
                _ => RiskLevel::Low,
            };
            NewAuditEntry::new(user_id.clone(), "agent.execute", "instance")
                .resource_id(instance_id)
                .outcome(outcome)
                .risk(risk)
                .details(json!({
                    "request_id": request_id,
                    "error_code": error_code,
                    "execution_time_ms": execution_time_ms,
                }))
        }
        RuntimeEvent::InstanceTerminated {
            instance_id,
            user_id,
            aborted_executions,
        } => NewAuditEntry::new(user_id.clone(), "instance.delete", "instance")
            .resource_id(instance_id)
            .details(json!({ "aborted_executions": aborted_executions })),
        RuntimeEvent::ExecutionQueued { .. }
        | RuntimeEvent::ExecutionStarted { .. }
        | RuntimeEvent::InstanceStatusChanged { .. } => return None,
    };
    Some(entry)
}

fn security_entry(event: &SecurityEvent) -> Option<NewAuditEntry> {
    let entry = match event {
        SecurityEvent::PermissionDenied {
            user_id,
            permission,
        } => NewAuditEntry::new(user_id.clone(), permission.as_str(), "permission")
            .outcome(AuditOutcome::Blocked)
            .risk(RiskLevel::Medium),
        SecurityEvent::PolicyRejected { violations } => {
            NewAuditEntry::new(SYSTEM_ACTOR, "policy.validate", "policy")
                .outcome(AuditOutcome::Blocked)
                .risk(RiskLevel::High)
                .details(json!({ "violations": violations }))
        }
        SecurityEvent::QuotaRevoked { user_id } => {
            NewAuditEntry::new(user_id.clone(), "quota.revoke", "user").risk(RiskLevel::Medium)
        }
        SecurityEvent::ThreatResolved {
            threat_id,
            resolved_by,
        } => NewAuditEntry::new(resolved_by.clone(), "threat.resolve", "threat")
            .resource_id(threat_id),
        SecurityEvent::ResponseDispatched { threat_id, action } => {
            NewAuditEntry::new(SYSTEM_ACTOR, "security.response", "threat")
                .resource_id(threat_id)
                .risk(RiskLevel::Medium)
                .details(json!({ "action": action }))
        }
        // Threat records live in the security manager.
        SecurityEvent::PermissionGranted { .. } | SecurityEvent::ThreatDetected { .. } => {
            return None;
        }
    };
    Some(entry)
}

fn registry_entry(event: &RegistryEvent) -> NewAuditEntry {
    let agent_id = event.agent_id();
    match event {
        RegistryEvent::Published {
            author, checksum, ..
        } => NewAuditEntry::new(author.clone(), "agent.publish", "agent")
            .details(json!({ "checksum": checksum })),
        RegistryEvent::Updated { code_changed, .. } => {
            NewAuditEntry::new(SYSTEM_ACTOR, "agent.update", "agent")
                .details(json!({ "code_changed": code_changed }))
        }
        RegistryEvent::Deleted { .. } => {
            NewAuditEntry::new(SYSTEM_ACTOR, "agent.delete", "agent").risk(RiskLevel::Medium)
        }
        RegistryEvent::Installed {
            user_id,
            download_count,
            ..
        } => NewAuditEntry::new(user_id.clone(), "agent.install", "agent")
            .details(json!({ "download_count": download_count })),
        RegistryEvent::Reviewed {
            user_id, rating, ..
        } => NewAuditEntry::new(user_id.clone(), "agent.review", "agent")
            .details(json!({ "rating": rating })),
        RegistryEvent::Verified { verified, by, .. } => {
            NewAuditEntry::new(by.clone(), "agent.verify", "agent")
                .risk(RiskLevel::Medium)
                .details(json!({ "verified": verified }))
        }
    }
    .resource_id(agent_id)
}

fn signal_threat(signal: &AuditSignal) -> NewThreat {
    match signal {
        AuditSignal::RapidFailures { user_id, failures } => NewThreat::new(
            ThreatType::BruteForce,
            RiskLevel::Medium,
            format!("{failures} failed actions within five minutes"),
        )
        .with_user(user_id.clone())
        .with_evidence(json!({ "failures": failures })),
        AuditSignal::HighRiskAction {
            entry_id,
            user_id,
            action,
            risk_level,
        } => NewThreat::new(
            ThreatType::SuspiciousActivity,
            *risk_level,
            format!("{risk_level} risk action `{action}`"),
        )
        .with_user(user_id.clone())
        .with_evidence(json!({ "audit_id": entry_id, "action": action })),
        AuditSignal::MultipleOrigins { user_id, origins } => NewThreat::new(
            ThreatType::SuspiciousActivity,
            RiskLevel::Medium,
            format!("activity from {origins} origins within a day"),
        )
        .with_user(user_id.clone())
        .with_evidence(json!({ "origins": origins })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_policy::Permission;
    use agent_primitives::{AuditId, InstanceId, RequestId};

    #[tokio::test]
    async fn failed_executions_are_audited_as_failures() {
        let audit = AuditService::default();
        let instance_id = InstanceId::random();
        let entry = runtime_entry(&RuntimeEvent::ExecutionCompleted {
            request_id: RequestId::random(),
            instance_id,
            user_id: "u1".into(),
            success: false,
            error_code: Some(ErrorCode::NetworkDenied),
            execution_time_ms: 12,
        })
        .unwrap();
        let stored = audit.log(entry).await.unwrap();
        assert_eq!(stored.action, "agent.execute");
        assert_eq!(stored.outcome, AuditOutcome::Failure);
        assert_eq!(stored.risk_level, RiskLevel::Medium);
        assert_eq!(stored.resource_id, Some(instance_id.to_string()));
        assert_eq!(stored.details["error_code"], json!("NETWORK_DENIED"));

        assert!(
            runtime_entry(&RuntimeEvent::InstanceStatusChanged {
                instance_id,
                status: agent_kernel::InstanceStatus::Paused,
            })
            .is_none()
        );
    }

    #[tokio::test]
    async fn denials_are_blocked_and_grants_skipped() {
        let audit = AuditService::default();
        let denied = security_entry(&SecurityEvent::PermissionDenied {
            user_id: "u1".into(),
            permission: Permission::PublishAgents,
        })
        .unwrap();
        let stored = audit.log(denied).await.unwrap();
        assert_eq!(stored.outcome, AuditOutcome::Blocked);
        assert_eq!(stored.action, Permission::PublishAgents.as_str());

        assert!(
            security_entry(&SecurityEvent::PermissionGranted {
                user_id: "u1".into(),
                permission: Permission::PublishAgents,
            })
            .is_none()
        );
    }

    #[test]
    fn high_risk_signal_keeps_its_severity() {
        let threat = signal_threat(&AuditSignal::HighRiskAction {
            entry_id: AuditId::random(),
            user_id: "u1".into(),
            action: "policy.validate".into(),
            risk_level: RiskLevel::Critical,
        });
        assert_eq!(threat.severity, RiskLevel::Critical);
        assert_eq!(threat.threat_type, ThreatType::SuspiciousActivity);
        assert_eq!(threat.user_id.as_deref(), Some("u1"));
    }
}
