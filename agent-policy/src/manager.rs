//! Owner of user grants, threat records, and the security signal bus.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use agent_primitives::{RiskLevel, ThreatId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::{
    CodeAnalysis, CodeAnalyzer, NewThreat, Permission, PolicyError, PolicyResult, ResponseAction,
    SecurityEvent, SecurityPolicy, ThreatDetection, UserPermission, validate_policy,
};

const EVENT_CAPACITY: usize = 256;
const AUDIT_CAPACITY: usize = 10_000;
const THREAT_CAPACITY: usize = 10_000;

/// One entry of the security manager's own audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAuditRecord {
    /// When the check happened.
    pub recorded_at: DateTime<Utc>,
    /// Dotted action name, e.g. `permission.check`.
    pub action: String,
    /// Subject user, if any.
    pub user_id: Option<UserId>,
    /// Whether the check passed.
    pub allowed: bool,
    /// Short detail string.
    pub detail: String,
}

/// Point-in-time security posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityMetrics {
    /// Unresolved threats.
    pub active_threats: usize,
    /// Resolved threats.
    pub resolved_threats: usize,
    /// Permission checks, policy validations and threat events recorded so far.
    pub audit_volume: u64,
    /// Overall bucket derived from the active threats.
    pub risk_level: RiskLevel,
}

/// Central security authority.
///
/// Holds per-user grants (provisioned lazily), persisted threat records and
/// a broadcast bus of [`SecurityEvent`]s. Responses to critical threats are
/// published on the bus; nothing here touches instances or the catalog.
#[derive(Debug)]
pub struct SecurityManager {
    permissions: RwLock<HashMap<UserId, UserPermission>>,
    threats: RwLock<Vec<ThreatDetection>>,
    threat_capacity: usize,
    audit: RwLock<VecDeque<SecurityAuditRecord>>,
    audit_volume: AtomicU64,
    analyzer: CodeAnalyzer,
    events: broadcast::Sender<SecurityEvent>,
}

impl Default for SecurityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityManager {
    /// Creates a manager using the built-in analyzer rules.
    #[must_use]
    pub fn new() -> Self {
        Self::with_analyzer(CodeAnalyzer::new())
    }

    /// Creates a manager using a custom analyzer.
    #[must_use]
    pub fn with_analyzer(analyzer: CodeAnalyzer) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            permissions: RwLock::new(HashMap::new()),
            threats: RwLock::new(Vec::new()),
            threat_capacity: THREAT_CAPACITY,
            audit: RwLock::new(VecDeque::new()),
            audit_volume: AtomicU64::new(0),
            analyzer,
            events,
        }
    }

    /// Caps the number of retained threat records. Once full, the oldest
    /// resolved record is evicted first, then the oldest overall.
    #[must_use]
    pub fn with_threat_capacity(mut self, capacity: usize) -> Self {
        self.threat_capacity = capacity.max(1);
        self
    }

    /// Subscribes to security signals.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.events.subscribe()
    }

    /// Returns the analyzer backing [`Self::analyze_code`].
    #[must_use]
    pub fn analyzer(&self) -> &CodeAnalyzer {
        &self.analyzer
    }

    /// Checks that `user_id` holds `permission`, provisioning defaults first.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::PermissionDenied`] when the grant is missing.
    pub async fn check_permission(&self, user_id: &str, permission: Permission) -> PolicyResult<()> {
        let allowed = self.user_permissions(user_id).await.has(permission);
        self.record(
            "permission.check",
            Some(user_id),
            allowed,
            permission.to_string(),
        )
        .await;

        if allowed {
            debug!(user_id, %permission, "permission granted");
            self.emit(SecurityEvent::PermissionGranted {
                user_id: user_id.to_owned(),
                permission,
            });
            Ok(())
        } else {
            warn!(user_id, %permission, "permission denied");
            self.emit(SecurityEvent::PermissionDenied {
                user_id: user_id.to_owned(),
                permission,
            });
            Err(PolicyError::PermissionDenied {
                user_id: user_id.to_owned(),
                permission,
            })
        }
    }

    /// Returns the user's record, provisioning defaults when absent.
    pub async fn user_permissions(&self, user_id: &str) -> UserPermission {
        if let Some(existing) = self.permissions.read().await.get(user_id) {
            return existing.clone();
        }
        let mut guard = self.permissions.write().await;
        guard
            .entry(user_id.to_owned())
            .or_insert_with(|| {
                debug!(user_id, "provisioning default permissions");
                UserPermission::with_defaults(user_id)
            })
            .clone()
    }

    /// Replaces a user's record wholesale.
    pub async fn set_user_permissions(&self, record: UserPermission) {
        info!(user_id = %record.user_id, permissions = record.permissions.len(), "user permissions replaced");
        self.permissions
            .write()
            .await
            .insert(record.user_id.clone(), record);
    }

    /// Adds a single grant.
    pub async fn grant(&self, user_id: &str, permission: Permission) {
        let mut guard = self.permissions.write().await;
        guard
            .entry(user_id.to_owned())
            .or_insert_with(|| UserPermission::with_defaults(user_id))
            .permissions
            .insert(permission);
        info!(user_id, %permission, "permission granted to user");
    }

    /// Withdraws a user's instance and execution quota.
    ///
    /// Publishes [`SecurityEvent::QuotaRevoked`]; the runtime reacts by
    /// terminating the user's instances.
    pub async fn revoke_quota(&self, user_id: &str) {
        {
            let mut guard = self.permissions.write().await;
            let record = guard
                .entry(user_id.to_owned())
                .or_insert_with(|| UserPermission::with_defaults(user_id));
            record.limits.max_agents = 0;
            record.limits.max_concurrent_executions = 0;
        }
        self.record("quota.revoke", Some(user_id), true, String::new())
            .await;
        warn!(user_id, "user quota revoked");
        self.emit(SecurityEvent::QuotaRevoked {
            user_id: user_id.to_owned(),
        });
    }

    /// Validates a policy, recording the outcome.
    ///
    /// # Errors
    ///
    /// Propagates [`PolicyError::Violation`] from [`validate_policy`].
    pub async fn validate_policy(&self, policy: &SecurityPolicy) -> PolicyResult<()> {
        let outcome = validate_policy(policy);
        match &outcome {
            Ok(()) => {
                self.record("policy.validate", None, true, String::new())
                    .await;
            }
            Err(PolicyError::Violation { violations }) => {
                self.record("policy.validate", None, false, violations.join("; "))
                    .await;
                warn!(violations = violations.len(), "security policy rejected");
                self.emit(SecurityEvent::PolicyRejected {
                    violations: violations.clone(),
                });
            }
            Err(_) => {}
        }
        outcome
    }

    /// Scores source text with the configured analyzer.
    #[must_use]
    pub fn analyze_code(&self, code: &str) -> CodeAnalysis {
        self.analyzer.analyze(code)
    }

    /// Persists a threat and, when critical, dispatches an automated response.
    pub async fn detect_threat(&self, threat: NewThreat) -> ThreatDetection {
        let detection = ThreatDetection::record(threat);
        {
            let mut guard = self.threats.write().await;
            if guard.len() >= self.threat_capacity {
                let evict = guard.iter().position(|threat| threat.resolved).unwrap_or(0);
                let evicted = guard.remove(evict);
                debug!(threat_id = %evicted.id, resolved = evicted.resolved, "threat record evicted");
            }
            guard.push(detection.clone());
        }
        self.record(
            "threat.detect",
            detection.user_id.as_deref(),
            false,
            detection.description.clone(),
        )
        .await;

        warn!(
            threat_id = %detection.id,
            threat_type = ?detection.threat_type,
            severity = %detection.severity,
            "threat detected"
        );
        self.emit(SecurityEvent::ThreatDetected {
            threat: Box::new(detection.clone()),
        });

        if detection.severity == RiskLevel::Critical {
            let action = ResponseAction::for_threat(&detection);
            info!(threat_id = %detection.id, ?action, "automated response dispatched");
            self.emit(SecurityEvent::ResponseDispatched {
                threat_id: detection.id,
                action,
            });
        }

        detection
    }

    /// Marks a threat resolved.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::ThreatNotFound`] for an unknown id.
    pub async fn resolve_threat(
        &self,
        id: ThreatId,
        resolved_by: impl Into<UserId>,
    ) -> PolicyResult<ThreatDetection> {
        let resolved_by = resolved_by.into();
        let resolved = {
            let mut guard = self.threats.write().await;
            let threat = guard
                .iter_mut()
                .find(|threat| threat.id == id)
                .ok_or(PolicyError::ThreatNotFound { id })?;
            if !threat.resolved {
                threat.resolved = true;
                threat.resolved_at = Some(Utc::now());
                threat.resolved_by = Some(resolved_by.clone());
            }
            threat.clone()
        };

        self.record("threat.resolve", Some(&resolved_by), true, id.to_string())
            .await;
        info!(threat_id = %id, resolved_by = %resolved_by, "threat resolved");
        self.emit(SecurityEvent::ThreatResolved {
            threat_id: id,
            resolved_by,
        });
        Ok(resolved)
    }

    /// Returns unresolved threats, newest first.
    pub async fn active_threats(&self) -> Vec<ThreatDetection> {
        let guard = self.threats.read().await;
        guard
            .iter()
            .rev()
            .filter(|threat| !threat.resolved)
            .cloned()
            .collect()
    }

    /// Returns the most recent audit records, newest last.
    pub async fn audit_records(&self) -> Vec<SecurityAuditRecord> {
        self.audit.read().await.iter().cloned().collect()
    }

    /// Summarises the current security posture.
    pub async fn security_metrics(&self) -> SecurityMetrics {
        let guard = self.threats.read().await;
        let active: Vec<_> = guard.iter().filter(|threat| !threat.resolved).collect();
        let critical = active
            .iter()
            .filter(|threat| threat.severity == RiskLevel::Critical)
            .count();
        let high = active
            .iter()
            .filter(|threat| threat.severity == RiskLevel::High)
            .count();

        let risk_level = if critical > 0 {
            RiskLevel::Critical
        } else if high > 3 {
            RiskLevel::High
        } else if active.len() > 10 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        SecurityMetrics {
            active_threats: active.len(),
            resolved_threats: guard.len() - active.len(),
            audit_volume: self.audit_volume.load(Ordering::Relaxed),
            risk_level,
        }
    }

    async fn record(&self, action: &str, user_id: Option<&str>, allowed: bool, detail: String) {
        self.audit_volume.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.audit.write().await;
        if guard.len() == AUDIT_CAPACITY {
            guard.pop_front();
        }
        guard.push_back(SecurityAuditRecord {
            recorded_at: Utc::now(),
            action: action.to_owned(),
            user_id: user_id.map(str::to_owned),
            allowed,
            detail,
        });
    }

    fn emit(&self, event: SecurityEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ThreatType;
    use agent_primitives::AgentId;

    #[tokio::test]
    async fn provisions_defaults_and_denies_admin_grants() {
        let manager = SecurityManager::new();
        let mut events = manager.subscribe();

        manager
            .check_permission("u1", Permission::ExecuteAgents)
            .await
            .unwrap();
        let err = manager
            .check_permission("u1", Permission::VerifyAgents)
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::PermissionDenied { .. }));

        assert!(matches!(
            events.recv().await.unwrap(),
            SecurityEvent::PermissionGranted { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SecurityEvent::PermissionDenied { .. }
        ));

        manager.grant("u1", Permission::VerifyAgents).await;
        manager
            .check_permission("u1", Permission::VerifyAgents)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn critical_threat_dispatches_response() {
        let manager = SecurityManager::new();
        let mut events = manager.subscribe();
        let agent = AgentId::random();

        let threat = manager
            .detect_threat(
                NewThreat::new(ThreatType::MaliciousCode, RiskLevel::Critical, "exfil")
                    .with_agent(agent),
            )
            .await;

        assert!(matches!(
            events.recv().await.unwrap(),
            SecurityEvent::ThreatDetected { .. }
        ));
        match events.recv().await.unwrap() {
            SecurityEvent::ResponseDispatched { threat_id, action } => {
                assert_eq!(threat_id, threat.id);
                assert_eq!(action, ResponseAction::QuarantineAgent { agent_id: agent });
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert_eq!(
            manager.security_metrics().await.risk_level,
            RiskLevel::Critical
        );

        let resolved = manager.resolve_threat(threat.id, "admin").await.unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("admin"));
        assert!(manager.active_threats().await.is_empty());

        let metrics = manager.security_metrics().await;
        assert_eq!(metrics.resolved_threats, 1);
        assert_eq!(metrics.risk_level, RiskLevel::Low);
    }

    #[tokio::test]
    async fn risk_buckets_follow_active_counts() {
        let manager = SecurityManager::new();
        for _ in 0..4 {
            manager
                .detect_threat(NewThreat::new(
                    ThreatType::SuspiciousActivity,
                    RiskLevel::High,
                    "odd",
                ))
                .await;
        }
        assert_eq!(manager.security_metrics().await.risk_level, RiskLevel::High);

        let manager = SecurityManager::new();
        for _ in 0..11 {
            manager
                .detect_threat(NewThreat::new(
                    ThreatType::RateLimitAbuse,
                    RiskLevel::Low,
                    "noisy",
                ))
                .await;
        }
        assert_eq!(
            manager.security_metrics().await.risk_level,
            RiskLevel::Medium
        );
    }

    #[tokio::test]
    async fn threat_records_are_capped_preferring_resolved_evictions() {
        let manager = SecurityManager::new().with_threat_capacity(3);
        let noisy = || NewThreat::new(ThreatType::SuspiciousActivity, RiskLevel::Low, "odd");

        let first = manager.detect_threat(noisy()).await;
        let second = manager.detect_threat(noisy()).await;
        manager.resolve_threat(second.id, "admin").await.unwrap();
        manager.detect_threat(noisy()).await;

        manager.detect_threat(noisy()).await;
        let metrics = manager.security_metrics().await;
        assert_eq!(metrics.active_threats, 3);
        assert_eq!(metrics.resolved_threats, 0);
        assert!(manager.resolve_threat(second.id, "admin").await.is_err());

        manager.detect_threat(noisy()).await;
        let active = manager.active_threats().await;
        assert_eq!(active.len(), 3);
        assert!(active.iter().all(|threat| threat.id != first.id));
    }

    #[tokio::test]
    async fn rejected_policy_is_recorded() {
        let manager = SecurityManager::new();
        let policy = SecurityPolicy::default().with_memory_limit_mb(4096);
        assert!(manager.validate_policy(&policy).await.is_err());

        let records = manager.audit_records().await;
        assert_eq!(records.len(), 1);
        assert!(!records[0].allowed);
        assert_eq!(manager.security_metrics().await.audit_volume, 1);
    }

    #[tokio::test]
    async fn revoke_quota_zeroes_limits() {
        let manager = SecurityManager::new();
        let mut events = manager.subscribe();
        manager.revoke_quota("u2").await;

        let record = manager.user_permissions("u2").await;
        assert_eq!(record.limits.max_agents, 0);
        assert!(matches!(
            events.recv().await.unwrap(),
            SecurityEvent::QuotaRevoked { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_threat_is_not_found() {
        let manager = SecurityManager::new();
        let err = manager
            .resolve_threat(ThreatId::random(), "admin")
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::ThreatNotFound { .. }));
    }
}
