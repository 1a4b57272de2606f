//! Audit logging with inline threat heuristics.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use agent_primitives::RiskLevel;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::entry::{AuditLogEntry, AuditOutcome, NewAuditEntry};
use super::report::{
    ActivitySummary, Anomaly, AuditSignal, DAY, ORIGIN_THRESHOLD, RAPID_FAILURE_THRESHOLD,
    RAPID_FAILURE_WINDOW, scan,
};
use super::store::{AuditFilter, AuditStore, InMemoryAuditStore};
use crate::{AuditError, AuditResult};

/// Output format for [`AuditService::export_logs`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Pretty-printed JSON array.
    #[default]
    Json,
    /// Header row plus one row per record.
    Csv,
}

#[derive(Serialize)]
struct CsvRow<'a> {
    id: String,
    timestamp: String,
    user_id: &'a str,
    action: &'a str,
    resource_type: &'a str,
    resource_id: &'a str,
    outcome: &'static str,
    risk_level: &'static str,
    origin: &'a str,
    details: String,
}

impl<'a> CsvRow<'a> {
    fn new(entry: &'a AuditLogEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            timestamp: entry.timestamp.to_rfc3339(),
            user_id: &entry.user_id,
            action: &entry.action,
            resource_type: &entry.resource_type,
            resource_id: entry.resource_id.as_deref().unwrap_or_default(),
            outcome: entry.outcome.as_str(),
            risk_level: entry.risk_level.as_str(),
            origin: entry.origin.as_deref().unwrap_or_default(),
            details: if entry.details.is_null() {
                String::new()
            } else {
                entry.details.to_string()
            },
        }
    }
}

/// Writes audit records and derives signals, summaries and anomalies from
/// them.
#[derive(Clone)]
pub struct AuditService {
    store: Arc<dyn AuditStore>,
    signals: broadcast::Sender<AuditSignal>,
}

impl std::fmt::Debug for AuditService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditService")
            .field("subscribers", &self.signals.receiver_count())
            .finish_non_exhaustive()
    }
}

impl Default for AuditService {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryAuditStore::new()))
    }
}

impl AuditService {
    /// Creates a service over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        let (signals, _) = broadcast::channel(256);
        Self { store, signals }
    }

    /// Subscribes to heuristic signals.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AuditSignal> {
        self.signals.subscribe()
    }

    /// Persists one record, then runs the inline heuristics.
    ///
    /// Heuristic failures are logged and never fail the write.
    ///
    /// # Errors
    ///
    /// Returns the store's error when the append fails.
    pub async fn log(&self, entry: NewAuditEntry) -> AuditResult<AuditLogEntry> {
        let entry = entry.into_entry();
        self.store.append(entry.clone()).await?;
        debug!(
            audit_id = %entry.id,
            user_id = %entry.user_id,
            action = %entry.action,
            outcome = %entry.outcome,
            risk = %entry.risk_level,
            "audit record stored"
        );
        if let Err(err) = self.run_heuristics(&entry).await {
            warn!(audit_id = %entry.id, error = %err, "audit heuristics failed");
        }
        Ok(entry)
    }

    async fn run_heuristics(&self, entry: &AuditLogEntry) -> AuditResult<()> {
        if entry.risk_level.is_elevated() {
            warn!(
                user_id = %entry.user_id,
                action = %entry.action,
                risk = %entry.risk_level,
                "high risk action recorded"
            );
            self.emit(AuditSignal::HighRiskAction {
                entry_id: entry.id,
                user_id: entry.user_id.clone(),
                action: entry.action.clone(),
                risk_level: entry.risk_level,
            });
        }

        if entry.outcome == AuditOutcome::Failure {
            let filter = AuditFilter::since(since(RAPID_FAILURE_WINDOW))
                .for_user(entry.user_id.clone())
                .with_outcome(AuditOutcome::Failure);
            let failures = self.store.query(&filter).await?.len();
            if failures >= RAPID_FAILURE_THRESHOLD {
                warn!(user_id = %entry.user_id, failures, "rapid failures");
                self.emit(AuditSignal::RapidFailures {
                    user_id: entry.user_id.clone(),
                    failures,
                });
            }
        }

        if entry.origin.is_some() {
            let filter = AuditFilter::since(since(DAY)).for_user(entry.user_id.clone());
            let recent = self.store.query(&filter).await?;
            let origins = recent
                .iter()
                .filter_map(|record| record.origin.as_deref())
                .collect::<HashSet<_>>()
                .len();
            if origins > ORIGIN_THRESHOLD {
                warn!(user_id = %entry.user_id, origins, "activity from many origins");
                self.emit(AuditSignal::MultipleOrigins {
                    user_id: entry.user_id.clone(),
                    origins,
                });
            }
        }
        Ok(())
    }

    fn emit(&self, signal: AuditSignal) {
        let _ = self.signals.send(signal);
    }

    /// Records matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn query(&self, filter: &AuditFilter) -> AuditResult<Vec<AuditLogEntry>> {
        self.store.query(filter).await
    }

    /// Aggregates the records of the trailing `timeframe`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn activity_summary(&self, timeframe: Duration) -> AuditResult<ActivitySummary> {
        let entries = self
            .store
            .query(&AuditFilter::since(since(timeframe)))
            .await?;
        Ok(ActivitySummary::from_entries(&entries))
    }

    /// Scans the trailing 24 hours for anomalies.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn detect_anomalies(&self) -> AuditResult<Vec<Anomaly>> {
        let now = Utc::now();
        let entries = self.store.query(&AuditFilter::since(since(DAY))).await?;
        let anomalies = scan(&entries, now);
        if !anomalies.is_empty() {
            info!(count = anomalies.len(), "audit anomalies detected");
        }
        Ok(anomalies)
    }

    /// Renders matching records as JSON or CSV.
    ///
    /// # Errors
    ///
    /// Propagates store failures and encoder errors.
    pub async fn export_logs(&self, filter: &AuditFilter, format: ExportFormat) -> AuditResult<String> {
        let entries = self.store.query(filter).await?;
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&entries)?),
            ExportFormat::Csv => {
                let mut writer = csv::Writer::from_writer(Vec::new());
                for entry in &entries {
                    writer.serialize(CsvRow::new(entry))?;
                }
                let bytes = writer.into_inner().map_err(|err| AuditError::Csv {
                    message: err.to_string(),
                })?;
                String::from_utf8(bytes).map_err(|err| AuditError::Csv {
                    message: err.to_string(),
                })
            }
        }
    }

    /// Writes matching records to `path` as newline-delimited JSON.
    /// Returns the number of records written.
    ///
    /// # Errors
    ///
    /// Propagates store failures and I/O errors.
    pub async fn export_to_file(&self, filter: &AuditFilter, path: &Path) -> AuditResult<usize> {
        let entries = self.store.query(filter).await?;
        let mut body = String::new();
        for entry in &entries {
            body.push_str(&serde_json::to_string(entry)?);
            body.push('\n');
        }
        let io = |source| AuditError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::create(path).await.map_err(io)?;
        file.write_all(body.as_bytes()).await.map_err(io)?;
        file.flush().await.map_err(io)?;
        info!(path = %path.display(), records = entries.len(), "audit log exported");
        Ok(entries.len())
    }

    /// Deletes low and medium risk records older than `retention_days`.
    /// High and critical records are kept indefinitely.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn cleanup(&self, retention_days: u32) -> AuditResult<usize> {
        let cutoff = Utc::now()
            .checked_sub_signed(TimeDelta::days(i64::from(retention_days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = self.store.purge(cutoff, RiskLevel::Medium).await?;
        info!(purged, retention_days, "audit records purged");
        Ok(purged)
    }
}

fn since(window: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(window)
        .ok()
        .and_then(|delta| Utc::now().checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AnomalyKind;
    use serde_json::json;

    fn failure(user: &str) -> NewAuditEntry {
        NewAuditEntry::new(user, "agent.execute", "instance").outcome(AuditOutcome::Failure)
    }

    fn drain(rx: &mut broadcast::Receiver<AuditSignal>) -> Vec<AuditSignal> {
        let mut signals = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            signals.push(signal);
        }
        signals
    }

    #[tokio::test]
    async fn fifth_failure_raises_rapid_failures() {
        let audit = AuditService::default();
        let mut rx = audit.subscribe();
        for _ in 0..4 {
            audit.log(failure("mallory")).await.unwrap();
        }
        assert!(drain(&mut rx).is_empty());

        audit.log(failure("mallory")).await.unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![AuditSignal::RapidFailures {
                user_id: "mallory".into(),
                failures: 5
            }]
        );
    }

    #[tokio::test]
    async fn old_failures_fall_outside_the_window() {
        let audit = AuditService::default();
        let mut rx = audit.subscribe();
        let old = Utc::now() - TimeDelta::minutes(10);
        for _ in 0..4 {
            audit.log(failure("eve").at(old)).await.unwrap();
        }
        audit.log(failure("eve")).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn elevated_risk_and_many_origins_signal() {
        let audit = AuditService::default();
        let mut rx = audit.subscribe();

        let entry = audit
            .log(NewAuditEntry::new("bob", "agent.publish", "agent").risk(RiskLevel::Critical))
            .await
            .unwrap();
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [AuditSignal::HighRiskAction { entry_id, .. }] if *entry_id == entry.id
        ));

        for n in 0..6 {
            audit
                .log(NewAuditEntry::new("bob", "agent.search", "registry").origin(format!("10.0.0.{n}")))
                .await
                .unwrap();
        }
        assert_eq!(
            drain(&mut rx),
            vec![AuditSignal::MultipleOrigins {
                user_id: "bob".into(),
                origins: 6
            }]
        );
    }

    #[tokio::test]
    async fn summary_counts_outcomes_and_ranks() {
        let audit = AuditService::default();
        for _ in 0..3 {
            audit.log(NewAuditEntry::new("alice", "agent.install", "agent")).await.unwrap();
        }
        audit.log(failure("carol")).await.unwrap();
        audit
            .log(
                NewAuditEntry::new("carol", "agent.publish", "agent")
                    .outcome(AuditOutcome::Blocked)
                    .risk(RiskLevel::High),
            )
            .await
            .unwrap();

        let summary = audit.activity_summary(DAY).await.unwrap();
        assert_eq!(summary.total, 5);
        assert_eq!((summary.success, summary.failure, summary.blocked), (3, 1, 1));
        assert_eq!(summary.by_risk[&RiskLevel::Low], 4);
        assert_eq!(summary.by_risk[&RiskLevel::Critical], 0);
        assert_eq!(summary.top_actions[0].name, "agent.install");
        assert_eq!(summary.top_users[0].name, "alice");
    }

    #[tokio::test]
    async fn auth_failures_escalate_to_anomalies() {
        let audit = AuditService::default();
        for _ in 0..12 {
            audit
                .log(NewAuditEntry::new("trudy", "auth.login", "session").outcome(AuditOutcome::Failure))
                .await
                .unwrap();
        }
        let anomalies = audit.detect_anomalies().await.unwrap();
        let auth = anomalies
            .iter()
            .find(|anomaly| anomaly.kind == AnomalyKind::AuthenticationFailures)
            .unwrap();
        assert_eq!(auth.severity, RiskLevel::Medium);
        assert_eq!(auth.user_id.as_deref(), Some("trudy"));
        let rate = anomalies
            .iter()
            .find(|anomaly| anomaly.kind == AnomalyKind::HighFailureRate)
            .unwrap();
        assert_eq!(rate.severity, RiskLevel::High);
    }

    #[tokio::test]
    async fn cleanup_keeps_elevated_records() {
        let audit = AuditService::default();
        let old = Utc::now() - TimeDelta::days(120);
        audit.log(NewAuditEntry::new("a", "x", "y").at(old)).await.unwrap();
        audit
            .log(NewAuditEntry::new("a", "x", "y").risk(RiskLevel::Medium).at(old))
            .await
            .unwrap();
        audit
            .log(NewAuditEntry::new("a", "x", "y").risk(RiskLevel::High).at(old))
            .await
            .unwrap();
        audit.log(NewAuditEntry::new("a", "x", "y")).await.unwrap();

        assert_eq!(audit.cleanup(90).await.unwrap(), 2);
        let left = audit.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().any(|entry| entry.risk_level == RiskLevel::High));
    }

    #[tokio::test]
    async fn exports_json_csv_and_ndjson() {
        let audit = AuditService::default();
        audit
            .log(
                NewAuditEntry::new("alice", "agent.install", "agent")
                    .resource_id("abc")
                    .details(json!({ "note": "a, b" })),
            )
            .await
            .unwrap();
        audit.log(failure("bob")).await.unwrap();

        let only_alice = AuditFilter::default().for_user("alice");
        let json = audit.export_logs(&only_alice, ExportFormat::Json).await.unwrap();
        let parsed: Vec<AuditLogEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 1);

        let csv = audit
            .export_logs(&AuditFilter::default(), ExportFormat::Csv)
            .await
            .unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("id,timestamp,user_id,action"));
        assert_eq!(lines.count(), 2);
        assert!(csv.contains("\"{\"\"note\"\":\"\"a, b\"\"}\""));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.ndjson");
        let written = audit
            .export_to_file(&AuditFilter::default(), &path)
            .await
            .unwrap();
        assert_eq!(written, 2);
        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body.lines().count(), 2);
        for line in body.lines() {
            serde_json::from_str::<AuditLogEntry>(line).unwrap();
        }
    }
}
