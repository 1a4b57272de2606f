//! The only surface agent code can reach.
//!
//! A [`SandboxHost`] is allocated per sandbox. It exposes captured logging, a
//! timer bounded by the execution deadline, memory accounting against a fixed
//! ceiling, JSON helpers, environment lookups restricted to an allow list and,
//! when the policy enables it, a filtered network call. There are no process,
//! filesystem or module-loading bindings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use agent_primitives::RequestId;
use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::network::NetworkGate;
use crate::{
    ExecutionContext, LogLevel, LogRecord, NetworkRequest, NetworkResponse, ScriptError,
    ScriptResult,
};

const BYTES_PER_MB: usize = 1024 * 1024;

/// Per-sandbox host surface.
#[derive(Debug)]
pub struct SandboxHost {
    memory_limit: usize,
    memory_used: AtomicUsize,
    memory_peak: AtomicUsize,
    allowed_env: Option<Vec<String>>,
    network: Option<NetworkGate>,
    network_requests: AtomicU32,
    logs: Mutex<Vec<LogRecord>>,
    request_id: OnceLock<RequestId>,
    environment: OnceLock<HashMap<String, String>>,
    deadline: OnceLock<Instant>,
}

impl SandboxHost {
    /// `allowed_env` of `None` exposes the whole merged environment.
    pub(crate) fn new(
        memory_limit_mb: u32,
        allowed_env: Option<Vec<String>>,
        network: Option<NetworkGate>,
    ) -> Self {
        Self {
            memory_limit: memory_limit_mb as usize * BYTES_PER_MB,
            memory_used: AtomicUsize::new(0),
            memory_peak: AtomicUsize::new(0),
            allowed_env,
            network,
            network_requests: AtomicU32::new(0),
            logs: Mutex::new(Vec::new()),
            request_id: OnceLock::new(),
            environment: OnceLock::new(),
            deadline: OnceLock::new(),
        }
    }

    /// Binds the invocation to this host. Only the first call has effect.
    pub(crate) fn bind(&self, context: &ExecutionContext, deadline: Instant) {
        let _ = self.request_id.set(context.request_id);
        let _ = self.deadline.set(deadline);
        let environment = match &self.allowed_env {
            Some(allowed) => context
                .environment
                .iter()
                .filter(|(name, _)| allowed.iter().any(|allowed| allowed == *name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            None => context.environment.clone(),
        };
        let _ = self.environment.set(environment);
    }

    /// Records a log line and routes it to `tracing`.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let request_id = self.request_id.get().copied().unwrap_or_default();
        match level {
            LogLevel::Debug => debug!(%request_id, %message, "agent log"),
            LogLevel::Info => info!(%request_id, %message, "agent log"),
            LogLevel::Warn => warn!(%request_id, %message, "agent log"),
            LogLevel::Error => error!(%request_id, %message, "agent log"),
        }
        if let Ok(mut logs) = self.logs.lock() {
            logs.push(LogRecord {
                level,
                message,
                timestamp: Utc::now(),
            });
        }
    }

    /// Logs at info level.
    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    /// Time left before the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline
            .get()
            .map_or(Duration::MAX, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            })
    }

    /// Sleeps for `duration`, never past the execution deadline.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration.min(self.remaining())).await;
    }

    /// Accounts `bytes` against the memory ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::MemoryLimit`] when the reservation would cross
    /// the ceiling; nothing is reserved in that case.
    pub fn reserve(&self, bytes: usize) -> ScriptResult<()> {
        let mut used = self.memory_used.load(Ordering::Acquire);
        loop {
            let next = used.saturating_add(bytes);
            if next > self.memory_limit {
                return Err(ScriptError::MemoryLimit {
                    requested: bytes,
                    used,
                    limit: self.memory_limit,
                });
            }
            match self.memory_used.compare_exchange_weak(
                used,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.memory_peak.fetch_max(next, Ordering::AcqRel);
                    return Ok(());
                }
                Err(actual) => used = actual,
            }
        }
    }

    /// Returns previously reserved bytes.
    pub fn release(&self, bytes: usize) {
        let _ = self
            .memory_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    /// Bytes currently reserved.
    #[must_use]
    pub fn memory_used(&self) -> usize {
        self.memory_used.load(Ordering::Acquire)
    }

    /// Highest reservation seen.
    #[must_use]
    pub fn memory_peak(&self) -> usize {
        self.memory_peak.load(Ordering::Acquire)
    }

    /// Memory ceiling in bytes.
    #[must_use]
    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    /// Looks up an allow-listed environment variable.
    #[must_use]
    pub fn env(&self, name: &str) -> Option<&str> {
        self.environment.get()?.get(name).map(String::as_str)
    }

    /// Parses JSON text, charging its size to the memory ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::MemoryLimit`] or an execution error for invalid
    /// JSON.
    pub fn parse_json(&self, text: &str) -> ScriptResult<Value> {
        self.reserve(text.len())?;
        serde_json::from_str(text).map_err(|err| ScriptError::execution(err.to_string()))
    }

    /// Serialises a value to JSON text.
    #[must_use]
    pub fn stringify_json(&self, value: &Value) -> String {
        value.to_string()
    }

    /// Issues a filtered network call.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::NetworkDenied`] when network access is disabled
    /// or the URL fails the host/port filter; otherwise propagates the
    /// client's error.
    pub async fn fetch(&self, request: NetworkRequest) -> ScriptResult<NetworkResponse> {
        let Some(gate) = &self.network else {
            return Err(ScriptError::NetworkDenied {
                reason: "network access is disabled".to_owned(),
            });
        };
        gate.admit(&request)?;
        self.network_requests.fetch_add(1, Ordering::Relaxed);
        gate.send(request).await
    }

    /// Network calls that passed the filter.
    #[must_use]
    pub fn network_requests(&self) -> u32 {
        self.network_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn take_logs(&self) -> Vec<LogRecord> {
        self.logs
            .lock()
            .map(|mut logs| std::mem::take(&mut *logs))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_primitives::InstanceId;
    use serde_json::json;

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            InstanceId::random(),
            RequestId::random(),
            "u1",
            "echo",
            json!({}),
            Duration::from_secs(1),
        )
        .with_environment(HashMap::from([
            ("API_BASE".to_owned(), "https://api.example.com".to_owned()),
            ("SECRET".to_owned(), "hunter2".to_owned()),
        ]))
    }

    #[test]
    fn memory_ceiling_is_enforced() {
        let host = SandboxHost::new(1, None, None);
        host.reserve(512 * 1024).unwrap();
        let err = host.reserve(600 * 1024).unwrap_err();
        assert!(matches!(err, ScriptError::MemoryLimit { .. }));
        host.release(512 * 1024);
        assert_eq!(host.memory_used(), 0);
        assert_eq!(host.memory_peak(), 512 * 1024);
    }

    #[test]
    fn environment_is_filtered() {
        let host = SandboxHost::new(1, Some(vec!["API_BASE".to_owned()]), None);
        host.bind(&context(), Instant::now() + Duration::from_secs(1));
        assert_eq!(host.env("API_BASE"), Some("https://api.example.com"));
        assert_eq!(host.env("SECRET"), None);
    }

    #[tokio::test]
    async fn sleep_is_clamped_to_deadline() {
        let host = SandboxHost::new(1, None, None);
        host.bind(&context(), Instant::now() + Duration::from_millis(20));
        let started = Instant::now();
        host.sleep(Duration::from_secs(10)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn fetch_without_policy_is_denied() {
        let host = SandboxHost::new(1, None, None);
        let request = NetworkRequest::get(url::Url::parse("https://example.com").unwrap());
        let err = host.fetch(request).await.unwrap_err();
        assert!(matches!(err, ScriptError::NetworkDenied { .. }));
        assert_eq!(host.network_requests(), 0);
    }

    #[test]
    fn logs_are_captured() {
        let host = SandboxHost::new(1, None, None);
        host.info("hello");
        host.log(LogLevel::Warn, "careful");
        let logs = host.take_logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].level, LogLevel::Warn);
    }
}
