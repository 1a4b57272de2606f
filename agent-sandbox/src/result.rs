//! Per-invocation context and the result every execution produces.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use agent_primitives::{InstanceId, RequestId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Everything one invocation needs. Created per call and discarded after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Owning instance.
    pub instance_id: InstanceId,
    /// Request being served.
    pub request_id: RequestId,
    /// Calling user.
    pub user_id: UserId,
    /// Capability name.
    pub capability: String,
    /// Capability input.
    pub input: Value,
    /// Instance environment merged with any per-call additions.
    pub environment: HashMap<String, String>,
    /// When the invocation started.
    pub start_time: DateTime<Utc>,
    /// When the invocation must have finished.
    pub timeout_at: DateTime<Utc>,
}

impl ExecutionContext {
    /// Creates a context starting now with the given timeout.
    #[must_use]
    pub fn new(
        instance_id: InstanceId,
        request_id: RequestId,
        user_id: impl Into<UserId>,
        capability: impl Into<String>,
        input: Value,
        timeout: Duration,
    ) -> Self {
        let start_time = Utc::now();
        let timeout_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| start_time.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            instance_id,
            request_id,
            user_id: user_id.into(),
            capability: capability.into(),
            input,
            environment: HashMap::new(),
            start_time,
            timeout_at,
        }
    }

    /// Returns a copy carrying the given environment.
    #[must_use]
    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    /// Returns the configured timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        (self.timeout_at - self.start_time)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Result code carried by a failed [`ExecutionResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Agent code raised an error or panicked.
    ExecutionError,
    /// The wall-clock limit elapsed.
    Timeout,
    /// The memory ceiling was hit.
    MemoryLimitExceeded,
    /// A network call was filtered out.
    NetworkDenied,
    /// Source failed the syntax check.
    SyntaxError,
    /// The sandbox itself failed.
    RuntimeError,
    /// The owning instance was deleted mid-flight.
    Terminated,
}

impl ErrorCode {
    /// Returns the wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            Self::NetworkDenied => "NETWORK_DENIED",
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::RuntimeError => "RUNTIME_ERROR",
            Self::Terminated => "TERMINATED",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Result code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Optional trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Timing and usage figures, always populated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    /// Wall time from start to result.
    pub execution_time_ms: u64,
    /// Peak bytes held against the memory ceiling.
    pub memory_used_bytes: u64,
    /// Time spent inside the engine.
    pub cpu_time_ms: u64,
    /// Network calls that passed the filter.
    pub network_requests: u32,
}

/// Log severity emitted by agent code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Informational.
    Info,
    /// Something looked wrong.
    Warn,
    /// Something failed.
    Error,
}

/// One captured log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one invocation. Always returned, never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Request being answered.
    pub request_id: RequestId,
    /// Whether the capability produced output.
    pub success: bool,
    /// Output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Failure details otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// Timing and usage.
    pub metadata: ExecutionMetadata,
    /// Captured log lines.
    #[serde(default)]
    pub logs: Vec<LogRecord>,
    /// When the result was produced.
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Builds a successful result.
    #[must_use]
    pub fn success(request_id: RequestId, output: Value, metadata: ExecutionMetadata) -> Self {
        Self {
            request_id,
            success: true,
            output: Some(output),
            error: None,
            metadata,
            logs: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    /// Builds a failed result.
    #[must_use]
    pub fn failure(
        request_id: RequestId,
        code: ErrorCode,
        message: impl Into<String>,
        metadata: ExecutionMetadata,
    ) -> Self {
        Self {
            request_id,
            success: false,
            output: None,
            error: Some(ExecutionError {
                code,
                message: message.into(),
                stack: None,
            }),
            metadata,
            logs: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    /// Attaches a trace to a failed result.
    #[must_use]
    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.stack = stack;
        }
        self
    }

    /// Attaches captured log lines.
    #[must_use]
    pub fn with_logs(mut self, logs: Vec<LogRecord>) -> Self {
        self.logs = logs;
        self
    }

    /// Returns the failure code, if any.
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|error| error.code)
    }
}
