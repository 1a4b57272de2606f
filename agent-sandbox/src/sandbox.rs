//! Single-use sandbox and the factory that builds them.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use agent_policy::{SecurityPolicy, validate_policy};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::network::NetworkGate;
use crate::{
    ErrorCode, ExecutionContext, ExecutionMetadata, ExecutionResult, NetworkClient, SandboxError,
    SandboxHost, SandboxResult, ScriptEngine, ScriptInvocation,
};

/// Default memory ceiling applied by [`SandboxFactory`], in megabytes.
pub const DEFAULT_MEMORY_CEILING_MB: u32 = 128;

/// Lifecycle of a [`Sandbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// Constructed, nothing allocated.
    Uninitialized,
    /// Host surface allocated.
    Initialized,
    /// Running agent code.
    Executing,
    /// Execution produced output.
    Completed,
    /// Execution produced a failure result.
    Errored,
    /// Released. Terminal.
    Disposed,
}

/// Builds one fresh [`Sandbox`] per invocation.
#[derive(Clone)]
pub struct SandboxFactory {
    engine: Arc<dyn ScriptEngine>,
    network: Option<Arc<dyn NetworkClient>>,
    memory_ceiling_mb: u32,
}

impl std::fmt::Debug for SandboxFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxFactory")
            .field("memory_ceiling_mb", &self.memory_ceiling_mb)
            .field("network_client", &self.network.is_some())
            .finish_non_exhaustive()
    }
}

impl SandboxFactory {
    /// Creates a factory over `engine` with the default memory ceiling.
    #[must_use]
    pub fn new(engine: Arc<dyn ScriptEngine>) -> Self {
        Self {
            engine,
            network: None,
            memory_ceiling_mb: DEFAULT_MEMORY_CEILING_MB,
        }
    }

    /// Injects the transport used for permitted network calls.
    #[must_use]
    pub fn with_network_client(mut self, client: Arc<dyn NetworkClient>) -> Self {
        self.network = Some(client);
        self
    }

    /// Replaces the memory ceiling.
    #[must_use]
    pub fn with_memory_ceiling_mb(mut self, mb: u32) -> Self {
        self.memory_ceiling_mb = mb;
        self
    }

    /// Returns the engine sandboxes run code through.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn ScriptEngine> {
        &self.engine
    }

    /// Builds an uninitialized sandbox for `policy`.
    #[must_use]
    pub fn create(&self, policy: SecurityPolicy) -> Sandbox {
        Sandbox {
            state: SandboxState::Uninitialized,
            policy,
            engine: Arc::clone(&self.engine),
            network: self.network.clone(),
            memory_ceiling_mb: self.memory_ceiling_mb,
            host: None,
        }
    }
}

/// Single-use execution context.
///
/// Runs `uninitialized → initialized → executing → {completed | errored} →
/// disposed`. Dropping the sandbox disposes it.
pub struct Sandbox {
    state: SandboxState,
    policy: SecurityPolicy,
    engine: Arc<dyn ScriptEngine>,
    network: Option<Arc<dyn NetworkClient>>,
    memory_ceiling_mb: u32,
    host: Option<Arc<SandboxHost>>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("state", &self.state)
            .field("policy", &self.policy)
            .field("memory_ceiling_mb", &self.memory_ceiling_mb)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> SandboxState {
        self.state
    }

    /// Returns the host surface once initialized.
    #[must_use]
    pub fn host(&self) -> Option<&Arc<SandboxHost>> {
        self.host.as_ref()
    }

    /// Validates the policy and allocates the host surface.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::InvalidState`] unless uninitialized, or
    /// [`SandboxError::Policy`] when the policy breaks a hard deny.
    pub fn initialize(&mut self) -> SandboxResult<()> {
        self.expect_state(SandboxState::Uninitialized, "initialize")?;
        validate_policy(&self.policy)?;

        let memory_limit_mb = self
            .memory_ceiling_mb
            .min(self.policy.resources.max_memory_mb);
        let allowed_env = self
            .policy
            .isolation
            .filter_environment
            .then(|| self.policy.allowed_env_vars.clone());
        let network = self
            .policy
            .network
            .enabled
            .then(|| NetworkGate::new(self.policy.network.clone(), self.network.clone()));

        self.host = Some(Arc::new(SandboxHost::new(
            memory_limit_mb,
            allowed_env,
            network,
        )));
        self.state = SandboxState::Initialized;
        debug!(memory_limit_mb, "sandbox initialized");
        Ok(())
    }

    /// Runs `code` for `context`.
    ///
    /// Faults inside agent code, panics, timeouts and resource violations all
    /// come back as a failed [`ExecutionResult`].
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::InvalidState`] unless initialized.
    pub async fn execute(
        &mut self,
        context: ExecutionContext,
        code: &str,
    ) -> SandboxResult<ExecutionResult> {
        self.expect_state(SandboxState::Initialized, "execute")?;
        let Some(host) = self.host.clone() else {
            return Err(SandboxError::InvalidState {
                state: self.state,
                operation: "execute",
            });
        };
        self.state = SandboxState::Executing;

        let started = Instant::now();
        let budget = context.timeout().min(Duration::from_millis(
            self.policy.resources.max_execution_time_ms,
        ));
        host.bind(&context, started + budget);
        let request_id = context.request_id;

        let result = if let Err(err) = self.engine.check_syntax(code) {
            ExecutionResult::failure(
                request_id,
                err.code(),
                err.to_string(),
                ExecutionMetadata::default(),
            )
        } else {
            let input_size = context.input.to_string().len();
            match host.reserve(input_size) {
                Err(err) => ExecutionResult::failure(
                    request_id,
                    err.code(),
                    err.to_string(),
                    ExecutionMetadata::default(),
                ),
                Ok(()) => self.run(&host, context, code, budget).await,
            }
        };

        let result = finish(result, &host, started);
        self.state = if result.success {
            SandboxState::Completed
        } else {
            SandboxState::Errored
        };
        debug!(%request_id, state = ?self.state, "sandbox execution finished");
        Ok(result)
    }

    async fn run(
        &self,
        host: &Arc<SandboxHost>,
        context: ExecutionContext,
        code: &str,
        budget: Duration,
    ) -> ExecutionResult {
        let request_id = context.request_id;
        let invocation = ScriptInvocation {
            capability: context.capability,
            input: context.input,
            code: Arc::from(code),
        };
        let engine_started = Instant::now();
        let run = AssertUnwindSafe(self.engine.run(invocation, Arc::clone(host))).catch_unwind();

        let outcome = tokio::time::timeout(budget, run).await;
        let metadata = ExecutionMetadata {
            cpu_time_ms: millis(engine_started.elapsed()),
            ..ExecutionMetadata::default()
        };

        match outcome {
            Ok(Ok(Ok(output))) => ExecutionResult::success(request_id, output, metadata),
            Ok(Ok(Err(err))) => {
                debug!(%request_id, error = %err, "agent code failed");
                ExecutionResult::failure(request_id, err.code(), err.to_string(), metadata)
                    .with_stack(err.stack())
            }
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                warn!(%request_id, %message, "agent code panicked");
                ExecutionResult::failure(
                    request_id,
                    ErrorCode::ExecutionError,
                    format!("agent code panicked: {message}"),
                    metadata,
                )
            }
            Err(_) => {
                warn!(%request_id, timeout_ms = millis(budget), "execution timed out");
                ExecutionResult::failure(
                    request_id,
                    ErrorCode::Timeout,
                    format!("execution exceeded {} ms", millis(budget)),
                    metadata,
                )
            }
        }
    }

    /// Releases the host surface. Idempotent.
    pub fn cleanup(&mut self) {
        if self.state == SandboxState::Disposed {
            return;
        }
        self.host = None;
        debug!(from = ?self.state, "sandbox disposed");
        self.state = SandboxState::Disposed;
    }

    fn expect_state(&self, expected: SandboxState, operation: &'static str) -> SandboxResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SandboxError::InvalidState {
                state: self.state,
                operation,
            })
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn finish(result: ExecutionResult, host: &SandboxHost, started: Instant) -> ExecutionResult {
    let mut result = result.with_logs(host.take_logs());
    result.metadata.execution_time_ms = millis(started.elapsed());
    result.metadata.memory_used_bytes = host.memory_peak() as u64;
    result.metadata.network_requests = host.network_requests();
    result
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NativeEngine, NetworkRequest, NetworkResponse, ScriptError, ScriptResult};
    use agent_primitives::{InstanceId, RequestId};
    use async_trait::async_trait;
    use serde_json::{Value, json};

    const CODE: &str = "async function run(input) { return input; }";

    fn factory() -> SandboxFactory {
        let engine = NativeEngine::new();
        engine
            .register("echo", |input: Value, host: Arc<SandboxHost>| async move {
                host.info("echoing");
                Ok(input)
            })
            .unwrap();
        engine
            .register("slow", |_: Value, host: Arc<SandboxHost>| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                host.info("unreachable");
                Ok(Value::Null)
            })
            .unwrap();
        engine
            .register("boom", |_: Value, _: Arc<SandboxHost>| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(Value::Null)
            })
            .unwrap();
        engine
            .register("hog", |_: Value, host: Arc<SandboxHost>| async move {
                host.reserve(host.memory_limit() + 1)?;
                Ok(Value::Null)
            })
            .unwrap();
        engine
            .register("fail", |_: Value, _: Arc<SandboxHost>| async move {
                Err(ScriptError::execution("bad input"))
            })
            .unwrap();
        engine
            .register("fetch", |input: Value, host: Arc<SandboxHost>| async move {
                let url = input["url"].as_str().unwrap_or_default();
                let url = url::Url::parse(url).map_err(|e| ScriptError::execution(e.to_string()))?;
                let response = host.fetch(NetworkRequest::get(url)).await?;
                Ok(json!({ "status": response.status }))
            })
            .unwrap();
        SandboxFactory::new(Arc::new(engine))
    }

    fn context(capability: &str, timeout: Duration) -> ExecutionContext {
        ExecutionContext::new(
            InstanceId::random(),
            RequestId::random(),
            "u1",
            capability,
            json!({ "text": "hello" }),
            timeout,
        )
    }

    async fn run(
        factory: &SandboxFactory,
        policy: SecurityPolicy,
        capability: &str,
        timeout: Duration,
    ) -> ExecutionResult {
        let mut sandbox = factory.create(policy);
        sandbox.initialize().unwrap();
        sandbox
            .execute(context(capability, timeout), CODE)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn successful_execution_populates_metadata() {
        let factory = factory();
        let mut sandbox = factory.create(SecurityPolicy::default());
        sandbox.initialize().unwrap();
        let result = sandbox
            .execute(context("echo", Duration::from_secs(1)), CODE)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.output, Some(json!({ "text": "hello" })));
        assert!(result.metadata.memory_used_bytes > 0);
        assert_eq!(result.logs.len(), 1);
        assert_eq!(sandbox.state(), SandboxState::Completed);

        sandbox.cleanup();
        sandbox.cleanup();
        assert_eq!(sandbox.state(), SandboxState::Disposed);
        assert!(sandbox.host().is_none());
    }

    #[tokio::test]
    async fn timeout_is_bounded() {
        let started = std::time::Instant::now();
        let result = run(
            &factory(),
            SecurityPolicy::default(),
            "slow",
            Duration::from_millis(50),
        )
        .await;
        assert!(!result.success);
        assert_eq!(result.error_code(), Some(ErrorCode::Timeout));
        assert!(started.elapsed() < Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn panics_are_captured() {
        let result = run(
            &factory(),
            SecurityPolicy::default(),
            "boom",
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(result.error_code(), Some(ErrorCode::ExecutionError));
        assert!(result.error.unwrap().message.contains("kaboom"));
    }

    #[tokio::test]
    async fn failures_map_to_codes() {
        let factory = factory();
        let hog = run(&factory, SecurityPolicy::default(), "hog", Duration::from_secs(1)).await;
        assert_eq!(hog.error_code(), Some(ErrorCode::MemoryLimitExceeded));

        let fail = run(&factory, SecurityPolicy::default(), "fail", Duration::from_secs(1)).await;
        assert_eq!(fail.error_code(), Some(ErrorCode::ExecutionError));

        let unknown = run(&factory, SecurityPolicy::default(), "nope", Duration::from_secs(1)).await;
        assert_eq!(unknown.error_code(), Some(ErrorCode::ExecutionError));
    }

    #[tokio::test]
    async fn syntax_errors_short_circuit() {
        let mut sandbox = factory().create(SecurityPolicy::default());
        sandbox.initialize().unwrap();
        let result = sandbox
            .execute(context("echo", Duration::from_secs(1)), "function f( {")
            .await
            .unwrap();
        assert_eq!(result.error_code(), Some(ErrorCode::SyntaxError));
        assert_eq!(sandbox.state(), SandboxState::Errored);
    }

    struct OkClient;

    #[async_trait]
    impl NetworkClient for OkClient {
        async fn send(&self, _request: NetworkRequest) -> ScriptResult<NetworkResponse> {
            Ok(NetworkResponse {
                status: 200,
                headers: Default::default(),
                body: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn network_is_filtered() {
        let factory = factory().with_network_client(Arc::new(OkClient));
        let policy = SecurityPolicy::default().with_allowed_domains(["api.example.com"]);

        let mut sandbox = factory.create(policy.clone());
        sandbox.initialize().unwrap();
        let mut ctx = context("fetch", Duration::from_secs(1));
        ctx.input = json!({ "url": "https://api.example.com/data" });
        let allowed = sandbox.execute(ctx, CODE).await.unwrap();
        assert!(allowed.success);
        assert_eq!(allowed.metadata.network_requests, 1);

        let mut sandbox = factory.create(policy);
        sandbox.initialize().unwrap();
        let mut ctx = context("fetch", Duration::from_secs(1));
        ctx.input = json!({ "url": "https://evil.org/steal" });
        let denied = sandbox.execute(ctx, CODE).await.unwrap();
        assert_eq!(denied.error_code(), Some(ErrorCode::NetworkDenied));

        let mut sandbox = factory.create(SecurityPolicy::default());
        sandbox.initialize().unwrap();
        let mut ctx = context("fetch", Duration::from_secs(1));
        ctx.input = json!({ "url": "https://api.example.com/data" });
        let disabled = sandbox.execute(ctx, CODE).await.unwrap();
        assert_eq!(disabled.error_code(), Some(ErrorCode::NetworkDenied));
    }

    #[tokio::test]
    async fn illegal_transitions_error() {
        let factory = factory();
        let mut sandbox = factory.create(SecurityPolicy::default());
        let err = sandbox
            .execute(context("echo", Duration::from_secs(1)), CODE)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidState { .. }));

        sandbox.initialize().unwrap();
        assert!(sandbox.initialize().is_err());
        sandbox
            .execute(context("echo", Duration::from_secs(1)), CODE)
            .await
            .unwrap();
        assert!(
            sandbox
                .execute(context("echo", Duration::from_secs(1)), CODE)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn invalid_policy_fails_initialize() {
        let mut sandbox = factory().create(SecurityPolicy::default().with_memory_limit_mb(4096));
        let err = sandbox.initialize().unwrap_err();
        assert!(matches!(err, SandboxError::Policy { .. }));
    }
}
