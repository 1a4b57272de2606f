//! Instance ownership, admission control and execution dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use agent_policy::policy::MAX_EXECUTION_TIME_MS;
use agent_policy::{Permission, PolicyError, SecurityEvent, SecurityManager, SecurityPolicy, validate_policy};
use agent_primitives::{AgentMetadata, InstanceId, RequestId, UserId};
use agent_sandbox::{ErrorCode, ExecutionContext, ExecutionMetadata, ExecutionResult, SandboxFactory};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::admission::{Admission, AdmissionControl, AdmissionSlot};
use crate::{
    AgentInstance, InstanceEvent, InstanceStatus, RuntimeConfig, RuntimeError, RuntimeEvent,
    RuntimeResult,
};

const EVENT_CAPACITY: usize = 256;

/// Input to [`RuntimeManager::create_instance`].
#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    /// Agent to instantiate.
    pub metadata: AgentMetadata,
    /// Agent source text.
    pub code: String,
    /// Owning user.
    pub user_id: UserId,
    /// Caller configuration.
    pub config: Map<String, Value>,
    /// Instance environment.
    pub environment: HashMap<String, String>,
    /// Policy override; defaults to one derived from the agent's resources.
    pub policy: Option<SecurityPolicy>,
}

impl CreateInstanceRequest {
    /// Creates a request with empty config and environment.
    #[must_use]
    pub fn new(metadata: AgentMetadata, code: impl Into<String>, user_id: impl Into<UserId>) -> Self {
        Self {
            metadata,
            code: code.into(),
            user_id: user_id.into(),
            config: Map::new(),
            environment: HashMap::new(),
            policy: None,
        }
    }

    /// Attaches configuration.
    #[must_use]
    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    /// Attaches an environment.
    #[must_use]
    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    /// Overrides the security policy.
    #[must_use]
    pub fn with_policy(mut self, policy: SecurityPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// Input to [`RuntimeManager::execute_capability`].
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Target instance.
    pub instance_id: InstanceId,
    /// Calling user; must own the instance.
    pub user_id: UserId,
    /// Capability name.
    pub capability: String,
    /// Capability input.
    pub input: Value,
    /// Per-call timeout override.
    pub timeout: Option<Duration>,
    /// Extra environment merged over the instance's.
    pub environment: HashMap<String, String>,
}

impl ExecutionRequest {
    /// Creates a request using the agent's declared timeout.
    #[must_use]
    pub fn new(
        instance_id: InstanceId,
        user_id: impl Into<UserId>,
        capability: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            instance_id,
            user_id: user_id.into(),
            capability: capability.into(),
            input,
            timeout: None,
            environment: HashMap::new(),
        }
    }

    /// Overrides the timeout for this call.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds per-call environment.
    #[must_use]
    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }
}

/// Point-in-time runtime figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStats {
    /// Live instances.
    pub total_instances: usize,
    /// Idle instances.
    pub idle: usize,
    /// Running instances.
    pub running: usize,
    /// Paused instances.
    pub paused: usize,
    /// Errored instances.
    pub error: usize,
    /// Instances deleted since start.
    pub terminated: usize,
    /// Executions holding capacity.
    pub active_executions: usize,
    /// Executions waiting for capacity.
    pub queued_executions: usize,
}

struct InstanceRecord {
    instance: AgentInstance,
    metadata: Arc<AgentMetadata>,
    code: Arc<str>,
    policy: SecurityPolicy,
}

struct ActiveExecution {
    instance_id: InstanceId,
    user_id: UserId,
    abort: AbortHandle,
}

struct Shared {
    config: RuntimeConfig,
    factory: SandboxFactory,
    security: Option<Arc<SecurityManager>>,
    instances: RwLock<HashMap<InstanceId, InstanceRecord>>,
    active: Mutex<HashMap<RequestId, ActiveExecution>>,
    admission: Arc<AdmissionControl>,
    events: broadcast::Sender<RuntimeEvent>,
    terminated: AtomicUsize,
}

/// Builder for [`RuntimeManager`].
#[derive(Debug)]
pub struct RuntimeManagerBuilder {
    factory: SandboxFactory,
    config: RuntimeConfig,
    security: Option<Arc<SecurityManager>>,
}

impl RuntimeManagerBuilder {
    /// Replaces the configuration.
    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Attaches a security manager for permission and quota enforcement.
    #[must_use]
    pub fn security(mut self, security: Arc<SecurityManager>) -> Self {
        self.security = Some(security);
        self
    }

    /// Builds the manager and starts its background tasks.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn build(self) -> RuntimeManager {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            admission: AdmissionControl::new(self.config.max_concurrent_executions().get()),
            config: self.config,
            factory: self.factory,
            security: self.security,
            instances: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            events,
            terminated: AtomicUsize::new(0),
        });

        let mut workers = vec![tokio::spawn(sweep_queue(
            Arc::downgrade(&shared),
            shared.config.queue_sweep_interval(),
        ))];
        if let Some(security) = &shared.security {
            workers.push(tokio::spawn(watch_quota(
                Arc::downgrade(&shared),
                security.subscribe(),
            )));
        }

        info!(
            max_concurrent_executions = shared.config.max_concurrent_executions().get(),
            sweep_interval_ms = shared.config.queue_sweep_interval().as_millis(),
            "runtime manager started"
        );
        RuntimeManager {
            shared,
            workers: Mutex::new(workers),
        }
    }
}

/// Owns agent instances and dispatches capability executions.
///
/// A single global admission ceiling is shared by every instance and user.
/// Calls beyond it wait in a FIFO queue drained by a fixed-interval sweep.
/// Each execution gets a fresh sandbox, tracked in an active table so that
/// deleting an instance can abort its in-flight work.
pub struct RuntimeManager {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RuntimeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeManager")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl RuntimeManager {
    /// Starts building a manager over `factory`.
    #[must_use]
    pub fn builder(factory: SandboxFactory) -> RuntimeManagerBuilder {
        RuntimeManagerBuilder {
            factory,
            config: RuntimeConfig::default(),
            security: None,
        }
    }

    /// Subscribes to runtime signals.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.shared.events.subscribe()
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> RuntimeConfig {
        self.shared.config
    }

    /// Creates an idle instance of an agent.
    ///
    /// # Errors
    ///
    /// With a security manager attached: [`PolicyError::PermissionDenied`]
    /// without the create grant and [`PolicyError::QuotaExceeded`] past the
    /// user's instance or memory limits. Always: [`PolicyError::Violation`]
    /// for a policy that breaks a hard deny.
    pub async fn create_instance(&self, request: CreateInstanceRequest) -> RuntimeResult<AgentInstance> {
        let shared = &self.shared;
        let policy = request
            .policy
            .unwrap_or_else(|| default_policy(&request.metadata));

        let mut max_agents = None;
        if let Some(security) = &shared.security {
            security
                .check_permission(&request.user_id, Permission::CreateInstances)
                .await?;
            let limits = security.user_permissions(&request.user_id).await.limits;
            let memory = request.metadata.resources().memory_limit_mb;
            if memory > limits.max_memory_per_agent_mb {
                return Err(quota(
                    &request.user_id,
                    format!(
                        "agent requests {memory} MB, limit is {} MB",
                        limits.max_memory_per_agent_mb
                    ),
                ));
            }
            max_agents = Some(limits.max_agents);
            security.validate_policy(&policy).await?;
        } else {
            validate_policy(&policy)?;
        }

        let instance = AgentInstance::new(
            request.metadata.id(),
            request.user_id,
            request.config,
            request.environment,
        );
        {
            let mut instances = shared.write_instances();
            if let Some(max_agents) = max_agents {
                let owned = instances
                    .values()
                    .filter(|record| record.instance.user_id == instance.user_id)
                    .count();
                if owned >= max_agents {
                    return Err(quota(
                        &instance.user_id,
                        format!("instance limit of {max_agents} reached"),
                    ));
                }
            }
            instances.insert(
                instance.id,
                InstanceRecord {
                    instance: instance.clone(),
                    metadata: Arc::new(request.metadata),
                    code: Arc::from(request.code),
                    policy,
                },
            );
        }

        info!(
            instance_id = %instance.id,
            agent_id = %instance.agent_id,
            user_id = %instance.user_id,
            "instance created"
        );
        shared.emit(RuntimeEvent::InstanceCreated {
            instance_id: instance.id,
            agent_id: instance.agent_id,
            user_id: instance.user_id.clone(),
        });
        Ok(instance)
    }

    /// Deletes an instance, aborting its in-flight executions first.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InstanceNotFound`] for an unknown id.
    pub fn delete_instance(&self, id: InstanceId) -> RuntimeResult<AgentInstance> {
        self.shared.delete_instance(id)
    }

    /// Deletes every instance owned by `user_id`, returning their ids.
    pub fn terminate_user_instances(&self, user_id: &str) -> Vec<InstanceId> {
        self.shared.terminate_user_instances(user_id)
    }

    /// Stops an instance from accepting executions.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InstanceNotFound`] or a transition error.
    pub fn pause_instance(&self, id: InstanceId) -> RuntimeResult<AgentInstance> {
        self.shared.apply(id, InstanceEvent::Pause)
    }

    /// Lets a paused instance accept executions again.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InstanceNotFound`] or a transition error.
    pub fn resume_instance(&self, id: InstanceId) -> RuntimeResult<AgentInstance> {
        self.shared.apply(id, InstanceEvent::Resume)
    }

    /// Returns a snapshot of an instance.
    #[must_use]
    pub fn get_instance(&self, id: InstanceId) -> Option<AgentInstance> {
        self.shared
            .read_instances()
            .get(&id)
            .map(|record| record.instance.clone())
    }

    /// Returns the metadata an instance was created from.
    #[must_use]
    pub fn instance_metadata(&self, id: InstanceId) -> Option<Arc<AgentMetadata>> {
        self.shared
            .read_instances()
            .get(&id)
            .map(|record| Arc::clone(&record.metadata))
    }

    /// Lists live instances, optionally for one user, oldest first.
    #[must_use]
    pub fn list_instances(&self, user_id: Option<&str>) -> Vec<AgentInstance> {
        let mut instances: Vec<_> = self
            .shared
            .read_instances()
            .values()
            .filter(|record| user_id.is_none_or(|user| record.instance.user_id == user))
            .map(|record| record.instance.clone())
            .collect();
        instances.sort_by_key(|instance| instance.created_at);
        instances
    }

    /// Counts executions currently bound to an instance.
    #[must_use]
    pub fn active_executions_for(&self, id: InstanceId) -> usize {
        self.shared
            .lock_active()
            .values()
            .filter(|execution| execution.instance_id == id)
            .count()
    }

    /// Totals by status plus active and queued execution counts.
    #[must_use]
    pub fn stats(&self) -> RuntimeStats {
        let mut stats = RuntimeStats {
            terminated: self.shared.terminated.load(Ordering::Relaxed),
            active_executions: self.shared.lock_active().len(),
            queued_executions: self.shared.admission.queued(),
            ..RuntimeStats::default()
        };
        for record in self.shared.read_instances().values() {
            stats.total_instances += 1;
            match record.instance.status {
                InstanceStatus::Idle => stats.idle += 1,
                InstanceStatus::Running => stats.running += 1,
                InstanceStatus::Paused => stats.paused += 1,
                InstanceStatus::Error => stats.error += 1,
                InstanceStatus::Terminated => {}
            }
        }
        stats
    }

    /// Runs a capability, waiting in the queue when the runtime is saturated.
    ///
    /// Expected failures (agent faults, timeouts, resource violations,
    /// termination) come back as a failed [`ExecutionResult`].
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InstanceNotFound`],
    /// [`RuntimeError::CapabilityNotFound`], [`RuntimeError::NotOwner`] or
    /// [`RuntimeError::NotExecutable`] before admission; permission and quota
    /// failures when a security manager is attached; and
    /// [`RuntimeError::ShutDown`] if the manager stops while the call waits.
    pub async fn execute_capability(&self, request: ExecutionRequest) -> RuntimeResult<ExecutionResult> {
        let shared = &self.shared;
        shared.check_executable(&request)?;

        if let Some(security) = &shared.security {
            security
                .check_permission(&request.user_id, Permission::ExecuteAgents)
                .await?;
            let limit = security
                .user_permissions(&request.user_id)
                .await
                .limits
                .max_concurrent_executions;
            let running = shared
                .lock_active()
                .values()
                .filter(|execution| execution.user_id == request.user_id)
                .count();
            if running >= limit {
                return Err(quota(
                    &request.user_id,
                    format!("concurrent execution limit of {limit} reached"),
                ));
            }
        }

        let request_id = RequestId::random();
        let slot = match shared.admission.admit()? {
            Admission::Ready(slot) => slot,
            Admission::Queued { receiver, position } => {
                debug!(%request_id, instance_id = %request.instance_id, position, "execution queued");
                shared.emit(RuntimeEvent::ExecutionQueued {
                    request_id,
                    instance_id: request.instance_id,
                    position,
                });
                receiver.await.map_err(|_| RuntimeError::ShutDown)?
            }
        };

        Ok(shared.perform_execution(request_id, request, slot).await)
    }

    /// Stops the sweep, rejects queued callers and refuses new executions.
    pub fn shutdown(&self) {
        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if workers.is_empty() {
            return;
        }
        for worker in workers {
            worker.abort();
        }
        self.shared.admission.close();
        info!("runtime manager shut down");
    }
}

impl Drop for RuntimeManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn read_instances(&self) -> RwLockReadGuard<'_, HashMap<InstanceId, InstanceRecord>> {
        self.instances.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_instances(&self) -> RwLockWriteGuard<'_, HashMap<InstanceId, InstanceRecord>> {
        self.instances.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<RequestId, ActiveExecution>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }

    fn check_executable(&self, request: &ExecutionRequest) -> RuntimeResult<()> {
        let instances = self.read_instances();
        let record = instances
            .get(&request.instance_id)
            .ok_or(RuntimeError::InstanceNotFound {
                id: request.instance_id,
            })?;
        if record.instance.user_id != request.user_id {
            return Err(RuntimeError::NotOwner {
                id: request.instance_id,
                user_id: request.user_id.clone(),
            });
        }
        if !record.instance.status.accepts_executions() {
            return Err(RuntimeError::NotExecutable {
                id: request.instance_id,
                status: record.instance.status,
            });
        }
        if record.metadata.capability(&request.capability).is_none() {
            return Err(RuntimeError::CapabilityNotFound {
                instance_id: request.instance_id,
                capability: request.capability.clone(),
            });
        }
        Ok(())
    }

    async fn perform_execution(
        &self,
        request_id: RequestId,
        request: ExecutionRequest,
        slot: AdmissionSlot,
    ) -> ExecutionResult {
        let started = Instant::now();
        let instance_id = request.instance_id;
        let user_id = request.user_id.clone();
        let capability = request.capability.clone();

        let task = {
            let mut instances = self.write_instances();
            let Some(record) = instances.get_mut(&instance_id) else {
                return synthesized(
                    request_id,
                    ErrorCode::Terminated,
                    "instance was deleted while the execution was queued",
                    started,
                );
            };
            if let Err(err) = record.instance.transition(InstanceEvent::ExecutionStarted) {
                warn!(%request_id, %instance_id, error = %err, "queued execution refused");
                return synthesized(
                    request_id,
                    ErrorCode::RuntimeError,
                    format!("instance became {:?} while the execution was queued", record.instance.status),
                    started,
                );
            }

            let timeout = request.timeout.unwrap_or_else(|| {
                let declared = record.metadata.resources().timeout();
                if declared.is_zero() {
                    self.config.default_timeout()
                } else {
                    declared
                }
            });
            let mut environment = record.instance.environment.clone();
            environment.extend(request.environment);
            let context = ExecutionContext::new(
                instance_id,
                request_id,
                request.user_id,
                request.capability,
                request.input,
                timeout,
            )
            .with_environment(environment);

            let factory = self.factory.clone();
            let policy = record.policy.clone();
            let code = Arc::clone(&record.code);

            let task = tokio::spawn(async move {
                let _slot = slot;
                let mut sandbox = factory.create(policy);
                sandbox.initialize()?;
                let result = sandbox.execute(context, &code).await;
                sandbox.cleanup();
                result
            });
            self.lock_active().insert(
                request_id,
                ActiveExecution {
                    instance_id,
                    user_id: user_id.clone(),
                    abort: task.abort_handle(),
                },
            );
            task
        };

        debug!(%request_id, %instance_id, %capability, "execution started");
        self.emit(RuntimeEvent::ExecutionStarted {
            request_id,
            instance_id,
            capability,
        });

        let joined = task.await;
        let remaining = {
            let mut active = self.lock_active();
            active.remove(&request_id);
            active
                .values()
                .filter(|execution| execution.instance_id == instance_id)
                .count()
        };

        let (result, fatal) = match joined {
            Ok(Ok(result)) => (result, false),
            Ok(Err(err)) => {
                warn!(%request_id, %instance_id, error = %err, "sandbox failed");
                (
                    synthesized(request_id, ErrorCode::RuntimeError, err.to_string(), started),
                    true,
                )
            }
            Err(err) if err.is_cancelled() => (
                synthesized(
                    request_id,
                    ErrorCode::Terminated,
                    "instance was deleted during execution",
                    started,
                ),
                false,
            ),
            Err(err) => {
                warn!(%request_id, %instance_id, error = %err, "sandbox task failed");
                (
                    synthesized(
                        request_id,
                        ErrorCode::RuntimeError,
                        format!("sandbox task failed: {err}"),
                        started,
                    ),
                    true,
                )
            }
        };

        if let Some(record) = self.write_instances().get_mut(&instance_id) {
            let snapshot = &mut record.instance.resources;
            snapshot.memory_used = result.metadata.memory_used_bytes;
            snapshot.cpu_used += result.metadata.cpu_time_ms;
            snapshot.network_used += u64::from(result.metadata.network_requests);

            let event = if fatal {
                InstanceEvent::ExecutionFailed
            } else {
                InstanceEvent::ExecutionFinished { remaining }
            };
            if let Err(err) = record.instance.transition(event) {
                debug!(%instance_id, error = %err, "status left unchanged after execution");
            }
        }

        debug!(
            %request_id,
            %instance_id,
            success = result.success,
            execution_time_ms = result.metadata.execution_time_ms,
            "execution finished"
        );
        self.emit(RuntimeEvent::ExecutionCompleted {
            request_id,
            instance_id,
            user_id,
            success: result.success,
            error_code: result.error_code(),
            execution_time_ms: result.metadata.execution_time_ms,
        });
        result
    }

    fn delete_instance(&self, id: InstanceId) -> RuntimeResult<AgentInstance> {
        let (mut record, aborted) = {
            let mut instances = self.write_instances();
            if !instances.contains_key(&id) {
                return Err(RuntimeError::InstanceNotFound { id });
            }
            let aborted = {
                let mut active = self.lock_active();
                let bound: Vec<_> = active
                    .iter()
                    .filter(|(_, execution)| execution.instance_id == id)
                    .map(|(request_id, _)| *request_id)
                    .collect();
                for request_id in &bound {
                    if let Some(execution) = active.remove(request_id) {
                        execution.abort.abort();
                    }
                }
                bound.len()
            };
            let record = instances
                .remove(&id)
                .ok_or(RuntimeError::InstanceNotFound { id })?;
            (record, aborted)
        };

        record.instance.transition(InstanceEvent::Terminate)?;
        self.terminated.fetch_add(1, Ordering::Relaxed);
        info!(instance_id = %id, aborted, "instance terminated");
        self.emit(RuntimeEvent::InstanceTerminated {
            instance_id: id,
            user_id: record.instance.user_id.clone(),
            aborted_executions: aborted,
        });
        Ok(record.instance)
    }

    fn terminate_user_instances(&self, user_id: &str) -> Vec<InstanceId> {
        let owned: Vec<_> = self
            .read_instances()
            .values()
            .filter(|record| record.instance.user_id == user_id)
            .map(|record| record.instance.id)
            .collect();
        owned
            .into_iter()
            .filter(|id| self.delete_instance(*id).is_ok())
            .collect()
    }

    fn apply(&self, id: InstanceId, event: InstanceEvent) -> RuntimeResult<AgentInstance> {
        let instance = {
            let mut instances = self.write_instances();
            let record = instances
                .get_mut(&id)
                .ok_or(RuntimeError::InstanceNotFound { id })?;
            record.instance.transition(event)?;
            record.instance.clone()
        };
        self.emit(RuntimeEvent::InstanceStatusChanged {
            instance_id: id,
            status: instance.status,
        });
        Ok(instance)
    }
}

async fn sweep_queue(shared: Weak<Shared>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let admitted = shared.admission.sweep();
        if admitted > 0 {
            debug!(admitted, queued = shared.admission.queued(), "queue sweep admitted executions");
        }
    }
}

async fn watch_quota(shared: Weak<Shared>, mut events: broadcast::Receiver<SecurityEvent>) {
    loop {
        match events.recv().await {
            Ok(SecurityEvent::QuotaRevoked { user_id }) => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let terminated = shared.terminate_user_instances(&user_id);
                warn!(user_id = %user_id, terminated = terminated.len(), "instances terminated after quota revocation");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "runtime lagged behind security signals");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn default_policy(metadata: &AgentMetadata) -> SecurityPolicy {
    SecurityPolicy::default()
        .with_memory_limit_mb(metadata.resources().memory_limit_mb)
        .with_max_execution_time_ms(MAX_EXECUTION_TIME_MS)
}

fn quota(user_id: &str, reason: String) -> RuntimeError {
    PolicyError::QuotaExceeded {
        user_id: user_id.to_owned(),
        reason,
    }
    .into()
}

fn synthesized(
    request_id: RequestId,
    code: ErrorCode,
    message: impl Into<String>,
    started: Instant,
) -> ExecutionResult {
    let metadata = ExecutionMetadata {
        execution_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        ..ExecutionMetadata::default()
    };
    ExecutionResult::failure(request_id, code, message, metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_primitives::{AgentCapability, AgentId, CapabilityId};
    use agent_sandbox::{NativeEngine, SandboxHost};
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::num::NonZeroUsize;

    const CODE: &str = "export async function run(input) { return input; }";

    fn metadata() -> AgentMetadata {
        let capability = |name: &str| {
            AgentCapability::builder(CapabilityId::new(name).unwrap())
                .name(name)
                .unwrap()
                .description("test capability")
                .build()
                .unwrap()
        };
        AgentMetadata::builder(AgentId::random())
            .name("Tester")
            .unwrap()
            .version("1.0.0")
            .unwrap()
            .author("author")
            .unwrap()
            .description("agent used by runtime tests")
            .capabilities(vec![capability("echo"), capability("slow"), capability("stamp")])
            .build()
            .unwrap()
    }

    fn factory(starts: Arc<Mutex<Vec<DateTime<Utc>>>>) -> SandboxFactory {
        let engine = NativeEngine::new();
        engine
            .register("echo", |input: Value, _: Arc<SandboxHost>| async move { Ok(input) })
            .unwrap();
        engine
            .register("slow", |_: Value, host: Arc<SandboxHost>| async move {
                host.sleep(Duration::from_secs(5)).await;
                Ok(json!("done"))
            })
            .unwrap();
        engine
            .register("stamp", move |_: Value, host: Arc<SandboxHost>| {
                let starts = Arc::clone(&starts);
                async move {
                    starts.lock().unwrap().push(Utc::now());
                    host.sleep(Duration::from_millis(150)).await;
                    Ok(Value::Null)
                }
            })
            .unwrap();
        SandboxFactory::new(Arc::new(engine))
    }

    fn manager(max: usize) -> RuntimeManager {
        let config = RuntimeConfig::default()
            .with_max_concurrent_executions(NonZeroUsize::new(max).unwrap());
        RuntimeManager::builder(factory(Arc::default()))
            .config(config)
            .build()
    }

    async fn instance(manager: &RuntimeManager, user: &str) -> AgentInstance {
        manager
            .create_instance(CreateInstanceRequest::new(metadata(), CODE, user))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn executes_and_returns_to_idle() {
        let manager = manager(2);
        let mut events = manager.subscribe();
        let instance = instance(&manager, "u1").await;
        assert_eq!(instance.status, InstanceStatus::Idle);

        let result = manager
            .execute_capability(ExecutionRequest::new(instance.id, "u1", "echo", json!({"a": 1})))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, Some(json!({"a": 1})));

        let after = manager.get_instance(instance.id).unwrap();
        assert_eq!(after.status, InstanceStatus::Idle);
        assert!(after.resources.memory_used > 0);
        assert!(matches!(events.recv().await.unwrap(), RuntimeEvent::InstanceCreated { .. }));
        assert!(matches!(events.recv().await.unwrap(), RuntimeEvent::ExecutionStarted { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            RuntimeEvent::ExecutionCompleted { success: true, .. }
        ));
    }

    #[tokio::test]
    async fn rejects_unknown_targets() {
        let manager = manager(1);
        let instance = instance(&manager, "u1").await;

        let err = manager
            .execute_capability(ExecutionRequest::new(instance.id, "u1", "translate", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CapabilityNotFound { .. }));

        let err = manager
            .execute_capability(ExecutionRequest::new(InstanceId::random(), "u1", "echo", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InstanceNotFound { .. }));

        let err = manager
            .execute_capability(ExecutionRequest::new(instance.id, "u2", "echo", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotOwner { .. }));
    }

    #[tokio::test]
    async fn per_call_timeout_yields_timeout_result() {
        let manager = manager(1);
        let instance = instance(&manager, "u1").await;
        let started = std::time::Instant::now();
        let result = manager
            .execute_capability(
                ExecutionRequest::new(instance.id, "u1", "slow", Value::Null)
                    .with_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap();
        assert_eq!(result.error_code(), Some(ErrorCode::Timeout));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(manager.get_instance(instance.id).unwrap().status, InstanceStatus::Idle);
    }

    #[tokio::test]
    async fn nth_plus_one_waits_for_capacity() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let config = RuntimeConfig::default()
            .with_max_concurrent_executions(NonZeroUsize::new(2).unwrap());
        let manager = Arc::new(
            RuntimeManager::builder(factory(Arc::clone(&starts)))
                .config(config)
                .build(),
        );
        let instance = instance(&manager, "u1").await;

        let mut handles = Vec::new();
        for _ in 0..3 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager
                    .execute_capability(ExecutionRequest::new(instance.id, "u1", "stamp", Value::Null))
                    .await
                    .unwrap()
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::sleep(Duration::from_millis(30)).await;
        let stats = manager.stats();
        assert_eq!(stats.active_executions, 2);
        assert_eq!(stats.queued_executions, 1);
        assert_eq!(stats.running, 1);

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert!(results.iter().all(|result| result.success));

        let starts = starts.lock().unwrap().clone();
        assert_eq!(starts.len(), 3);
        let first_done = results[0].completed_at.min(results[1].completed_at);
        assert!(starts[2] >= first_done);
        assert_eq!(manager.stats().active_executions, 0);
    }

    #[tokio::test]
    async fn pausing_a_queued_target_fails_its_execution() {
        let manager = Arc::new(manager(1));
        let busy = instance(&manager, "u1").await.id;
        let queued = instance(&manager, "u1").await.id;

        let running = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .execute_capability(ExecutionRequest::new(busy, "u1", "stamp", Value::Null))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let waiting = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .execute_capability(ExecutionRequest::new(queued, "u1", "echo", Value::Null))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.stats().queued_executions, 1);
        manager.pause_instance(queued).unwrap();

        let refused = waiting.await.unwrap();
        assert!(!refused.success);
        assert_eq!(refused.error.unwrap().code, ErrorCode::RuntimeError);
        assert!(running.await.unwrap().success);
        assert_eq!(
            manager.get_instance(queued).unwrap().status,
            InstanceStatus::Paused
        );
        assert_eq!(manager.stats().active_executions, 0);
    }

    #[tokio::test]
    async fn delete_aborts_in_flight_executions() {
        let manager = Arc::new(manager(2));
        let instance = instance(&manager, "u1").await;

        let runner = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .execute_capability(ExecutionRequest::new(instance.id, "u1", "slow", Value::Null))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.active_executions_for(instance.id), 1);

        let deleted = manager.delete_instance(instance.id).unwrap();
        assert_eq!(deleted.status, InstanceStatus::Terminated);
        assert!(deleted.terminated_at.is_some());
        assert_eq!(manager.active_executions_for(instance.id), 0);

        let result = runner.await.unwrap();
        assert_eq!(result.error_code(), Some(ErrorCode::Terminated));
        assert!(manager.get_instance(instance.id).is_none());
        assert_eq!(manager.stats().terminated, 1);
    }

    #[tokio::test]
    async fn paused_instances_refuse_work() {
        let manager = manager(1);
        let instance = instance(&manager, "u1").await;
        manager.pause_instance(instance.id).unwrap();
        let err = manager
            .execute_capability(ExecutionRequest::new(instance.id, "u1", "echo", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotExecutable { .. }));
        manager.resume_instance(instance.id).unwrap();
        assert_eq!(manager.stats().idle, 1);
    }

    #[tokio::test]
    async fn security_quota_and_revocation() {
        let security = Arc::new(SecurityManager::new());
        let mut record = security.user_permissions("u1").await;
        record.limits.max_agents = 1;
        security.set_user_permissions(record).await;

        let manager = RuntimeManager::builder(factory(Arc::default()))
            .security(Arc::clone(&security))
            .build();
        let first = instance(&manager, "u1").await;
        let err = manager
            .create_instance(CreateInstanceRequest::new(metadata(), CODE, "u1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Policy {
                source: PolicyError::QuotaExceeded { .. }
            }
        ));

        security.revoke_quota("u1").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.get_instance(first.id).is_none());
        assert!(manager.list_instances(Some("u1")).is_empty());
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let manager = manager(1);
        let instance = instance(&manager, "u1").await;
        manager.shutdown();
        let err = manager
            .execute_capability(ExecutionRequest::new(instance.id, "u1", "echo", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ShutDown));
    }
}
