//! Signals published on the runtime bus.

use agent_primitives::{AgentId, InstanceId, RequestId, UserId};
use agent_sandbox::ErrorCode;
use serde::{Deserialize, Serialize};

use crate::InstanceStatus;

/// Lifecycle signal emitted by [`crate::RuntimeManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// A new instance exists.
    InstanceCreated {
        /// New instance.
        instance_id: InstanceId,
        /// Agent it runs.
        agent_id: AgentId,
        /// Owner.
        user_id: UserId,
    },
    /// An execution joined the wait queue.
    ExecutionQueued {
        /// Queued request.
        request_id: RequestId,
        /// Target instance.
        instance_id: InstanceId,
        /// 1-based queue position at enqueue time.
        position: usize,
    },
    /// An execution acquired capacity and started.
    ExecutionStarted {
        /// Request.
        request_id: RequestId,
        /// Target instance.
        instance_id: InstanceId,
        /// Capability name.
        capability: String,
    },
    /// An execution produced its result.
    ExecutionCompleted {
        /// Request.
        request_id: RequestId,
        /// Target instance.
        instance_id: InstanceId,
        /// Calling user.
        user_id: UserId,
        /// Whether it succeeded.
        success: bool,
        /// Failure code, if any.
        error_code: Option<ErrorCode>,
        /// Wall time in milliseconds.
        execution_time_ms: u64,
    },
    /// An instance changed status outside of execution bookkeeping.
    InstanceStatusChanged {
        /// Instance.
        instance_id: InstanceId,
        /// New status.
        status: InstanceStatus,
    },
    /// An instance was deleted.
    InstanceTerminated {
        /// Deleted instance.
        instance_id: InstanceId,
        /// Owner.
        user_id: UserId,
        /// Executions aborted by the deletion.
        aborted_executions: usize,
    },
}
