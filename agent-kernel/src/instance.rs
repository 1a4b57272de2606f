//! Agent instances and their status state machine.

use std::collections::HashMap;

use agent_primitives::{AgentId, InstanceId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Status an instance can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Ready, nothing running.
    Idle,
    /// At least one execution in flight.
    Running,
    /// Temporarily refusing executions.
    Paused,
    /// Last execution hit a sandbox failure.
    Error,
    /// Deleted. Terminal.
    Terminated,
}

impl InstanceStatus {
    /// Returns `true` once the instance has terminated.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Returns `true` when the instance accepts executions.
    #[must_use]
    pub const fn accepts_executions(self) -> bool {
        matches!(self, Self::Idle | Self::Running | Self::Error)
    }
}

/// Events that drive status transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceEvent {
    /// An execution began.
    ExecutionStarted,
    /// An execution finished; carries how many remain for the instance.
    ExecutionFinished {
        /// Executions still in flight for the instance.
        remaining: usize,
    },
    /// The sandbox failed fatally.
    ExecutionFailed,
    /// Stop accepting executions.
    Pause,
    /// Accept executions again.
    Resume,
    /// Delete the instance.
    Terminate,
}

/// Usage figures folded in after each execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Peak memory of the most recent execution, in bytes.
    pub memory_used: u64,
    /// Accumulated engine time, in milliseconds.
    pub cpu_used: u64,
    /// Accumulated permitted network calls.
    pub network_used: u64,
}

/// A live per-user allocation of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInstance {
    /// Instance id.
    pub id: InstanceId,
    /// Agent this instance runs.
    pub agent_id: AgentId,
    /// Owning user.
    pub user_id: UserId,
    /// Current status.
    pub status: InstanceStatus,
    /// Caller-supplied configuration.
    pub config: Map<String, Value>,
    /// Environment visible to executions, subject to the policy allow list.
    pub environment: HashMap<String, String>,
    /// Usage so far.
    pub resources: ResourceSnapshot,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last execution start or finish.
    pub last_active_at: DateTime<Utc>,
    /// Set once terminated.
    pub terminated_at: Option<DateTime<Utc>>,
}

impl AgentInstance {
    pub(crate) fn new(
        agent_id: AgentId,
        user_id: UserId,
        config: Map<String, Value>,
        environment: HashMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::random(),
            agent_id,
            user_id,
            status: InstanceStatus::Idle,
            config,
            environment,
            resources: ResourceSnapshot::default(),
            created_at: now,
            last_active_at: now,
            terminated_at: None,
        }
    }

    /// Applies an event, returning the resulting status.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::InvalidTransition`] when the event is not
    /// allowed from the current status.
    pub fn transition(&mut self, event: InstanceEvent) -> Result<InstanceStatus, TransitionError> {
        use InstanceStatus::{Error, Idle, Paused, Running, Terminated};

        let next = match (self.status, event) {
            (Idle | Running | Error, InstanceEvent::ExecutionStarted) => Some(Running),
            (Running, InstanceEvent::ExecutionFinished { remaining }) => {
                Some(if remaining > 0 { Running } else { Idle })
            }
            (Paused | Error, InstanceEvent::ExecutionFinished { .. }) => Some(self.status),
            (Idle | Running | Paused | Error, InstanceEvent::ExecutionFailed) => Some(Error),
            (Idle | Running | Error, InstanceEvent::Pause) => Some(Paused),
            (Paused, InstanceEvent::Resume) => Some(Idle),
            (_, InstanceEvent::Terminate) => Some(Terminated),
            _ => None,
        };

        let Some(next) = next else {
            return Err(TransitionError::InvalidTransition {
                instance_id: self.id,
                from: self.status,
                event,
            });
        };

        let now = Utc::now();
        if next != self.status {
            debug!(
                instance_id = %self.id,
                from = ?self.status,
                to = ?next,
                ?event,
                "instance status transition"
            );
            self.status = next;
        }
        if next == Terminated && self.terminated_at.is_none() {
            self.terminated_at = Some(now);
        }
        if matches!(
            event,
            InstanceEvent::ExecutionStarted | InstanceEvent::ExecutionFinished { .. }
        ) {
            self.last_active_at = now;
        }
        Ok(self.status)
    }
}

/// Rejected status transition.
#[derive(Debug, Error)]
pub enum TransitionError {
    /// Transition was not permitted from the current status.
    #[error("invalid transition from {from:?} via {event:?} for instance {instance_id}")]
    InvalidTransition {
        /// Instance whose transition failed.
        instance_id: InstanceId,
        /// Status prior to the attempt.
        from: InstanceStatus,
        /// Event that was rejected.
        event: InstanceEvent,
    },
}
