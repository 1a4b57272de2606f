//! Signals published on the security bus.

use agent_primitives::{ThreatId, UserId};
use serde::{Deserialize, Serialize};

use crate::{Permission, ResponseAction, ThreatDetection};

/// Signal emitted by [`crate::SecurityManager`].
///
/// Consumers subscribe through [`crate::SecurityManager::subscribe`]. A lagging
/// subscriber loses the oldest signals rather than slowing the manager down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecurityEvent {
    /// A permission check passed.
    PermissionGranted {
        /// Checked user.
        user_id: UserId,
        /// Checked permission.
        permission: Permission,
    },
    /// A permission check failed.
    PermissionDenied {
        /// Checked user.
        user_id: UserId,
        /// Missing permission.
        permission: Permission,
    },
    /// A security policy failed validation.
    PolicyRejected {
        /// Every hard deny that applied.
        violations: Vec<String>,
    },
    /// A threat was recorded.
    ThreatDetected {
        /// The stored record.
        threat: Box<ThreatDetection>,
    },
    /// A threat was closed by an operator.
    ThreatResolved {
        /// Closed threat.
        threat_id: ThreatId,
        /// Operator.
        resolved_by: UserId,
    },
    /// An automated response was requested for a critical threat.
    ResponseDispatched {
        /// Triggering threat.
        threat_id: ThreatId,
        /// Requested action.
        action: ResponseAction,
    },
    /// A user's resource quota was withdrawn.
    QuotaRevoked {
        /// Affected user.
        user_id: UserId,
    },
}
