//! Signals published on the registry bus.

use agent_primitives::{AgentId, UserId};
use serde::{Deserialize, Serialize};

/// Catalog change emitted by [`crate::AgentRegistry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// A new agent was published.
    Published {
        /// Agent id.
        agent_id: AgentId,
        /// Publisher.
        author: UserId,
        /// SHA-256 of the code.
        checksum: String,
    },
    /// Metadata or code changed.
    Updated {
        /// Agent id.
        agent_id: AgentId,
        /// Whether the code, and so the checksum, changed.
        code_changed: bool,
    },
    /// The agent was removed.
    Deleted {
        /// Agent id.
        agent_id: AgentId,
    },
    /// A user installed the agent.
    Installed {
        /// Agent id.
        agent_id: AgentId,
        /// Installing user.
        user_id: UserId,
        /// Installs after this one.
        download_count: u64,
    },
    /// A review was added.
    Reviewed {
        /// Agent id.
        agent_id: AgentId,
        /// Reviewer.
        user_id: UserId,
        /// Submitted rating.
        rating: u8,
        /// New mean rating.
        average: f64,
    },
    /// The verification badge changed.
    Verified {
        /// Agent id.
        agent_id: AgentId,
        /// New badge value.
        verified: bool,
        /// Admin who changed it.
        by: UserId,
    },
}

impl RegistryEvent {
    /// Agent the event concerns.
    #[must_use]
    pub fn agent_id(&self) -> AgentId {
        match self {
            Self::Published { agent_id, .. }
            | Self::Updated { agent_id, .. }
            | Self::Deleted { agent_id }
            | Self::Installed { agent_id, .. }
            | Self::Reviewed { agent_id, .. }
            | Self::Verified { agent_id, .. } => *agent_id,
        }
    }
}
