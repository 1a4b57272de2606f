//! User grants and per-user resource limits.

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};

use agent_primitives::UserId;
use serde::{Deserialize, Serialize};

/// A single grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Browse and read catalog entries.
    ReadAgents,
    /// Create agent instances.
    CreateInstances,
    /// Execute capabilities on owned instances.
    ExecuteAgents,
    /// Install catalog agents.
    InstallAgents,
    /// Publish agents to the catalog.
    PublishAgents,
    /// Review catalog agents.
    ReviewAgents,
    /// Flip the verified badge. Admin only.
    VerifyAgents,
    /// Resolve threats and manage other users' grants. Admin only.
    ManageSecurity,
}

impl Permission {
    /// Grants every user receives on first contact.
    pub const BASE: [Self; 6] = [
        Self::ReadAgents,
        Self::CreateInstances,
        Self::ExecuteAgents,
        Self::InstallAgents,
        Self::PublishAgents,
        Self::ReviewAgents,
    ];

    /// Returns the dotted label used in logs and audit records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadAgents => "agents.read",
            Self::CreateInstances => "instances.create",
            Self::ExecuteAgents => "agents.execute",
            Self::InstallAgents => "agents.install",
            Self::PublishAgents => "agents.publish",
            Self::ReviewAgents => "agents.review",
            Self::VerifyAgents => "agents.verify",
            Self::ManageSecurity => "security.manage",
        }
    }
}

impl Display for Permission {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-user resource ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Live instances the user may own.
    pub max_agents: usize,
    /// Memory ceiling per instance, in megabytes.
    pub max_memory_per_agent_mb: u32,
    /// Simultaneous executions the user may run.
    pub max_concurrent_executions: usize,
    /// Longest single execution, in milliseconds.
    pub max_execution_time_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_agents: 10,
            max_memory_per_agent_mb: 128,
            max_concurrent_executions: 5,
            max_execution_time_ms: 30_000,
        }
    }
}

/// Grants and limits held by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPermission {
    /// Owning user.
    pub user_id: UserId,
    /// Granted permissions.
    pub permissions: BTreeSet<Permission>,
    /// Resource ceilings.
    pub limits: ResourceLimits,
}

impl UserPermission {
    /// Default record provisioned on first check.
    #[must_use]
    pub fn with_defaults(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            permissions: Permission::BASE.into_iter().collect(),
            limits: ResourceLimits::default(),
        }
    }

    /// Returns `true` when the permission is granted.
    #[must_use]
    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_base_grant() {
        let record = UserPermission::with_defaults("u1");
        assert!(record.has(Permission::ExecuteAgents));
        assert!(!record.has(Permission::VerifyAgents));
        assert_eq!(record.limits.max_agents, 10);
        assert_eq!(record.limits.max_memory_per_agent_mb, 128);
        assert_eq!(record.limits.max_concurrent_executions, 5);
        assert_eq!(record.limits.max_execution_time_ms, 30_000);
    }
}
