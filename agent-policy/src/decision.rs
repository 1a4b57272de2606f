//! Verdicts returned by [`crate::NetworkPolicy::check`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which network rule refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyRule {
    /// The policy disables networking.
    Disabled,
    /// The host matched the block list.
    BlockedHost,
    /// An allow list exists and the host is not on it.
    NotAllowListed,
    /// A port allowlist exists and the port is not on it.
    PortNotAllowed,
}

/// Outcome of checking one `host:port` against a network policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum NetworkDecision {
    /// The call may proceed.
    Allow,
    /// The call is refused.
    Deny {
        /// Rule that fired.
        rule: DenyRule,
        /// Normalized host that was checked.
        host: String,
        /// Port that was checked, when known.
        port: Option<u16>,
    },
}

impl NetworkDecision {
    pub(crate) fn deny(rule: DenyRule, host: &str, port: Option<u16>) -> Self {
        Self::Deny {
            rule,
            host: host.to_owned(),
            port,
        }
    }

    /// `true` when the call may proceed.
    #[must_use]
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Rule that refused the call, if any.
    #[must_use]
    pub fn rule(&self) -> Option<DenyRule> {
        match self {
            Self::Allow => None,
            Self::Deny { rule, .. } => Some(*rule),
        }
    }
}

impl fmt::Display for NetworkDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => f.write_str("allowed"),
            Self::Deny { rule, host, port } => match rule {
                DenyRule::Disabled => f.write_str("network access is disabled"),
                DenyRule::BlockedHost => write!(f, "host `{host}` is blocked"),
                DenyRule::NotAllowListed => write!(f, "host `{host}` is not in the allow list"),
                DenyRule::PortNotAllowed => match port {
                    Some(port) => write!(f, "port {port} is not allowed"),
                    None => f.write_str("port is not allowed"),
                },
            },
        }
    }
}
