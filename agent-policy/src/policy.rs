//! Resource, network, and isolation policy applied to sandboxed executions.

use serde::{Deserialize, Serialize};

use crate::decision::{DenyRule, NetworkDecision};
use crate::{PolicyError, PolicyResult};

/// Largest memory ceiling any policy may request, in megabytes.
pub const MAX_MEMORY_MB: u32 = 1024;
/// Longest execution time any policy may request, in milliseconds.
pub const MAX_EXECUTION_TIME_MS: u64 = 300_000;

/// Outbound network rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPolicy {
    /// Whether agent code may issue network calls at all.
    pub enabled: bool,
    /// Hosts that may be contacted. Empty means "any host not blocked".
    pub allowed_domains: Vec<String>,
    /// Hosts that may never be contacted.
    pub blocked_domains: Vec<String>,
    /// Ports that may be contacted. Empty means any port.
    pub allowed_ports: Vec<u16>,
}

impl NetworkPolicy {
    /// Decides whether a call to `host:port` is permitted.
    ///
    /// The block list is consulted first, then the allow list (when non-empty),
    /// then the port allowlist.
    #[must_use]
    pub fn check(&self, host: &str, port: Option<u16>) -> NetworkDecision {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if !self.enabled {
            return NetworkDecision::deny(DenyRule::Disabled, &host, port);
        }

        if self
            .blocked_domains
            .iter()
            .any(|domain| domain_matches(&host, domain))
        {
            return NetworkDecision::deny(DenyRule::BlockedHost, &host, port);
        }

        if !self.allowed_domains.is_empty()
            && !self
                .allowed_domains
                .iter()
                .any(|domain| domain_matches(&host, domain))
        {
            return NetworkDecision::deny(DenyRule::NotAllowListed, &host, port);
        }

        if let Some(port) = port {
            if !self.allowed_ports.is_empty() && !self.allowed_ports.contains(&port) {
                return NetworkDecision::deny(DenyRule::PortNotAllowed, &host, Some(port));
            }
        }

        NetworkDecision::Allow
    }
}

fn domain_matches(host: &str, pattern: &str) -> bool {
    let pattern = pattern.trim().to_ascii_lowercase();
    let pattern = pattern.strip_prefix("*.").unwrap_or(&pattern);
    if pattern.is_empty() {
        return false;
    }
    host == pattern
        || host
            .strip_suffix(pattern)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Hard resource ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceCeilings {
    /// Memory ceiling in megabytes.
    pub max_memory_mb: u32,
    /// CPU share ceiling in percent.
    pub max_cpu_percent: u32,
    /// Wall-clock ceiling in milliseconds.
    pub max_execution_time_ms: u64,
}

impl Default for ResourceCeilings {
    fn default() -> Self {
        Self {
            max_memory_mb: 128,
            max_cpu_percent: 50,
            max_execution_time_ms: 30_000,
        }
    }
}

/// Sandbox isolation switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct IsolationFlags {
    /// Every execution gets its own context.
    pub isolate_context: bool,
    /// Host process, filesystem, and module bindings are removed.
    pub strip_host_bindings: bool,
    /// Only allow-listed environment variables are visible.
    pub filter_environment: bool,
}

impl Default for IsolationFlags {
    fn default() -> Self {
        Self {
            isolate_context: true,
            strip_host_bindings: true,
            filter_environment: true,
        }
    }
}

/// Complete policy applied to an agent execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    /// Outbound network rules.
    pub network: NetworkPolicy,
    /// Resource ceilings.
    pub resources: ResourceCeilings,
    /// Request for filesystem access. Always denied.
    pub filesystem_access: bool,
    /// Request for child-process access. Always denied.
    pub child_process_access: bool,
    /// Environment variable names agent code may read.
    pub allowed_env_vars: Vec<String>,
    /// Isolation switches.
    pub isolation: IsolationFlags,
}

impl SecurityPolicy {
    /// Returns a copy with network access enabled for the given allow list.
    #[must_use]
    pub fn with_allowed_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.network.enabled = true;
        self.network.allowed_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    /// Returns a copy with the memory ceiling replaced.
    #[must_use]
    pub fn with_memory_limit_mb(mut self, mb: u32) -> Self {
        self.resources.max_memory_mb = mb;
        self
    }

    /// Returns a copy with the execution time ceiling replaced.
    #[must_use]
    pub fn with_max_execution_time_ms(mut self, ms: u64) -> Self {
        self.resources.max_execution_time_ms = ms;
        self
    }

    /// Returns a copy exposing the named environment variables.
    #[must_use]
    pub fn with_allowed_env_vars<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_env_vars = names.into_iter().map(Into::into).collect();
        self
    }
}

/// Applies the hard denies every policy must pass.
///
/// # Errors
///
/// Returns [`PolicyError::Violation`] listing every rule the policy breaks:
/// memory above 1024 MB, execution time above 300 000 ms, network enabled
/// without any domain list, or any filesystem/child-process request.
pub fn validate_policy(policy: &SecurityPolicy) -> PolicyResult<()> {
    let mut violations = Vec::new();

    if policy.resources.max_memory_mb > MAX_MEMORY_MB {
        violations.push(format!(
            "memory limit {} MB exceeds {MAX_MEMORY_MB} MB",
            policy.resources.max_memory_mb
        ));
    }
    if policy.resources.max_execution_time_ms > MAX_EXECUTION_TIME_MS {
        violations.push(format!(
            "execution time {} ms exceeds {MAX_EXECUTION_TIME_MS} ms",
            policy.resources.max_execution_time_ms
        ));
    }
    if policy.network.enabled
        && policy.network.allowed_domains.is_empty()
        && policy.network.blocked_domains.is_empty()
    {
        violations.push("network access requires an allow or block list".to_owned());
    }
    if policy.filesystem_access {
        violations.push("filesystem access is not permitted".to_owned());
    }
    if policy.child_process_access {
        violations.push("child process access is not permitted".to_owned());
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(PolicyError::Violation { violations })
    }
}
