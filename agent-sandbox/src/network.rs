//! Filtered outbound network access.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use agent_policy::NetworkPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::{ScriptError, ScriptResult};

/// Outbound request issued by agent code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    /// HTTP-style method.
    pub method: String,
    /// Target URL.
    pub url: Url,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Optional body.
    #[serde(default)]
    pub body: Option<String>,
}

impl NetworkRequest {
    /// Creates a `GET` request.
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            method: "GET".to_owned(),
            url,
            headers: BTreeMap::new(),
            body: None,
        }
    }
}

/// Response handed back to agent code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResponse {
    /// Status code.
    pub status: u16,
    /// Response headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Response body.
    pub body: String,
}

/// Transport the sandbox delegates permitted calls to.
///
/// The exchange ships no real transport; embedders inject one.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Performs the request.
    async fn send(&self, request: NetworkRequest) -> ScriptResult<NetworkResponse>;
}

/// Policy filter in front of a [`NetworkClient`].
#[derive(Clone)]
pub(crate) struct NetworkGate {
    policy: NetworkPolicy,
    client: Option<Arc<dyn NetworkClient>>,
}

impl fmt::Debug for NetworkGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkGate")
            .field("policy", &self.policy)
            .field("client", &self.client.is_some())
            .finish()
    }
}

impl NetworkGate {
    pub(crate) fn new(policy: NetworkPolicy, client: Option<Arc<dyn NetworkClient>>) -> Self {
        Self { policy, client }
    }

    /// Applies the policy to `request`'s URL.
    pub(crate) fn admit(&self, request: &NetworkRequest) -> ScriptResult<()> {
        let Some(host) = request.url.host_str() else {
            return Err(ScriptError::NetworkDenied {
                reason: format!("url `{}` has no host", request.url),
            });
        };
        let decision = self
            .policy
            .check(host, request.url.port_or_known_default());
        if !decision.is_allow() {
            warn!(host, rule = ?decision.rule(), "sandbox network call denied");
            return Err(ScriptError::NetworkDenied {
                reason: decision.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) async fn send(&self, request: NetworkRequest) -> ScriptResult<NetworkResponse> {
        self.admit(&request)?;
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ScriptError::NetworkDenied {
                reason: "no network client is configured".to_owned(),
            })?;
        client.send(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(allowed: &[&str], blocked: &[&str]) -> NetworkGate {
        NetworkGate::new(
            NetworkPolicy {
                enabled: true,
                allowed_domains: allowed.iter().map(|d| (*d).to_owned()).collect(),
                blocked_domains: blocked.iter().map(|d| (*d).to_owned()).collect(),
                allowed_ports: vec![443],
            },
            None,
        )
    }

    fn request(url: &str) -> NetworkRequest {
        NetworkRequest::get(Url::parse(url).unwrap())
    }

    #[test]
    fn filters_by_host_and_port() {
        let gate = gate(&["api.example.com"], &["tracker.example.com"]);
        gate.admit(&request("https://api.example.com/v1")).unwrap();
        assert!(gate.admit(&request("https://tracker.example.com")).is_err());
        assert!(gate.admit(&request("https://other.org")).is_err());
        // Known default port for http is 80, which is not allow-listed.
        assert!(gate.admit(&request("http://api.example.com")).is_err());
    }

    #[tokio::test]
    async fn missing_client_is_denied() {
        let gate = gate(&["api.example.com"], &[]);
        let err = gate
            .send(request("https://api.example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::NetworkDenied { .. }));
    }
}
