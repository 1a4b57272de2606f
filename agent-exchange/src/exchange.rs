//! Wires the registry, discovery, runtime, security and audit components
//! into one exchange.

use std::sync::Arc;

use agent_config::ExchangeConfig;
use agent_kernel::{AgentInstance, CreateInstanceRequest, RuntimeConfig, RuntimeManager};
use agent_mcp::McpServer;
use agent_policy::SecurityManager;
use agent_primitives::{AgentId, InstanceId};
use agent_registry::{AgentRegistry, AgentStore, Discovery, InMemoryAgentStore};
use agent_sandbox::{NetworkClient, SandboxFactory, ScriptEngine};
use agent_telemetry::{AuditService, AuditStore, InMemoryAuditStore};
use tokio::task::JoinHandle;
use tracing::info;

use crate::{ExchangeResult, bridge, tools};

/// Builder for [`AgentExchange`].
pub struct AgentExchangeBuilder {
    engine: Arc<dyn ScriptEngine>,
    config: ExchangeConfig,
    store: Option<Arc<dyn AgentStore>>,
    audit_store: Option<Arc<dyn AuditStore>>,
    network: Option<Arc<dyn NetworkClient>>,
    security: Option<Arc<SecurityManager>>,
}

impl std::fmt::Debug for AgentExchangeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentExchangeBuilder")
            .field("config", &self.config)
            .field("custom_store", &self.store.is_some())
            .field("custom_audit_store", &self.audit_store.is_some())
            .field("network", &self.network.is_some())
            .finish_non_exhaustive()
    }
}

impl AgentExchangeBuilder {
    /// Replaces the default configuration.
    #[must_use]
    pub fn config(mut self, config: ExchangeConfig) -> Self {
        self.config = config;
        self
    }

    /// Persists the catalog in `store` instead of memory.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn AgentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Persists audit records in `store` instead of memory.
    #[must_use]
    pub fn audit_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.audit_store = Some(store);
        self
    }

    /// Transport for network calls that pass the sandbox policy.
    #[must_use]
    pub fn network_client(mut self, client: Arc<dyn NetworkClient>) -> Self {
        self.network = Some(client);
        self
    }

    /// Shares an existing security manager.
    #[must_use]
    pub fn security(mut self, security: Arc<SecurityManager>) -> Self {
        self.security = Some(security);
        self
    }

    /// Builds the components, indexes the catalog and starts the signal
    /// bridges. Must run inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails on invalid runtime settings or when the initial index cannot be
    /// built.
    pub async fn build(self) -> ExchangeResult<AgentExchange> {
        let security = self
            .security
            .unwrap_or_else(|| Arc::new(SecurityManager::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryAgentStore::new()));
        let audit = AuditService::new(
            self.audit_store
                .unwrap_or_else(|| Arc::new(InMemoryAuditStore::new())),
        );

        let mut factory = SandboxFactory::new(Arc::clone(&self.engine))
            .with_memory_ceiling_mb(self.config.sandbox.memory_ceiling_mb);
        if let Some(client) = self.network {
            factory = factory.with_network_client(client);
        }
        let runtime = Arc::new(
            RuntimeManager::builder(factory)
                .config(RuntimeConfig::from_settings(&self.config.runtime)?)
                .security(Arc::clone(&security))
                .build(),
        );
        let registry = Arc::new(
            AgentRegistry::new(Arc::clone(&store), self.engine).with_security(Arc::clone(&security)),
        );
        let discovery = Arc::new(Discovery::new(store));
        let indexed = discovery.refresh().await?;

        let tasks = vec![
            Arc::clone(&discovery).follow(registry.subscribe()),
            bridge::runtime_events(runtime.subscribe(), audit.clone()),
            bridge::security_events(security.subscribe(), audit.clone()),
            bridge::registry_events(registry.subscribe(), audit.clone()),
            bridge::audit_signals(audit.subscribe(), Arc::clone(&security)),
        ];
        info!(
            indexed,
            max_concurrent = self.config.runtime.max_concurrent_executions,
            "agent exchange started"
        );

        Ok(AgentExchange {
            config: self.config,
            security,
            registry,
            discovery,
            runtime,
            audit,
            tasks,
        })
    }
}

/// A complete exchange: catalog, discovery, runtime, security and audit,
/// with runtime, registry and security signals recorded in the audit log.
pub struct AgentExchange {
    config: ExchangeConfig,
    security: Arc<SecurityManager>,
    registry: Arc<AgentRegistry>,
    discovery: Arc<Discovery>,
    runtime: Arc<RuntimeManager>,
    audit: AuditService,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for AgentExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentExchange")
            .field("config", &self.config)
            .field("indexed", &self.discovery.indexed())
            .field("runtime", &self.runtime.stats())
            .finish_non_exhaustive()
    }
}

impl AgentExchange {
    /// Starts a builder around the engine that runs agent code.
    #[must_use]
    pub fn builder(engine: Arc<dyn ScriptEngine>) -> AgentExchangeBuilder {
        AgentExchangeBuilder {
            engine,
            config: ExchangeConfig::default(),
            store: None,
            audit_store: None,
            network: None,
            security: None,
        }
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// Security manager.
    #[must_use]
    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    /// Agent catalog.
    #[must_use]
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Search and ranking over the catalog.
    #[must_use]
    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    /// Instance runtime.
    #[must_use]
    pub fn runtime(&self) -> &Arc<RuntimeManager> {
        &self.runtime
    }

    /// Audit log.
    #[must_use]
    pub fn audit(&self) -> &AuditService {
        &self.audit
    }

    /// Installs a catalog agent for `user_id` and starts an instance of it.
    ///
    /// # Errors
    ///
    /// Propagates registry failures (unknown agent, missing install grant)
    /// and runtime refusals (quota, policy).
    pub async fn install_and_instantiate(
        &self,
        agent_id: AgentId,
        user_id: &str,
    ) -> ExchangeResult<AgentInstance> {
        let entry = self.registry.install_agent(agent_id, user_id).await?;
        let instance = self
            .runtime
            .create_instance(CreateInstanceRequest::new(entry.metadata, entry.code, user_id))
            .await?;
        info!(%agent_id, instance_id = %instance.id, user_id, "agent installed and instantiated");
        Ok(instance)
    }

    /// MCP server exposing the instance's capabilities as tools run on behalf
    /// of `user_id`.
    ///
    /// # Errors
    ///
    /// Fails when the instance is not live.
    pub fn expose_instance(&self, instance_id: InstanceId, user_id: &str) -> ExchangeResult<McpServer> {
        tools::instance_server(&self.runtime, instance_id, user_id, &self.config.mcp)
    }

    /// Stops the runtime sweep and the signal bridges.
    pub fn shutdown(&self) {
        self.runtime.shutdown();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for AgentExchange {
    fn drop(&mut self) {
        self.shutdown();
    }
}
