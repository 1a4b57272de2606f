//! Script engine seam and the bundled native engine.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::syntax::check_balanced;
use crate::{SandboxError, SandboxHost, SandboxResult, ScriptError, ScriptResult};

/// One call into an engine.
#[derive(Debug, Clone)]
pub struct ScriptInvocation {
    /// Capability being invoked.
    pub capability: String,
    /// Capability input.
    pub input: Value,
    /// Agent source text.
    pub code: Arc<str>,
}

/// Executes agent code.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Verifies that `code` is syntactically acceptable.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Syntax`] describing the first fault.
    fn check_syntax(&self, code: &str) -> ScriptResult<()>;

    /// Runs one invocation against the supplied host surface.
    async fn run(&self, invocation: ScriptInvocation, host: Arc<SandboxHost>)
    -> ScriptResult<Value>;
}

/// Native implementation of a capability.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Handles one invocation.
    async fn handle(&self, input: Value, host: Arc<SandboxHost>) -> ScriptResult<Value>;
}

#[async_trait]
impl<F, Fut> CapabilityHandler for F
where
    F: Send + Sync + Fn(Value, Arc<SandboxHost>) -> Fut,
    Fut: Future<Output = ScriptResult<Value>> + Send,
{
    async fn handle(&self, input: Value, host: Arc<SandboxHost>) -> ScriptResult<Value> {
        (self)(input, host).await
    }
}

/// Engine that dispatches capabilities to registered Rust handlers.
///
/// The agent's source text is syntax-checked but not interpreted; the handler
/// registered under the capability name supplies the behaviour.
#[derive(Default)]
pub struct NativeEngine {
    handlers: RwLock<HashMap<String, Arc<dyn CapabilityHandler>>>,
}

impl std::fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeEngine")
            .field("handlers", &self.handler_names())
            .finish()
    }
}

impl NativeEngine {
    /// Creates an engine with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `capability`.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::DuplicateHandler`] if the name is taken.
    pub fn register<H>(&self, capability: impl Into<String>, handler: H) -> SandboxResult<()>
    where
        H: CapabilityHandler + 'static,
    {
        let name = capability.into();
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if handlers.contains_key(&name) {
            return Err(SandboxError::DuplicateHandler { name });
        }
        debug!(capability = %name, "native handler registered");
        handlers.insert(name, Arc::new(handler));
        Ok(())
    }

    /// Removes a handler, returning whether one was present.
    pub fn unregister(&self, capability: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(capability)
            .is_some()
    }

    /// Returns `true` when a handler exists for `capability`.
    #[must_use]
    pub fn has_handler(&self, capability: &str) -> bool {
        self.handler(capability).is_some()
    }

    /// Lists registered capability names, sorted.
    #[must_use]
    pub fn handler_names(&self) -> Vec<String> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut names: Vec<_> = handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn handler(&self, capability: &str) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(capability)
            .cloned()
    }
}

#[async_trait]
impl ScriptEngine for NativeEngine {
    fn check_syntax(&self, code: &str) -> ScriptResult<()> {
        check_balanced(code)
    }

    async fn run(
        &self,
        invocation: ScriptInvocation,
        host: Arc<SandboxHost>,
    ) -> ScriptResult<Value> {
        let handler =
            self.handler(&invocation.capability)
                .ok_or_else(|| ScriptError::UnknownCapability {
                    name: invocation.capability.clone(),
                })?;
        handler.handle(invocation.input, host).await
    }
}
