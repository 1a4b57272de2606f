//! MCP server: handshake, method dispatch and list-changed broadcasts.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use agent_config::McpSettings;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{McpError, McpResult};
use crate::protocol::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use crate::transport::{FrameSender, Transport};
use crate::types::{
    CallToolParams, CallToolResult, GetPromptParams, GetPromptResult, Implementation,
    InitializeParams, InitializeResult, ListPromptsResult, ListResourcesResult, ListToolsResult,
    PromptDefinition, ReadResourceParams, ReadResourceResult, ResourceDefinition,
    ServerCapabilities, ToolDefinition,
};

/// Executes `tools/call` for one tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Runs the tool with the caller's arguments.
    async fn call(&self, arguments: Value) -> McpResult<CallToolResult>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Send + Sync + Fn(Value) -> Fut,
    Fut: Future<Output = McpResult<CallToolResult>> + Send,
{
    async fn call(&self, arguments: Value) -> McpResult<CallToolResult> {
        (self)(arguments).await
    }
}

/// Serves `resources/read` for one URI.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Reads the resource.
    async fn read(&self, uri: String) -> McpResult<ReadResourceResult>;
}

#[async_trait]
impl<F, Fut> ResourceHandler for F
where
    F: Send + Sync + Fn(String) -> Fut,
    Fut: Future<Output = McpResult<ReadResourceResult>> + Send,
{
    async fn read(&self, uri: String) -> McpResult<ReadResourceResult> {
        (self)(uri).await
    }
}

/// Renders `prompts/get` for one prompt.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    /// Renders the prompt with the supplied arguments.
    async fn get(&self, arguments: Map<String, Value>) -> McpResult<GetPromptResult>;
}

#[async_trait]
impl<F, Fut> PromptHandler for F
where
    F: Send + Sync + Fn(Map<String, Value>) -> Fut,
    Fut: Future<Output = McpResult<GetPromptResult>> + Send,
{
    async fn get(&self, arguments: Map<String, Value>) -> McpResult<GetPromptResult> {
        (self)(arguments).await
    }
}

/// Which registry changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChanged {
    /// Tool set changed.
    Tools,
    /// Resource set changed.
    Resources,
    /// Prompt set changed.
    Prompts,
}

impl ListChanged {
    /// Notification method announcing the change.
    #[must_use]
    pub const fn method(self) -> &'static str {
        match self {
            Self::Tools => "notifications/tools/list_changed",
            Self::Resources => "notifications/resources/list_changed",
            Self::Prompts => "notifications/prompts/list_changed",
        }
    }
}

type Registry<D, H> = RwLock<BTreeMap<String, (D, Arc<H>)>>;

struct ServerInner {
    info: Implementation,
    capabilities: ServerCapabilities,
    protocol_version: String,
    tools: Registry<ToolDefinition, dyn ToolHandler>,
    resources: Registry<ResourceDefinition, dyn ResourceHandler>,
    prompts: Registry<PromptDefinition, dyn PromptHandler>,
    changes: broadcast::Sender<ListChanged>,
}

/// MCP server. Cheap to clone; clones share registrations.
#[derive(Clone)]
pub struct McpServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer")
            .field("info", &self.inner.info)
            .field("capabilities", &self.inner.capabilities)
            .field("tools", &self.tool_names())
            .finish_non_exhaustive()
    }
}

/// Builder for [`McpServer`].
#[derive(Debug)]
pub struct McpServerBuilder {
    info: Implementation,
    capabilities: ServerCapabilities,
    protocol_version: String,
}

impl McpServerBuilder {
    /// Overrides the advertised capabilities.
    #[must_use]
    pub fn capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Takes the advertised protocol version from settings.
    #[must_use]
    pub fn settings(mut self, settings: &McpSettings) -> Self {
        self.protocol_version.clone_from(&settings.protocol_version);
        self
    }

    /// Builds the server.
    #[must_use]
    pub fn build(self) -> McpServer {
        let (changes, _) = broadcast::channel(256);
        McpServer {
            inner: Arc::new(ServerInner {
                info: self.info,
                capabilities: self.capabilities,
                protocol_version: self.protocol_version,
                tools: RwLock::default(),
                resources: RwLock::default(),
                prompts: RwLock::default(),
                changes,
            }),
        }
    }
}

impl McpServer {
    /// Starts a builder advertising every capability with `listChanged`.
    #[must_use]
    pub fn builder(info: Implementation) -> McpServerBuilder {
        McpServerBuilder {
            info,
            capabilities: ServerCapabilities::all(true),
            protocol_version: McpSettings::default().protocol_version,
        }
    }

    /// Server descriptor.
    #[must_use]
    pub fn info(&self) -> &Implementation {
        &self.inner.info
    }

    /// Adds or replaces a tool.
    pub fn register_tool(&self, definition: ToolDefinition, handler: impl ToolHandler + 'static) {
        let name = definition.name.clone();
        let handler: Arc<dyn ToolHandler> = Arc::new(handler);
        self.inner
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), (definition, handler));
        debug!(tool = %name, "tool registered");
        self.announce(ListChanged::Tools);
    }

    /// Removes a tool. Returns whether it existed.
    pub fn unregister_tool(&self, name: &str) -> bool {
        let removed = self
            .inner
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            debug!(tool = name, "tool unregistered");
            self.announce(ListChanged::Tools);
        }
        removed
    }

    /// Adds or replaces a resource, keyed by URI.
    pub fn register_resource(
        &self,
        definition: ResourceDefinition,
        handler: impl ResourceHandler + 'static,
    ) {
        let uri = definition.uri.clone();
        let handler: Arc<dyn ResourceHandler> = Arc::new(handler);
        self.inner
            .resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uri.clone(), (definition, handler));
        debug!(uri = %uri, "resource registered");
        self.announce(ListChanged::Resources);
    }

    /// Removes a resource. Returns whether it existed.
    pub fn unregister_resource(&self, uri: &str) -> bool {
        let removed = self
            .inner
            .resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uri)
            .is_some();
        if removed {
            self.announce(ListChanged::Resources);
        }
        removed
    }

    /// Adds or replaces a prompt.
    pub fn register_prompt(
        &self,
        definition: PromptDefinition,
        handler: impl PromptHandler + 'static,
    ) {
        let name = definition.name.clone();
        let handler: Arc<dyn PromptHandler> = Arc::new(handler);
        self.inner
            .prompts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), (definition, handler));
        debug!(prompt = %name, "prompt registered");
        self.announce(ListChanged::Prompts);
    }

    /// Removes a prompt. Returns whether it existed.
    pub fn unregister_prompt(&self, name: &str) -> bool {
        let removed = self
            .inner
            .prompts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            self.announce(ListChanged::Prompts);
        }
        removed
    }

    /// Names of the registered tools, sorted.
    #[must_use]
    pub fn tool_names(&self) -> Vec<String> {
        self.inner
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Subscribes to registry changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ListChanged> {
        self.inner.changes.subscribe()
    }

    /// Serves one connection until the peer disconnects.
    pub fn connect(&self, transport: Transport) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move { server.serve(transport).await })
    }

    async fn serve(self, transport: Transport) {
        let (sender, mut receiver) = transport.split();
        let initialized = Arc::new(AtomicBool::new(false));
        let mut changes = self.inner.changes.subscribe();
        info!(server = %self.inner.info.name, "mcp connection opened");

        loop {
            tokio::select! {
                frame = receiver.recv() => {
                    let Some(frame) = frame else { break };
                    self.handle_frame(&frame, &sender, &initialized).await;
                }
                change = changes.recv() => match change {
                    Ok(change) if initialized.load(Ordering::Acquire) => {
                        let notification = JsonRpcNotification::new(change.method(), None);
                        send(&sender, &JsonRpcMessage::Notification(notification));
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!(server = %self.inner.info.name, "mcp connection closed");
    }

    async fn handle_frame(&self, frame: &str, sender: &FrameSender, initialized: &AtomicBool) {
        let message = match JsonRpcMessage::parse(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "rejecting malformed frame");
                let response = JsonRpcResponse::failure(err.id(), err.to_error());
                send(sender, &JsonRpcMessage::Response(response));
                return;
            }
        };

        match message {
            JsonRpcMessage::Request(request) if request.method == "initialize" => {
                let response = match self.initialize(request.params) {
                    Ok(result) => {
                        initialized.store(true, Ordering::Release);
                        JsonRpcResponse::success(request.id, result)
                    }
                    Err(error) => JsonRpcResponse::failure(request.id, error),
                };
                send(sender, &JsonRpcMessage::Response(response));
            }
            JsonRpcMessage::Request(request) if !initialized.load(Ordering::Acquire) => {
                debug!(method = %request.method, "request before initialize");
                let response = JsonRpcResponse::failure(request.id, JsonRpcError::not_initialized());
                send(sender, &JsonRpcMessage::Response(response));
            }
            JsonRpcMessage::Request(request) => {
                let server = self.clone();
                let sender = sender.clone();
                tokio::spawn(async move {
                    let JsonRpcRequest {
                        id, method, params, ..
                    } = request;
                    let outcome = AssertUnwindSafe(server.dispatch(&method, params))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            warn!(method = %method, "request handler panicked");
                            Err(JsonRpcError::internal("handler panicked"))
                        });
                    let response = match outcome {
                        Ok(result) => JsonRpcResponse::success(id, result),
                        Err(error) => {
                            debug!(method = %method, code = error.code, "request failed");
                            JsonRpcResponse::failure(id, error)
                        }
                    };
                    send(&sender, &JsonRpcMessage::Response(response));
                });
            }
            JsonRpcMessage::Notification(notification) => {
                debug!(method = %notification.method, "notification received");
            }
            JsonRpcMessage::Response(response) => {
                debug!(id = %response.id, "ignoring unsolicited response");
            }
        }
    }

    fn initialize(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: InitializeParams = decode(params)?;
        info!(
            client = %params.client_info.name,
            client_version = %params.client_info.version,
            protocol = %params.protocol_version,
            "mcp client initialized"
        );
        encode(&InitializeResult {
            protocol_version: self.inner.protocol_version.clone(),
            capabilities: self.inner.capabilities,
            server_info: self.inner.info.clone(),
        })
    }

    /// Answers one initialized request.
    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        match method {
            "ping" => Ok(json!({})),
            "tools/list" => encode(&ListToolsResult {
                tools: definitions(&self.inner.tools),
            }),
            "tools/call" => {
                let params: CallToolParams = decode(params)?;
                let handler = lookup(&self.inner.tools, &params.name, "tool")?;
                encode(&handler.call(params.arguments).await.map_err(to_rpc)?)
            }
            "resources/list" => encode(&ListResourcesResult {
                resources: definitions(&self.inner.resources),
            }),
            "resources/read" => {
                let params: ReadResourceParams = decode(params)?;
                let handler = lookup(&self.inner.resources, &params.uri, "resource")?;
                encode(&handler.read(params.uri).await.map_err(to_rpc)?)
            }
            "prompts/list" => encode(&ListPromptsResult {
                prompts: definitions(&self.inner.prompts),
            }),
            "prompts/get" => {
                let params: GetPromptParams = decode(params)?;
                let handler = lookup(&self.inner.prompts, &params.name, "prompt")?;
                encode(&handler.get(params.arguments).await.map_err(to_rpc)?)
            }
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    fn announce(&self, change: ListChanged) {
        let flag = match change {
            ListChanged::Tools => self.inner.capabilities.tools,
            ListChanged::Resources => self.inner.capabilities.resources,
            ListChanged::Prompts => self.inner.capabilities.prompts,
        };
        if flag.is_some_and(|flag| flag.list_changed) {
            let _ = self.inner.changes.send(change);
        }
    }
}

fn definitions<D: Clone, H: ?Sized>(registry: &Registry<D, H>) -> Vec<D> {
    registry
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .map(|(definition, _)| definition.clone())
        .collect()
}

fn lookup<D, H: ?Sized>(
    registry: &Registry<D, H>,
    key: &str,
    what: &str,
) -> Result<Arc<H>, JsonRpcError> {
    registry
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(key)
        .map(|(_, handler)| Arc::clone(handler))
        .ok_or_else(|| JsonRpcError::invalid_params(format!("unknown {what}: {key}")))
}

fn decode<T: DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(JsonRpcError::invalid_params)
}

fn encode<T: Serialize>(value: &T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|err| JsonRpcError::internal(err.to_string()))
}

fn to_rpc(error: McpError) -> JsonRpcError {
    match error {
        McpError::Rpc {
            code,
            message,
            data,
        } => JsonRpcError {
            code,
            message,
            data,
        },
        other => JsonRpcError::internal(other.to_string()),
    }
}

fn send(sender: &FrameSender, message: &JsonRpcMessage) {
    match message.to_frame() {
        Ok(frame) => {
            if sender.send(frame).is_err() {
                debug!("peer gone before reply");
            }
        }
        Err(err) => warn!(error = %err, "failed to encode frame"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::{INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, NOT_INITIALIZED};
    use crate::transport::{FrameReceiver, duplex};

    fn server() -> McpServer {
        let server = McpServer::builder(Implementation::new("test-server", "0.1.0")).build();
        server.register_tool(ToolDefinition::new("echo", "Echo input"), |args: Value| async move {
            Ok::<_, McpError>(CallToolResult::text(args["text"].as_str().unwrap_or_default()))
        });
        server.register_tool(ToolDefinition::new("fail", "Always fails"), |_args: Value| async {
            Err::<CallToolResult, _>(McpError::handler("boom"))
        });
        server.register_tool(ToolDefinition::new("crash", "Panics"), |_args: Value| async {
            if true {
                panic!("handler bug");
            }
            Ok::<_, McpError>(CallToolResult::text("unreachable"))
        });
        server
    }

    async fn exchange(tx: &FrameSender, rx: &mut FrameReceiver, frame: &str) -> Value {
        tx.send(frame.to_owned()).unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    async fn initialized() -> (McpServer, FrameSender, FrameReceiver) {
        let server = server();
        let (client, remote) = duplex();
        server.connect(remote);
        let (tx, mut rx) = client.split();
        let reply = exchange(
            &tx,
            &mut rx,
            r#"{"jsonrpc":"2.0","id":0,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"t","version":"1"}}}"#,
        )
        .await;
        assert_eq!(reply["result"]["serverInfo"]["name"], "test-server");
        (server, tx, rx)
    }

    #[tokio::test]
    async fn requests_before_initialize_are_refused() {
        let server = server();
        let (client, remote) = duplex();
        server.connect(remote);
        let (tx, mut rx) = client.split();

        let reply = exchange(&tx, &mut rx, r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).await;
        assert_eq!(reply["id"], json!(1));
        assert_eq!(reply["error"]["code"], json!(NOT_INITIALIZED));
    }

    #[tokio::test]
    async fn malformed_frames_get_null_id_parse_errors() {
        let (_server, tx, mut rx) = initialized().await;
        let reply = exchange(&tx, &mut rx, "{oops").await;
        assert_eq!(reply["id"], Value::Null);
        assert_eq!(reply["error"]["code"], json!(-32_700));
    }

    #[tokio::test]
    async fn dispatch_maps_failures_to_codes() {
        let (_server, tx, mut rx) = initialized().await;

        let reply = exchange(&tx, &mut rx, r#"{"jsonrpc":"2.0","id":2,"method":"nope"}"#).await;
        assert_eq!(reply["error"]["code"], json!(METHOD_NOT_FOUND));

        let reply = exchange(
            &tx,
            &mut rx,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"missing"}}"#,
        )
        .await;
        assert_eq!(reply["error"]["code"], json!(INVALID_PARAMS));

        let reply = exchange(
            &tx,
            &mut rx,
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"fail"}}"#,
        )
        .await;
        assert_eq!(reply["error"]["code"], json!(INTERNAL_ERROR));
        assert_eq!(reply["error"]["message"], "boom");

        let reply = exchange(
            &tx,
            &mut rx,
            r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"echo","arguments":{"text":"hi"}}}"#,
        )
        .await;
        assert_eq!(reply["result"]["content"][0]["text"], "hi");
    }

    #[tokio::test]
    async fn panicking_handler_gets_internal_error_reply() {
        let (_server, tx, mut rx) = initialized().await;

        let reply = exchange(
            &tx,
            &mut rx,
            r#"{"jsonrpc":"2.0","id":9,"method":"tools/call","params":{"name":"crash"}}"#,
        )
        .await;
        assert_eq!(reply["id"], json!(9));
        assert_eq!(reply["error"]["code"], json!(INTERNAL_ERROR));
        assert_eq!(reply["error"]["message"], "handler panicked");

        let reply = exchange(&tx, &mut rx, r#"{"jsonrpc":"2.0","id":10,"method":"ping"}"#).await;
        assert_eq!(reply["id"], json!(10));
        assert!(reply.get("result").is_some());
    }

    #[tokio::test]
    async fn registration_changes_are_broadcast() {
        let (server, _tx, mut rx) = initialized().await;
        server.register_tool(ToolDefinition::new("late", "Added later"), |_args: Value| async {
            Ok::<_, McpError>(CallToolResult::text("ok"))
        });

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let notification: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(notification["method"], "notifications/tools/list_changed");
        assert!(server.unregister_tool("late"));
        assert!(!server.unregister_tool("late"));
    }
}
