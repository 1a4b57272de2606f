//! MCP client with request correlation and per-request timeouts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use agent_config::McpSettings;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{McpError, McpResult};
use crate::protocol::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use crate::transport::{FrameReceiver, FrameSender, Transport};
use crate::types::{
    CallToolResult, GetPromptResult, Implementation, InitializeResult, ListPromptsResult,
    ListResourcesResult, ListToolsResult, PromptDefinition, ReadResourceResult,
    ResourceDefinition, ToolDefinition,
};

/// Something the server sent that was not a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Server notification.
    Notification {
        /// Notification method.
        method: String,
        /// Notification params.
        params: Option<Value>,
    },
    /// A frame that could not be read.
    ParseError {
        /// Raw frame text.
        raw: String,
        /// Parser message.
        message: String,
    },
    /// The server side closed. Every pending request has been failed.
    Disconnected,
}

type Pending = HashMap<u64, oneshot::Sender<McpResult<Value>>>;

#[derive(Default)]
struct PendingTable {
    waiting: Pending,
    closed: bool,
}

struct ClientInner {
    sender: FrameSender,
    pending: Mutex<PendingTable>,
    next_id: AtomicU64,
    timeout: Duration,
    events: broadcast::Sender<ClientEvent>,
}

/// MCP client over one [`Transport`].
///
/// Ids are allocated per client starting at 1. A timed-out request frees
/// its slot; a response arriving afterwards is dropped.
pub struct McpClient {
    inner: Arc<ClientInner>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("timeout", &self.inner.timeout)
            .field("pending", &self.pending_requests())
            .finish_non_exhaustive()
    }
}

impl McpClient {
    /// Attaches to a transport and starts reading server frames.
    #[must_use]
    pub fn connect(transport: Transport, settings: &McpSettings) -> Self {
        let (sender, receiver) = transport.split();
        let (events, _) = broadcast::channel(256);
        let inner = Arc::new(ClientInner {
            sender,
            pending: Mutex::default(),
            next_id: AtomicU64::new(1),
            timeout: settings.request_timeout(),
            events,
        });
        let reader = tokio::spawn(read_loop(Arc::clone(&inner), receiver));
        Self { inner, reader }
    }

    /// Subscribes to notifications, parse errors and disconnects.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Requests still awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiting
            .len()
    }

    /// Timeout applied to each request.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Sends a raw request and waits for its result.
    ///
    /// # Errors
    ///
    /// [`McpError::Timeout`] when no response arrives in time,
    /// [`McpError::ConnectionClosed`] when the server goes away, and
    /// [`McpError::Rpc`] when it answers with an error.
    pub async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if table.closed {
                return Err(McpError::ConnectionClosed);
            }
            table.waiting.insert(id, tx);
        }

        let frame = JsonRpcMessage::Request(JsonRpcRequest::new(id, method, params)).to_frame()?;
        if let Err(err) = self.inner.sender.send(frame) {
            self.forget(id);
            return Err(err);
        }
        debug!(id, method, "mcp request sent");

        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::ConnectionClosed),
            Err(_) => {
                self.forget(id);
                warn!(id, method, "mcp request timed out");
                Err(McpError::Timeout {
                    method: method.to_owned(),
                    after: self.inner.timeout,
                })
            }
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> McpResult<T> {
        let value = self.request(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Sends a notification without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::ConnectionClosed`] when the server is gone.
    pub fn send_notification(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let frame = JsonRpcMessage::Notification(JsonRpcNotification::new(method, params))
            .to_frame()?;
        self.inner.sender.send(frame)
    }

    /// Performs the handshake, then sends `notifications/initialized`.
    ///
    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn initialize(
        &self,
        client_info: Implementation,
        protocol_version: &str,
    ) -> McpResult<InitializeResult> {
        let result: InitializeResult = self
            .call(
                "initialize",
                Some(json!({
                    "protocolVersion": protocol_version,
                    "capabilities": {},
                    "clientInfo": client_info,
                })),
            )
            .await?;
        self.send_notification("notifications/initialized", None)?;
        Ok(result)
    }

    /// Round-trips a `ping`.
    ///
    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn ping(&self) -> McpResult<()> {
        self.request("ping", None).await.map(drop)
    }

    /// Lists the server's tools.
    ///
    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn list_tools(&self) -> McpResult<Vec<ToolDefinition>> {
        let result: ListToolsResult = self.call("tools/list", None).await?;
        Ok(result.tools)
    }

    /// Calls a tool.
    ///
    /// # Errors
    ///
    /// Propagates request failures, including `-32602` for unknown tools.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<CallToolResult> {
        self.call(
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    /// Lists the server's resources.
    ///
    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn list_resources(&self) -> McpResult<Vec<ResourceDefinition>> {
        let result: ListResourcesResult = self.call("resources/list", None).await?;
        Ok(result.resources)
    }

    /// Reads a resource.
    ///
    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        self.call("resources/read", Some(json!({ "uri": uri })))
            .await
    }

    /// Lists the server's prompts.
    ///
    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn list_prompts(&self) -> McpResult<Vec<PromptDefinition>> {
        let result: ListPromptsResult = self.call("prompts/list", None).await?;
        Ok(result.prompts)
    }

    /// Renders a prompt.
    ///
    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> McpResult<GetPromptResult> {
        self.call(
            "prompts/get",
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    fn forget(&self, id: u64) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiting
            .remove(&id);
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(inner: Arc<ClientInner>, mut receiver: FrameReceiver) {
    while let Some(frame) = receiver.recv().await {
        match JsonRpcMessage::parse(&frame) {
            Ok(JsonRpcMessage::Response(response)) => resolve(&inner, response),
            Ok(JsonRpcMessage::Notification(notification)) => {
                let _ = inner.events.send(ClientEvent::Notification {
                    method: notification.method,
                    params: notification.params,
                });
            }
            Ok(JsonRpcMessage::Request(request)) => {
                debug!(method = %request.method, "refusing server request");
                let reply = JsonRpcResponse::failure(
                    request.id,
                    JsonRpcError::method_not_found(&request.method),
                );
                if let Ok(frame) = JsonRpcMessage::Response(reply).to_frame() {
                    let _ = inner.sender.send(frame);
                }
            }
            Err(err) => {
                warn!(error = %err, "unreadable frame from server");
                let _ = inner.events.send(ClientEvent::ParseError {
                    raw: frame,
                    message: err.to_string(),
                });
            }
        }
    }

    let waiting = {
        let mut table = inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
        table.closed = true;
        std::mem::take(&mut table.waiting)
    };
    debug!(failed = waiting.len(), "mcp server disconnected");
    for (_, tx) in waiting {
        let _ = tx.send(Err(McpError::ConnectionClosed));
    }
    let _ = inner.events.send(ClientEvent::Disconnected);
}

fn resolve(inner: &ClientInner, response: JsonRpcResponse) {
    let Some(id) = response.id.as_u64() else {
        warn!(id = %response.id, "response with foreign id");
        return;
    };
    let waiter = inner
        .pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .waiting
        .remove(&id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(response.into_result().map_err(McpError::from));
        }
        None => debug!(id, "dropping late response"),
    }
}
