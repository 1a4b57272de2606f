//! Exposes a running instance's capabilities as MCP tools.

use std::sync::Arc;

use agent_config::McpSettings;
use agent_kernel::{ExecutionRequest, RuntimeManager};
use agent_mcp::{
    CallToolResult, Implementation, McpError, McpResult, McpServer, ReadResourceResult,
    ResourceContents, ResourceDefinition, capability_tool,
};
use agent_primitives::InstanceId;
use serde_json::Value;
use tracing::debug;

use crate::{ExchangeError, ExchangeResult};

/// URI of the metadata resource published for `instance_id`.
#[must_use]
pub fn instance_resource_uri(instance_id: InstanceId) -> String {
    format!("agent://instances/{instance_id}/metadata")
}

/// Builds an MCP server whose tools call `execute_capability` on the instance
/// as `user_id`.
///
/// Each capability becomes a tool of the same name. Sandbox failures come
/// back as tool results with `isError` set; runtime refusals become JSON-RPC
/// internal errors.
///
/// # Errors
///
/// Returns [`ExchangeError::InstanceNotFound`] when the instance is gone.
pub fn instance_server(
    runtime: &Arc<RuntimeManager>,
    instance_id: InstanceId,
    user_id: &str,
    settings: &McpSettings,
) -> ExchangeResult<McpServer> {
    let metadata = runtime
        .instance_metadata(instance_id)
        .ok_or(ExchangeError::InstanceNotFound { id: instance_id })?;
    let server = McpServer::builder(Implementation::new(metadata.name(), metadata.version()))
        .settings(settings)
        .build();

    for capability in metadata.capabilities() {
        let runtime = Arc::clone(runtime);
        let user_id = user_id.to_owned();
        let name = capability.name().to_owned();
        server.register_tool(capability_tool(capability), move |arguments: Value| {
            let runtime = Arc::clone(&runtime);
            let request =
                ExecutionRequest::new(instance_id, user_id.clone(), name.clone(), arguments);
            async move { call_capability(&runtime, request).await }
        });
    }

    let uri = instance_resource_uri(instance_id);
    let definition = ResourceDefinition {
        uri: uri.clone(),
        name: format!("{} metadata", metadata.name()),
        description: Some(metadata.description().to_owned()),
        mime_type: Some("application/json".into()),
    };
    server.register_resource(definition, move |uri: String| {
        let metadata = Arc::clone(&metadata);
        async move {
            Ok::<_, McpError>(ReadResourceResult {
                contents: vec![ResourceContents {
                    uri,
                    mime_type: Some("application/json".into()),
                    text: serde_json::to_string_pretty(&*metadata)?,
                }],
            })
        }
    });
    debug!(%instance_id, %uri, "instance exposed over mcp");
    Ok(server)
}

async fn call_capability(
    runtime: &RuntimeManager,
    request: ExecutionRequest,
) -> McpResult<CallToolResult> {
    let result = runtime
        .execute_capability(request)
        .await
        .map_err(|err| McpError::handler(err.to_string()))?;
    if result.success {
        let text = match result.output.unwrap_or(Value::Null) {
            Value::String(text) => text,
            other => other.to_string(),
        };
        Ok(CallToolResult::text(text))
    } else {
        let message = result.error.map_or_else(
            || "execution failed".to_owned(),
            |error| format!("{}: {}", error.code, error.message),
        );
        Ok(CallToolResult::error(message))
    }
}
