//! MCP payload shapes: tool, resource and prompt definitions plus method
//! params and results.

use agent_primitives::AgentCapability;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name and version of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Peer name.
    pub name: String,
    /// Peer version.
    pub version: String,
}

impl Implementation {
    /// Creates a descriptor.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Per-feature capability flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListChangedCapability {
    /// Whether `notifications/*/list_changed` is sent.
    #[serde(default)]
    pub list_changed: bool,
}

/// Features a server offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Tool support.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ListChangedCapability>,
    /// Resource support.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ListChangedCapability>,
    /// Prompt support.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<ListChangedCapability>,
}

impl ServerCapabilities {
    /// Tools, resources and prompts, all with the same list-changed flag.
    #[must_use]
    pub const fn all(list_changed: bool) -> Self {
        let flag = Some(ListChangedCapability { list_changed });
        Self {
            tools: flag,
            resources: flag,
            prompts: flag,
        }
    }
}

/// `initialize` params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Version the client speaks.
    pub protocol_version: String,
    /// Client capabilities, passed through untyped.
    #[serde(default)]
    pub capabilities: Value,
    /// Client descriptor.
    pub client_info: Implementation,
}

/// `initialize` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Version the server speaks.
    pub protocol_version: String,
    /// Server features.
    pub capabilities: ServerCapabilities,
    /// Server descriptor.
    pub server_info: Implementation,
}

/// Object schema for tool arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSchema {
    /// Always `"object"`.
    #[serde(rename = "type")]
    pub schema_type: String,
    /// Property schemas by name.
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Required property names.
    #[serde(default)]
    pub required: Vec<String>,
    /// Whether unknown properties are accepted.
    #[serde(default)]
    pub additional_properties: bool,
}

impl Default for InputSchema {
    fn default() -> Self {
        Self {
            schema_type: "object".into(),
            properties: Map::new(),
            required: Vec::new(),
            additional_properties: true,
        }
    }
}

impl InputSchema {
    /// Reads `properties`, `required` and `additionalProperties` from a JSON
    /// schema value. Anything unreadable falls back to an open object.
    #[must_use]
    pub fn from_json_schema(schema: &Value) -> Self {
        let properties = schema
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let required = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let additional_properties = schema
            .get("additionalProperties")
            .and_then(Value::as_bool)
            .unwrap_or(properties.is_empty());
        Self {
            schema_type: "object".into(),
            properties,
            required,
            additional_properties,
        }
    }
}

/// A callable tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// What the tool does.
    #[serde(default)]
    pub description: String,
    /// Argument schema.
    #[serde(default)]
    pub input_schema: InputSchema,
}

impl ToolDefinition {
    /// Creates a tool accepting any object.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: InputSchema::default(),
        }
    }

    /// Replaces the argument schema.
    #[must_use]
    pub fn with_input_schema(mut self, schema: InputSchema) -> Self {
        self.input_schema = schema;
        self
    }
}

/// Describes an agent capability as a tool of the same name.
#[must_use]
pub fn capability_tool(capability: &AgentCapability) -> ToolDefinition {
    ToolDefinition {
        name: capability.name().to_owned(),
        description: capability.description().to_owned(),
        input_schema: InputSchema::from_json_schema(capability.input_schema()),
    }
}

/// A readable resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    /// Resource URI.
    pub uri: String,
    /// Display name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// One prompt argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name.
    pub name: String,
    /// What it is for.
    #[serde(default)]
    pub description: String,
    /// Whether it must be supplied.
    #[serde(default)]
    pub required: bool,
}

/// A prompt template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptDefinition {
    /// Prompt name.
    pub name: String,
    /// What it produces.
    #[serde(default)]
    pub description: String,
    /// Accepted arguments.
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// Content block in tool results and prompt messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Embedded resource contents.
    Resource {
        /// The resource.
        resource: ResourceContents,
    },
}

impl Content {
    /// Text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Returns the text of a text block.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Resource { .. } => None,
        }
    }
}

/// `tools/call` params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolParams {
    /// Tool name.
    pub name: String,
    /// Tool arguments.
    #[serde(default)]
    pub arguments: Value,
}

/// `tools/call` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    /// Output blocks.
    #[serde(default)]
    pub content: Vec<Content>,
    /// Whether the tool reported a failure in-band.
    #[serde(default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Single text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            is_error: false,
        }
    }

    /// Single text block flagged as an in-band failure.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            is_error: true,
        }
    }
}

/// `tools/list` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListToolsResult {
    /// Registered tools.
    pub tools: Vec<ToolDefinition>,
}

/// `resources/list` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResourcesResult {
    /// Registered resources.
    pub resources: Vec<ResourceDefinition>,
}

/// `resources/read` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResourceParams {
    /// Resource URI.
    pub uri: String,
}

/// Body of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    /// Resource URI.
    pub uri: String,
    /// MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Text body.
    pub text: String,
}

/// `resources/read` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResourceResult {
    /// Contents returned by the handler.
    pub contents: Vec<ResourceContents>,
}

/// `prompts/list` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPromptsResult {
    /// Registered prompts.
    pub prompts: Vec<PromptDefinition>,
}

/// `prompts/get` params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPromptParams {
    /// Prompt name.
    pub name: String,
    /// Argument values.
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// Speaker of a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End user.
    User,
    /// Model.
    Assistant,
}

/// One rendered prompt message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    /// Speaker.
    pub role: Role,
    /// Body.
    pub content: Content,
}

/// `prompts/get` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPromptResult {
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Rendered messages.
    pub messages: Vec<PromptMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_primitives::CapabilityId;
    use serde_json::json;

    #[test]
    fn capability_becomes_tool() {
        let capability = AgentCapability::builder(CapabilityId::new("text.summarize").unwrap())
            .name("summarize")
            .unwrap()
            .description("Summarize text")
            .input_schema(json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }))
            .build()
            .unwrap();

        let tool = capability_tool(&capability);
        let wire = serde_json::to_value(&tool).unwrap();
        assert_eq!(wire["name"], "summarize");
        assert_eq!(wire["inputSchema"]["type"], "object");
        assert_eq!(wire["inputSchema"]["required"], json!(["text"]));
        assert_eq!(wire["inputSchema"]["additionalProperties"], json!(false));
        assert!(wire["inputSchema"]["properties"]["text"].is_object());
    }

    #[test]
    fn capabilities_flag_serialises_camel_case() {
        let wire = serde_json::to_value(ServerCapabilities::all(true)).unwrap();
        assert_eq!(wire["tools"]["listChanged"], json!(true));
    }
}
