//! Model Context Protocol layer for the agent exchange.
//!
//! [`McpServer`] exposes tools, resources and prompts over JSON-RPC 2.0 and
//! [`McpClient`] consumes them. Both run over the in-process [`duplex`]
//! transport of text frames.

#![warn(missing_docs, clippy::pedantic)]

mod client;
mod error;
pub mod protocol;
mod server;
mod transport;
mod types;

pub use client::{ClientEvent, McpClient};
pub use error::{McpError, McpResult};
pub use server::{
    ListChanged, McpServer, McpServerBuilder, PromptHandler, ResourceHandler, ToolHandler,
};
pub use transport::{FrameReceiver, FrameSender, Transport, duplex};
pub use types::{
    CallToolParams, CallToolResult, Content, GetPromptParams, GetPromptResult, Implementation,
    InitializeParams, InitializeResult, InputSchema, ListChangedCapability, ListPromptsResult,
    ListResourcesResult, ListToolsResult, PromptArgument, PromptDefinition, PromptMessage,
    ReadResourceParams, ReadResourceResult, ResourceContents, ResourceDefinition, Role,
    ServerCapabilities, ToolDefinition, capability_tool,
};
