//! Walks through the exchange: publish, discover, install, execute, expose
//! over MCP, and summarize the audit trail.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_exchange::AgentExchange;
use agent_exchange::config::ConfigLoader;
use agent_exchange::kernel::ExecutionRequest;
use agent_exchange::mcp::{Implementation, McpClient, duplex};
use agent_exchange::primitives::{AgentCapability, AgentId, AgentMetadata, CapabilityId};
use agent_exchange::registry::{PublishRequest, SearchFilter};
use agent_exchange::sandbox::{NativeEngine, SandboxHost};
use agent_exchange::telemetry::init_tracing;
use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tracing::info;

const SUMMARIZER_CODE: &str = "function summarize(input) { return input.text.slice(0, 50); }";

/// Command line options.
#[derive(Debug, Parser)]
#[command(author, version, about = "Agent exchange walkthrough")]
struct Args {
    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Text handed to the summarizer.
    #[arg(
        long,
        default_value = "Agent exchanges let authors publish sandboxed capabilities that anyone can discover and run."
    )]
    text: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_file(path);
    }
    let config = loader
        .with_process_env()
        .load()
        .context("loading configuration")?;
    init_tracing(&config.telemetry)?;

    info!("=== Agent Exchange: Marketplace Walkthrough ===");

    let exchange = AgentExchange::builder(Arc::new(engine()?))
        .config(config)
        .build()
        .await?;

    // Publish
    let metadata = summarizer_metadata("alice")?;
    let agent_id = metadata.id();
    let entry = exchange
        .registry()
        .publish_agent(PublishRequest::new(metadata, SUMMARIZER_CODE), "alice")
        .await?;
    info!(%agent_id, checksum = %entry.checksum, "published summarizer");

    // Discover
    exchange.discovery().refresh().await?;
    let results = exchange
        .discovery()
        .search("summarize", &SearchFilter::default().category("productivity"));
    info!(total = results.total, categories = ?results.facets.categories, "search results");

    // Install and execute
    let instance = exchange.install_and_instantiate(agent_id, "bob").await?;
    let result = exchange
        .runtime()
        .execute_capability(
            ExecutionRequest::new(instance.id, "bob", "summarize", json!({ "text": args.text }))
                .with_timeout(Duration::from_secs(30)),
        )
        .await?;
    info!(
        success = result.success,
        output = ?result.output,
        execution_time_ms = result.metadata.execution_time_ms,
        "direct execution"
    );

    // Expose over MCP
    let server = exchange.expose_instance(instance.id, "bob")?;
    let (server_end, client_end) = duplex();
    let serving = server.connect(server_end);
    let client = McpClient::connect(client_end, &exchange.config().mcp);
    client
        .initialize(
            Implementation::new("marketplace-demo", env!("CARGO_PKG_VERSION")),
            &exchange.config().mcp.protocol_version,
        )
        .await?;
    let tools = client.list_tools().await?;
    info!(tools = ?tools.iter().map(|tool| tool.name.as_str()).collect::<Vec<_>>(), "mcp tools");
    let call = client
        .call_tool("summarize", json!({ "text": "MCP clients reach the same sandbox." }))
        .await?;
    info!(is_error = call.is_error, text = ?call.content.first().and_then(|c| c.as_text()), "mcp call");
    drop(client);
    serving.abort();

    // Audit
    tokio::time::sleep(Duration::from_millis(50)).await;
    let summary = exchange
        .audit()
        .activity_summary(Duration::from_secs(60 * 60))
        .await?;
    info!(
        total = summary.total,
        success = summary.success,
        failure = summary.failure,
        blocked = summary.blocked,
        "audit summary"
    );
    for action in &summary.top_actions {
        info!(action = %action.name, count = action.count, "audited action");
    }

    exchange.shutdown();
    info!("=== Walkthrough complete ===");
    Ok(())
}

fn engine() -> Result<NativeEngine> {
    let engine = NativeEngine::new();
    engine.register("summarize", |input: Value, host: Arc<SandboxHost>| async move {
        host.info("summarizing");
        let text = input["text"].as_str().unwrap_or_default();
        Ok(json!(text.chars().take(50).collect::<String>()))
    })?;
    Ok(engine)
}

fn summarizer_metadata(author: &str) -> Result<AgentMetadata> {
    let capability = AgentCapability::builder(CapabilityId::new("summarize")?)
        .name("summarize")?
        .description("Returns the first fifty characters of `text`")
        .input_schema(json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"],
        }))
        .category("text")
        .build()?;
    Ok(AgentMetadata::builder(AgentId::random())
        .name("Summarizer")?
        .version("1.0.0")?
        .author(author)?
        .description("Summarizes long documents")
        .category("productivity")
        .tags(["text", "summaries"])
        .capabilities(vec![capability])
        .build()?)
}
