use std::sync::Arc;
use std::time::Duration;

use agent_exchange::AgentExchange;
use agent_exchange::config::ExchangeConfig;
use agent_exchange::kernel::ExecutionRequest;
use agent_exchange::mcp::{Implementation, McpClient, duplex};
use agent_exchange::primitives::{AgentCapability, AgentId, AgentMetadata, CapabilityId};
use agent_exchange::registry::{
    PublishRequest, RegistryError, SearchFilter, compute_checksum,
};
use agent_exchange::sandbox::{ErrorCode, NativeEngine, SandboxHost};
use agent_exchange::telemetry::AuditFilter;
use serde_json::{Value, json};

const CODE: &str = "function summarize(input) { return input.text.slice(0, 50); }";

fn capability(name: &str) -> AgentCapability {
    AgentCapability::builder(CapabilityId::new(name).unwrap())
        .name(name)
        .unwrap()
        .description("end to end capability")
        .build()
        .unwrap()
}

fn metadata(author: &str, name: &str, description: &str, category: &str, tags: &[&str]) -> AgentMetadata {
    AgentMetadata::builder(AgentId::random())
        .name(name)
        .unwrap()
        .version("1.0.0")
        .unwrap()
        .author(author)
        .unwrap()
        .description(description)
        .category(category)
        .tags(tags.iter().copied())
        .capabilities(vec![capability("summarize"), capability("slow"), capability("stamp")])
        .build()
        .unwrap()
}

fn engine() -> NativeEngine {
    let engine = NativeEngine::new();
    engine
        .register("summarize", |input: Value, host: Arc<SandboxHost>| async move {
            host.sleep(Duration::from_millis(50)).await;
            let text = input["text"].as_str().unwrap_or_default();
            Ok(json!(text.chars().take(50).collect::<String>()))
        })
        .unwrap();
    engine
        .register("slow", |_: Value, host: Arc<SandboxHost>| async move {
            host.sleep(Duration::from_secs(5)).await;
            Ok(json!("done"))
        })
        .unwrap();
    engine
        .register("stamp", |_: Value, host: Arc<SandboxHost>| async move {
            host.sleep(Duration::from_millis(100)).await;
            Ok(Value::Null)
        })
        .unwrap();
    engine
}

async fn exchange(max_concurrent: usize) -> AgentExchange {
    let mut config = ExchangeConfig::default();
    config.runtime.max_concurrent_executions = max_concurrent;
    AgentExchange::builder(Arc::new(engine()))
        .config(config)
        .build()
        .await
        .unwrap()
}

async fn publish(exchange: &AgentExchange, metadata: AgentMetadata) -> AgentId {
    let author = metadata.author().to_owned();
    exchange
        .registry()
        .publish_agent(PublishRequest::new(metadata, CODE), &author)
        .await
        .unwrap()
        .metadata
        .id()
}

fn summarizer(author: &str) -> AgentMetadata {
    metadata(author, "Summarizer", "Summarizes long documents", "productivity", &["text"])
}

#[test]
fn checksum_is_stable_and_sensitive() {
    assert_eq!(compute_checksum(CODE), compute_checksum(CODE));
    assert_ne!(compute_checksum(CODE), compute_checksum(&format!("{CODE} ")));
    assert_eq!(compute_checksum(CODE).len(), 64);
}

#[tokio::test]
async fn blocked_patterns_never_reach_the_catalog() {
    let exchange = exchange(10).await;
    let samples = [
        ("eval", "function run(input) { return eval(input); }"),
        ("Function(", "function run(input) { return new Function(input); }"),
        ("process.", "function run(input) { return process.env; }"),
        ("child_process", "function run(input) { return child_process; }"),
        ("fs.", "function run(input) { return fs.readFileSync(input); }"),
        (".spawn(", "function run(input) { return shell.spawn(input); }"),
    ];
    for (pattern, code) in samples {
        let err = exchange
            .registry()
            .publish_agent(PublishRequest::new(summarizer("alice"), code), "alice")
            .await
            .unwrap_err();
        assert!(
            matches!(err, RegistryError::BlockedPattern { pattern: found } if found == pattern),
            "{pattern}: {err}"
        );
    }
    assert!(exchange.registry().snapshot().await.unwrap().is_empty());
}

#[tokio::test]
async fn summarize_runs_well_inside_its_timeout() {
    let exchange = exchange(10).await;
    let agent_id = publish(&exchange, summarizer("alice")).await;
    let instance = exchange.install_and_instantiate(agent_id, "bob").await.unwrap();

    let text = "The quick brown fox jumps over the lazy dog and keeps running far away.";
    let result = exchange
        .runtime()
        .execute_capability(
            ExecutionRequest::new(instance.id, "bob", "summarize", json!({ "text": text }))
                .with_timeout(Duration::from_millis(30_000)),
        )
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output, Some(json!(text.chars().take(50).collect::<String>())));
    assert!(result.metadata.execution_time_ms < 1000);
    assert_eq!(exchange.registry().get_agent(agent_id).await.unwrap().download_count, 1);
}

#[tokio::test]
async fn timeout_bounds_the_execution() {
    let exchange = exchange(10).await;
    let agent_id = publish(&exchange, summarizer("alice")).await;
    let instance = exchange.install_and_instantiate(agent_id, "bob").await.unwrap();

    let result = exchange
        .runtime()
        .execute_capability(
            ExecutionRequest::new(instance.id, "bob", "slow", Value::Null)
                .with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.error.unwrap().code, ErrorCode::Timeout);
    assert!(result.metadata.execution_time_ms < 1000);
}

#[tokio::test]
async fn single_slot_serializes_executions() {
    let exchange = exchange(1).await;
    let agent_id = publish(&exchange, summarizer("alice")).await;
    let first = exchange.install_and_instantiate(agent_id, "bob").await.unwrap();
    let second = exchange.install_and_instantiate(agent_id, "bob").await.unwrap();

    let runtime = exchange.runtime();
    let (a, b) = tokio::join!(
        runtime.execute_capability(ExecutionRequest::new(first.id, "bob", "stamp", Value::Null)),
        runtime.execute_capability(ExecutionRequest::new(second.id, "bob", "stamp", Value::Null)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.success && b.success);

    let (earlier, later) = if a.completed_at <= b.completed_at {
        (a.completed_at, b.completed_at)
    } else {
        (b.completed_at, a.completed_at)
    };
    assert!(later - earlier >= chrono::Duration::milliseconds(90));
}

#[tokio::test]
async fn deleting_an_instance_terminates_its_executions() {
    let exchange = exchange(10).await;
    let agent_id = publish(&exchange, summarizer("alice")).await;
    let instance = exchange.install_and_instantiate(agent_id, "bob").await.unwrap();

    let runtime = Arc::clone(exchange.runtime());
    let pending = tokio::spawn(async move {
        runtime
            .execute_capability(ExecutionRequest::new(instance.id, "bob", "slow", Value::Null))
            .await
    });
    for _ in 0..100 {
        if exchange.runtime().active_executions_for(instance.id) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(exchange.runtime().active_executions_for(instance.id), 1);

    exchange.runtime().delete_instance(instance.id).unwrap();
    let result = pending.await.unwrap().unwrap();
    assert!(!result.success);
    assert_eq!(result.error.unwrap().code, ErrorCode::Terminated);
    assert_eq!(exchange.runtime().active_executions_for(instance.id), 0);
}

#[tokio::test]
async fn reviews_average_into_the_rating() {
    let exchange = exchange(10).await;
    let agent_id = publish(&exchange, summarizer("alice")).await;
    for (user, rating) in [("u1", 5), ("u2", 4), ("u3", 3), ("u4", 5), ("u5", 4)] {
        exchange
            .registry()
            .add_review(agent_id, user, rating, "review")
            .await
            .unwrap();
    }
    let entry = exchange.registry().get_agent(agent_id).await.unwrap();
    assert_eq!(entry.reviews.len(), 5);
    assert!((entry.rating - 4.2).abs() < 1e-9);
}

#[tokio::test]
async fn search_and_similarity_over_the_catalog() {
    let exchange = exchange(10).await;
    let dental = publish(
        &exchange,
        metadata("alice", "Dental Desk", "Dental office support assistant", "support", &["dental", "scheduling"]),
    )
    .await;
    let clinic = publish(
        &exchange,
        metadata("carol", "Clinic Desk", "Clinic front desk support", "support", &["scheduling"]),
    )
    .await;
    publish(&exchange, summarizer("dave")).await;
    assert_eq!(exchange.discovery().refresh().await.unwrap(), 3);

    let results = exchange
        .discovery()
        .search("dental", &SearchFilter::default().category("support"));
    assert_eq!(results.total, 1);
    assert_eq!(results.entries[0].metadata.id(), dental);
    assert_eq!(results.facets.categories.get("support"), Some(&1));
    assert_eq!(results.facets.authors.get("alice"), Some(&1));

    let similar = exchange.discovery().find_similar_agents(dental, 5).unwrap();
    assert!(similar.iter().all(|scored| scored.entry.metadata.id() != dental));
    assert_eq!(similar.first().map(|scored| scored.entry.metadata.id()), Some(clinic));
}

#[tokio::test]
async fn instances_are_exposed_as_mcp_tools() {
    let exchange = exchange(10).await;
    let agent_id = publish(&exchange, summarizer("alice")).await;
    let instance = exchange.install_and_instantiate(agent_id, "bob").await.unwrap();
    let server = exchange.expose_instance(instance.id, "bob").unwrap();

    let (server_end, client_end) = duplex();
    let _serving = server.connect(server_end);
    let client = McpClient::connect(client_end, &exchange.config().mcp);
    let init = client
        .initialize(Implementation::new("e2e", "0.1.0"), &exchange.config().mcp.protocol_version)
        .await
        .unwrap();
    assert_eq!(init.server_info.name, "Summarizer");

    let tools = client.list_tools().await.unwrap();
    assert!(tools.iter().any(|tool| tool.name == "summarize"));

    let result = client
        .call_tool("summarize", json!({ "text": "short text" }))
        .await
        .unwrap();
    assert!(!result.is_error);
    assert_eq!(result.content[0].as_text(), Some("short text"));

    let unknown = client.call_tool("translate", Value::Null).await.unwrap_err();
    assert!(unknown.to_string().contains("translate"), "{unknown}");

    let resources = client.list_resources().await.unwrap();
    assert_eq!(resources.len(), 1);
    let read = client.read_resource(&resources[0].uri).await.unwrap();
    assert!(read.contents[0].text.contains("Summarizer"));
}

#[tokio::test]
async fn component_signals_land_in_the_audit_log() {
    let exchange = exchange(10).await;
    let agent_id = publish(&exchange, summarizer("alice")).await;
    let instance = exchange.install_and_instantiate(agent_id, "bob").await.unwrap();
    exchange
        .runtime()
        .execute_capability(ExecutionRequest::new(
            instance.id,
            "bob",
            "summarize",
            json!({ "text": "audit me" }),
        ))
        .await
        .unwrap();

    let expected = ["agent.publish", "agent.install", "instance.create", "agent.execute"];
    let mut actions = Vec::new();
    for _ in 0..100 {
        actions = exchange
            .audit()
            .query(&AuditFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.action)
            .collect::<Vec<_>>();
        if expected.iter().all(|action| actions.iter().any(|have| have == action)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for action in expected {
        assert!(actions.iter().any(|have| have == action), "missing {action} in {actions:?}");
    }

    let bob = exchange
        .audit()
        .query(&AuditFilter::default().for_user("bob"))
        .await
        .unwrap();
    assert!(bob.iter().all(|entry| entry.user_id == "bob"));
}
