use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{Value, json};

use mcp_chat::AppState;
use mcp_chat::config::{AppConfig, ChatConfig};
use mcp_chat::llm::{LlmDriver, Orchestrator, TurnLimits};
use mcp_chat::mcp::aggregator::Aggregator;
use mcp_chat::mcp::config::{ServerDescriptor, ServerMap};
use mcp_chat::mcp::session::Connector;
use mcp_chat::mcp::store::{FileRegistry, MemoryRegistry, ServerRegistry};
use mcp_chat::normalized::{NormalizedEvent, ToolStatus};
use mcp_chat::server::build_router;
use mcp_chat::testing::{FakeConnector, FakeServer, ScriptedDriver, Step};
use mcp_chat::tools;

fn test_config() -> AppConfig {
    AppConfig {
        chat: ChatConfig {
            comparison_delay_ms: 0,
            ..ChatConfig::default()
        },
        ..AppConfig::default()
    }
}

fn network(name: &str) -> ServerDescriptor {
    ServerDescriptor::Network {
        url: format!("http://{name}.invalid/mcp"),
    }
}

fn app(
    registry: Arc<dyn ServerRegistry>,
    connector: &Arc<FakeConnector>,
    driver: &Arc<ScriptedDriver>,
) -> TestServer {
    let config = Arc::new(test_config());
    let aggregator = Aggregator::new(
        Arc::clone(connector) as Arc<dyn Connector>,
        tools::builtin_tools(&config.chat),
        Duration::from_secs(5),
    );
    let orchestrator = Orchestrator::with_driver(
        Arc::clone(driver) as Arc<dyn LlmDriver>,
        registry,
        aggregator,
        TurnLimits::from(&config.chat),
    );
    let state = AppState::new(Arc::new(orchestrator), config);
    TestServer::new(build_router(state)).unwrap()
}

/// Decode an SSE body into the events it carries, skipping keep-alive comments.
fn parse_sse(body: &str) -> Vec<(String, NormalizedEvent)> {
    body.split("\n\n")
        .filter_map(|frame| {
            let mut name = None;
            let mut data = None;
            for line in frame.lines() {
                if let Some(v) = line.strip_prefix("event:") {
                    name = Some(v.trim().to_string());
                } else if let Some(v) = line.strip_prefix("data:") {
                    data = Some(v.trim().to_string());
                }
            }
            let event = serde_json::from_str(&data?).unwrap();
            Some((name?, event))
        })
        .collect()
}

#[tokio::test]
async fn test_health() {
    let server = app(
        Arc::new(MemoryRegistry::new()),
        &Arc::new(FakeConnector::new()),
        &Arc::new(ScriptedDriver::new(vec![])),
    );

    let response = server.get("/health").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>(), json!({ "status": "ok" }));
}

#[tokio::test]
async fn test_registry_crud_persists_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcp.json");
    let server = app(
        Arc::new(FileRegistry::new(&path)),
        &Arc::new(FakeConnector::new()),
        &Arc::new(ScriptedDriver::new(vec![])),
    );

    let response = server.get("/api/mcp").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>(), json!({}));

    let response = server
        .post("/api/mcp")
        .json(&json!({
            "mcpServer": "time",
            "config": { "command": "npx", "args": ["-y", "@mcpcentral/mcp-time"], "env": {} }
        }))
        .await;
    response.assert_status_ok();
    assert_eq!(
        response.json::<Value>(),
        json!({ "success": true, "mcpServer": "time" })
    );

    server
        .post("/api/mcp")
        .json(&json!({ "mcpServer": "web", "config": { "url": "https://example.com/mcp" } }))
        .await
        .assert_status_ok();

    let listed: ServerMap = server.get("/api/mcp").await.json();
    assert_eq!(
        listed.keys().map(String::as_str).collect::<Vec<_>>(),
        ["time", "web"]
    );

    // The file on disk is the familiar mcpServers document.
    let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk["mcpServers"]["time"]["command"], "npx");
    assert_eq!(on_disk["mcpServers"]["web"]["url"], "https://example.com/mcp");

    let response = server
        .delete("/api/mcp")
        .json(&json!({ "mcpServer": "time" }))
        .await;
    response.assert_status_ok();
    assert_eq!(
        response.json::<Value>(),
        json!({ "success": true, "mcpServer": "time" })
    );

    // Removing again is still a success.
    server
        .delete("/api/mcp")
        .json(&json!({ "mcpServer": "time" }))
        .await
        .assert_status_ok();

    let listed: ServerMap = server.get("/api/mcp").await.json();
    assert_eq!(listed.len(), 1);
    assert!(listed.contains_key("web"));
}

#[tokio::test]
async fn test_registry_listing_survives_a_hand_edited_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcp.json");
    std::fs::write(
        &path,
        r#"{ "mcpServers": {
            "time": { "command": "npx", "args": ["-y", "@mcpcentral/mcp-time"] },
            "oops": { "comand": "typo" }
        } }"#,
    )
    .unwrap();
    let server = app(
        Arc::new(FileRegistry::new(&path)),
        &Arc::new(FakeConnector::new()),
        &Arc::new(ScriptedDriver::new(vec![])),
    );

    let response = server.get("/api/mcp").await;
    response.assert_status_ok();
    let listed: ServerMap = response.json();
    assert_eq!(listed.keys().map(String::as_str).collect::<Vec<_>>(), ["time"]);
}

#[tokio::test]
async fn test_invalid_registry_writes_are_rejected() {
    let registry = Arc::new(MemoryRegistry::new());
    let server = app(
        Arc::clone(&registry) as Arc<dyn ServerRegistry>,
        &Arc::new(FakeConnector::new()),
        &Arc::new(ScriptedDriver::new(vec![])),
    );

    let response = server
        .post("/api/mcp")
        .json(&json!({ "mcpServer": "", "config": { "url": "https://example.com/mcp" } }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(
        response.json::<Value>(),
        json!({ "error": "Invalid server name" })
    );

    for config in [
        json!({ "command": "echo" }),
        json!({ "url": "ftp://example.com" }),
        json!("npx server"),
        Value::Null,
    ] {
        let response = server
            .post("/api/mcp")
            .json(&json!({ "mcpServer": "x", "config": config }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(
            response.json::<Value>(),
            json!({ "error": "Invalid server configuration" })
        );
    }

    server
        .delete("/api/mcp")
        .json(&json!({}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    assert!(registry.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_tool_listing_reports_origins_failures_and_collisions() {
    let registry = Arc::new(MemoryRegistry::with_servers(
        ["broken", "calc", "time"]
            .into_iter()
            .map(|n| (n.to_string(), network(n)))
            .collect(),
    ));
    let connector = Arc::new(
        FakeConnector::new()
            .with_server("broken", FakeServer::unreachable())
            .with_server("calc", FakeServer::with_tools(&["calculateSum"]))
            .with_server("time", FakeServer::with_tools(&["now"])),
    );
    let server = app(registry, &connector, &Arc::new(ScriptedDriver::new(vec![])));

    let response = server.get("/api/tools").await;
    response.assert_status_ok();
    let body: Value = response.json();

    let names: Vec<&str> = body["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["calculateSum", "isGreaterThan", "now"]);
    assert_eq!(
        body["tools"][0]["origin"],
        json!({ "kind": "server", "server": "calc" })
    );
    assert_eq!(body["tools"][1]["origin"], json!({ "kind": "builtin" }));

    assert_eq!(body["failures"][0]["server"], "broken");
    assert_eq!(body["failures"][0]["kind"], "connection");
    assert_eq!(body["collisions"][0]["name"], "calculateSum");

    assert_eq!(connector.opened_total(), 2);
    assert_eq!(connector.open_sessions(), 0);
}

#[tokio::test]
async fn test_chat_turn_streams_tool_activity_over_sse() {
    let registry = Arc::new(MemoryRegistry::with_servers(
        std::iter::once(("time".to_string(), network("time"))).collect(),
    ));
    let connector = Arc::new(
        FakeConnector::new().with_server("time", FakeServer::with_tools(&["now"])),
    );
    let driver = Arc::new(ScriptedDriver::new(vec![
        Step::tools(&[("call_1", "calculateSum", r#"{"a":2,"b":3}"#)]),
        Step::tools(&[("call_2", "isGreaterThan", r#"{"a":5,"b":3}"#)]),
        Step::text("2 + 3 = 5, and 5 is greater than 3."),
    ]));
    let server = app(registry, &connector, &driver);

    let response = server
        .post("/api/chat")
        .json(&json!({
            "messages": [{ "role": "user", "content": "Add 2 and 3, then check if the sum beats 3." }]
        }))
        .await;
    response.assert_status_ok();
    assert!(
        response
            .header("content-type")
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let events = parse_sse(&response.text());
    let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names.first(), Some(&"stream.start"));
    assert_eq!(names.last(), Some(&"done"));
    assert!(!names.contains(&"error"));

    let results: Vec<(&str, &str)> = events
        .iter()
        .filter_map(|(_, e)| match e {
            NormalizedEvent::ToolResult { id, content, .. } => Some((id.as_str(), content.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(results, [("call_1", "5"), ("call_2", "true")]);

    let statuses: Vec<ToolStatus> = events
        .iter()
        .filter_map(|(_, e)| match e {
            NormalizedEvent::ToolStatus {
                tool_call_id,
                status,
                ..
            } if tool_call_id == "call_2" => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, [ToolStatus::InProgress, ToolStatus::Success]);

    // Every model request saw built-ins plus the server's tool.
    let requests = driver.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].tools.len(), 3);
    assert_eq!(connector.open_sessions(), 0);
}

#[tokio::test]
async fn test_chat_rejects_empty_conversation() {
    let server = app(
        Arc::new(MemoryRegistry::new()),
        &Arc::new(FakeConnector::new()),
        &Arc::new(ScriptedDriver::new(vec![])),
    );

    let response = server
        .post("/api/chat")
        .json(&json!({ "messages": [] }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert!(response.json::<Value>()["error"].is_string());
}

#[tokio::test]
async fn test_chat_budget_exhaustion_is_reported_on_the_stream() {
    let driver = Arc::new(ScriptedDriver::always_tool(
        "calculateSum",
        r#"{"a":1,"b":1}"#,
    ));
    let server = app(
        Arc::new(MemoryRegistry::new()),
        &Arc::new(FakeConnector::new()),
        &driver,
    );

    let response = server
        .post("/api/chat")
        .json(&json!({ "messages": [{ "role": "user", "content": "loop" }] }))
        .await;
    response.assert_status_ok();

    let events = parse_sse(&response.text());
    let tail: Vec<&str> = events.iter().rev().take(2).map(|(n, _)| n.as_str()).collect();
    assert_eq!(tail, ["done", "error"]);
    assert!(events.iter().any(|(_, e)| matches!(
        e,
        NormalizedEvent::Error { code: Some(code), .. } if code == "STEP_BUDGET_EXHAUSTED"
    )));
    assert_eq!(driver.call_count(), 5);
}
