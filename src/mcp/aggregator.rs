//! Tool Namespace Aggregator.
//!
//! Connects to every registered server concurrently, discovers their tools
//! concurrently, and merges them over the built-in tool table into one flat
//! namespace. Merge order is: built-ins first, then servers in registry
//! enumeration order (ascending name). A later source silently replaces an
//! earlier one on a name clash; each replacement is recorded as a
//! [`Collision`] and logged.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use rmcp::model::JsonObject;
use serde::Serialize;

use crate::error::BridgeError;
use crate::mcp::config::ServerMap;
use crate::mcp::session::{Connector, RemoteTool, ToolSession};

/// A tool implemented in-process.
#[async_trait]
pub trait NativeTool: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> schemars::Schema;

    /// Whether the bridge should bracket calls with progress annotations.
    fn reports_progress(&self) -> bool {
        false
    }

    async fn call(&self, args: serde_json::Value) -> anyhow::Result<serde_json::Value>;
}

/// Parameter contract of a tool.
#[derive(Debug, Clone)]
pub enum ToolSchema {
    /// Derived from a Rust argument type.
    Local(schemars::Schema),
    /// Whatever the server advertised, passed through uninterpreted.
    Remote(Arc<JsonObject>),
}

impl ToolSchema {
    /// JSON Schema in the shape the model API expects for `parameters`.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Local(schema) => {
                let mut value = schema.clone().to_value();
                if let Some(map) = value.as_object_mut() {
                    map.remove("$schema");
                    map.remove("title");
                }
                value
            }
            Self::Remote(obj) => serde_json::Value::Object((**obj).clone()),
        }
    }
}

/// Where an aggregated tool came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "server", rename_all = "snake_case")]
pub enum ToolOrigin {
    Builtin,
    Server(String),
}

impl std::fmt::Display for ToolOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Builtin => write!(f, "builtin"),
            Self::Server(name) => write!(f, "server '{name}'"),
        }
    }
}

/// Invocation capability bound to a tool.
#[derive(Debug, Clone)]
pub enum ToolHandler {
    Local(Arc<dyn NativeTool>),
    Remote {
        session: Arc<dyn ToolSession>,
        remote_name: String,
    },
}

/// One entry of the aggregated namespace.
#[derive(Debug, Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub schema: ToolSchema,
    pub origin: ToolOrigin,
    pub handler: ToolHandler,
}

impl Tool {
    #[must_use]
    pub fn native(tool: Arc<dyn NativeTool>) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            schema: ToolSchema::Local(tool.schema()),
            origin: ToolOrigin::Builtin,
            handler: ToolHandler::Local(tool),
        }
    }

    #[must_use]
    pub fn remote(session: &Arc<dyn ToolSession>, tool: RemoteTool) -> Self {
        Self {
            name: sanitize_tool_name(&tool.name),
            description: tool.description.unwrap_or_default(),
            schema: ToolSchema::Remote(tool.input_schema),
            origin: ToolOrigin::Server(session.server_name().to_string()),
            handler: ToolHandler::Remote {
                session: Arc::clone(session),
                remote_name: tool.name,
            },
        }
    }

    /// Whether calls to this tool emit progress annotations.
    #[must_use]
    pub fn reports_progress(&self) -> bool {
        match &self.handler {
            ToolHandler::Local(native) => native.reports_progress(),
            ToolHandler::Remote { .. } => false,
        }
    }
}

/// Sanitize tool names for `OpenAI` API compatibility.
pub fn sanitize_tool_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// A name clash resolved during merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collision {
    pub name: String,
    pub replaced: ToolOrigin,
    pub winner: ToolOrigin,
}

/// Flat name → tool mapping handed to the turn driver.
#[derive(Debug, Clone, Default)]
pub struct ToolNamespace {
    tools: BTreeMap<String, Tool>,
    collisions: Vec<Collision>,
}

impl ToolNamespace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `tool`, replacing any earlier entry of the same name.
    pub fn overlay(&mut self, tool: Tool) {
        let winner = tool.origin.clone();
        if let Some(previous) = self.tools.insert(tool.name.clone(), tool) {
            let collision = Collision {
                name: previous.name,
                replaced: previous.origin,
                winner,
            };
            tracing::warn!(
                tool_name = %collision.name,
                replaced = %collision.replaced,
                winner = %collision.winner,
                "Tool name collision, later source wins"
            );
            self.collisions.push(collision);
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn tools(&self) -> impl Iterator<Item = &Tool> {
        self.tools.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    #[must_use]
    pub fn collisions(&self) -> &[Collision] {
        &self.collisions
    }

    /// Tool definitions in `OpenAI` function-calling format.
    pub fn openai_tools_json(&self) -> Vec<serde_json::Value> {
        self.tools
            .values()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.schema.to_json()
                    }
                })
            })
            .collect()
    }
}

/// Sessions opened for one turn. Closing is idempotent and also happens on drop,
/// so an abandoned turn never leaks a transport.
#[derive(Debug, Default)]
pub struct TurnSessions {
    sessions: Vec<Arc<dyn ToolSession>>,
    closed: AtomicBool,
}

impl TurnSessions {
    fn new(sessions: Vec<Arc<dyn ToolSession>>) -> Self {
        Self {
            sessions,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions still holding a transport.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_open()).count()
    }

    pub fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for session in &self.sessions {
            session.close();
        }
        if !self.sessions.is_empty() {
            tracing::debug!(count = self.sessions.len(), "Closed turn sessions");
        }
    }
}

impl Drop for TurnSessions {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// A server that contributed nothing to this turn, and why.
#[derive(Debug, Clone, Serialize)]
pub struct ServerFailure {
    pub server: String,
    pub kind: &'static str,
    pub message: String,
}

impl From<(&str, &BridgeError)> for ServerFailure {
    fn from((server, err): (&str, &BridgeError)) -> Self {
        Self {
            server: server.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result of aggregation for one turn.
#[derive(Debug)]
pub struct AggregatedTools {
    pub namespace: ToolNamespace,
    pub sessions: TurnSessions,
    pub failures: Vec<ServerFailure>,
}

/// Builds per-turn namespaces from a registry snapshot.
#[derive(Debug, Clone)]
pub struct Aggregator {
    connector: Arc<dyn Connector>,
    builtins: Vec<Arc<dyn NativeTool>>,
    connect_timeout: Duration,
}

impl Aggregator {
    pub fn new(
        connector: Arc<dyn Connector>,
        builtins: Vec<Arc<dyn NativeTool>>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            builtins,
            connect_timeout,
        }
    }

    /// Namespace with built-ins only.
    #[must_use]
    pub fn builtin_namespace(&self) -> ToolNamespace {
        let mut namespace = ToolNamespace::new();
        for native in &self.builtins {
            namespace.overlay(Tool::native(Arc::clone(native)));
        }
        namespace
    }

    /// Connect, discover and merge. Never fails as a whole: servers that
    /// cannot connect or list tools are reported in `failures` and skipped.
    pub async fn build(&self, snapshot: &ServerMap) -> AggregatedTools {
        // Connect to all servers at once; one slow or broken server must not hold up the rest.
        let connects = snapshot.iter().map(|(name, descriptor)| async move {
            let outcome =
                match tokio::time::timeout(self.connect_timeout, self.connector.connect(name, descriptor))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(BridgeError::Connection {
                        server: name.clone(),
                        reason: format!("no session within {:?}", self.connect_timeout),
                    }),
                };
            (name.as_str(), outcome)
        });
        let connected = join_all(connects).await;

        let mut failures = Vec::new();
        let mut sessions: Vec<Arc<dyn ToolSession>> = Vec::new();
        for (name, outcome) in connected {
            match outcome {
                Ok(session) => sessions.push(session),
                Err(err) => {
                    tracing::warn!(server = %name, error = %err, "MCP server unavailable for this turn");
                    failures.push(ServerFailure::from((name, &err)));
                }
            }
        }

        let discovered = join_all(sessions.iter().map(|session| async move {
            (Arc::clone(session), session.discover().await)
        }))
        .await;

        let mut namespace = self.builtin_namespace();
        let mut live = Vec::with_capacity(discovered.len());
        for (session, result) in discovered {
            match result {
                Ok(tools) => {
                    tracing::debug!(
                        server = %session.server_name(),
                        tool_count = tools.len(),
                        "MCP tools discovered"
                    );
                    for tool in tools {
                        namespace.overlay(Tool::remote(&session, tool));
                    }
                    live.push(session);
                }
                Err(err) => {
                    tracing::warn!(
                        server = %session.server_name(),
                        error = %err,
                        "MCP tool discovery failed"
                    );
                    failures.push(ServerFailure::from((session.server_name(), &err)));
                    session.close();
                }
            }
        }

        AggregatedTools {
            namespace,
            sessions: TurnSessions::new(live),
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::config::ServerDescriptor;
    use crate::testing::{FakeConnector, FakeServer, fake_tool};
    use crate::tools::math::{CalculateSum, IsGreaterThan};
    use std::collections::HashMap;

    fn process(name: &str) -> ServerDescriptor {
        ServerDescriptor::Process {
            command: name.to_string(),
            args: vec![],
            env: HashMap::new(),
        }
    }

    fn snapshot(names: &[&str]) -> ServerMap {
        names.iter().map(|n| ((*n).to_string(), process(n))).collect()
    }

    fn builtins() -> Vec<Arc<dyn NativeTool>> {
        vec![
            Arc::new(CalculateSum),
            Arc::new(IsGreaterThan::new(Duration::ZERO)),
        ]
    }

    fn aggregator(connector: &Arc<FakeConnector>) -> Aggregator {
        Aggregator::new(
            Arc::clone(connector) as Arc<dyn Connector>,
            builtins(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_disjoint_sources_all_present() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_server("a", FakeServer::with_tools(&["alpha", "shared_a"]))
                .with_server("b", FakeServer::with_tools(&["beta"])),
        );
        let built = aggregator(&connector).build(&snapshot(&["a", "b"])).await;

        let names: Vec<_> = built.namespace.names().collect();
        assert_eq!(
            names,
            vec!["alpha", "beta", "calculateSum", "isGreaterThan", "shared_a"]
        );
        assert!(built.namespace.collisions().is_empty());
        assert!(built.failures.is_empty());
        assert_eq!(built.sessions.open_count(), 2);
    }

    #[tokio::test]
    async fn test_later_source_wins_collision() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_server("a", FakeServer::with_tools(&["X"]))
                .with_server("b", FakeServer::with_tools(&["X"])),
        );
        let built = aggregator(&connector).build(&snapshot(&["a", "b"])).await;

        let tool = built.namespace.get("X").unwrap();
        assert_eq!(tool.origin, ToolOrigin::Server("b".into()));
        assert_eq!(
            built.namespace.collisions(),
            &[Collision {
                name: "X".into(),
                replaced: ToolOrigin::Server("a".into()),
                winner: ToolOrigin::Server("b".into()),
            }]
        );
    }

    #[tokio::test]
    async fn test_server_can_shadow_builtin() {
        let connector = Arc::new(
            FakeConnector::new().with_server("calc", FakeServer::with_tools(&["calculateSum"])),
        );
        let built = aggregator(&connector).build(&snapshot(&["calc"])).await;
        let tool = built.namespace.get("calculateSum").unwrap();
        assert!(matches!(tool.handler, ToolHandler::Remote { .. }));
        assert_eq!(built.namespace.collisions()[0].replaced, ToolOrigin::Builtin);
    }

    #[tokio::test]
    async fn test_one_failed_connection_does_not_sink_the_rest() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_server("a", FakeServer::with_tools(&["alpha"]))
                .with_server("b", FakeServer::unreachable())
                .with_server("c", FakeServer::with_tools(&["gamma"])),
        );
        let built = aggregator(&connector)
            .build(&snapshot(&["a", "b", "c"]))
            .await;

        let names: Vec<_> = built.namespace.names().collect();
        assert_eq!(names, vec!["alpha", "calculateSum", "gamma", "isGreaterThan"]);
        assert_eq!(built.failures.len(), 1);
        assert_eq!(built.failures[0].server, "b");
        assert_eq!(built.failures[0].kind, "connection");
    }

    #[tokio::test]
    async fn test_discovery_failure_closes_that_session() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_server("a", FakeServer::with_tools(&["alpha"]))
                .with_server("broken", FakeServer::discovery_fails()),
        );
        let built = aggregator(&connector)
            .build(&snapshot(&["a", "broken"]))
            .await;

        assert_eq!(built.failures[0].kind, "discovery");
        assert_eq!(built.sessions.len(), 1);
        assert_eq!(connector.open_sessions(), 1);

        drop(built);
        assert_eq!(connector.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_server_times_out() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_server("slow", FakeServer::hangs_on_connect())
                .with_server("ok", FakeServer::with_tools(&["fine"])),
        );
        let built = aggregator(&connector)
            .build(&snapshot(&["ok", "slow"]))
            .await;
        assert!(built.namespace.get("fine").is_some());
        assert_eq!(built.failures[0].server, "slow");
        assert!(built.failures[0].message.contains("no session within"));
    }

    #[tokio::test]
    async fn test_empty_registry_yields_builtins_only() {
        let connector = Arc::new(FakeConnector::new());
        let built = aggregator(&connector).build(&ServerMap::new()).await;
        assert_eq!(built.namespace.len(), 2);
        assert!(built.sessions.is_empty());
    }

    #[test]
    fn test_sanitize_tool_name() {
        assert_eq!(sanitize_tool_name("time::now"), "time__now");
        assert_eq!(sanitize_tool_name("web.search-v2"), "web_search-v2");
    }

    #[test]
    fn test_remote_schema_passes_through() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": { "q": { "type": "string", "x-custom": [1, 2] } }
        });
        let tool = fake_tool("search", schema.clone());
        assert_eq!(ToolSchema::Remote(tool.input_schema).to_json(), schema);
    }

    #[test]
    fn test_local_schema_strips_meta_keys() {
        let ns = Aggregator::new(Arc::new(FakeConnector::new()), builtins(), Duration::ZERO)
            .builtin_namespace();
        let json = ns.openai_tools_json();
        let sum = json
            .iter()
            .find(|t| t["function"]["name"] == "calculateSum")
            .unwrap();
        let params = &sum["function"]["parameters"];
        assert!(params.get("$schema").is_none());
        assert_eq!(params["type"], "object");
        assert!(params["properties"]["a"].is_object());
    }
}
