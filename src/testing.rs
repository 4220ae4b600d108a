//! In-process stand-ins for MCP servers and the model, used by unit and
//! integration tests. Nothing here spawns a process or opens a socket.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BridgeError;
use crate::llm::{DriverStream, LlmDriver, LlmRequest};
use crate::mcp::config::ServerDescriptor;
use crate::mcp::session::{Connector, RemoteTool, ToolSession};
use crate::normalized::NormalizedEvent;

/// A remote tool entry with the given schema.
#[must_use]
pub fn fake_tool(name: &str, schema: Value) -> RemoteTool {
    let schema = match schema {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    RemoteTool {
        name: name.to_string(),
        description: Some(format!("{name} (fake)")),
        input_schema: Arc::new(schema),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ConnectBehavior {
    #[default]
    Accept,
    Refuse,
    Hang,
}

/// Scripted behavior of one fake MCP server.
#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    tools: Vec<RemoteTool>,
    connect: ConnectBehavior,
    discovery_fails: bool,
    responses: HashMap<String, Result<Value, String>>,
    call_delay: Duration,
}

impl FakeServer {
    #[must_use]
    pub fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names
                .iter()
                .map(|n| fake_tool(n, serde_json::json!({ "type": "object" })))
                .collect(),
            ..Self::default()
        }
    }

    /// Connecting fails as if the process could not be spawned.
    #[must_use]
    pub fn unreachable() -> Self {
        Self {
            connect: ConnectBehavior::Refuse,
            ..Self::default()
        }
    }

    /// Connects, but `tools/list` fails.
    #[must_use]
    pub fn discovery_fails() -> Self {
        Self {
            discovery_fails: true,
            ..Self::default()
        }
    }

    /// The handshake never completes.
    #[must_use]
    pub fn hangs_on_connect() -> Self {
        Self {
            connect: ConnectBehavior::Hang,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn respond(mut self, tool: &str, result: Value) -> Self {
        self.responses.insert(tool.to_string(), Ok(result));
        self
    }

    #[must_use]
    pub fn fail_call(mut self, tool: &str, reason: &str) -> Self {
        self.responses
            .insert(tool.to_string(), Err(reason.to_string()));
        self
    }

    /// Every call takes this long.
    #[must_use]
    pub fn call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    open: AtomicUsize,
    opened: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<(String, String)>>,
}

/// Connector over [`FakeServer`] scripts. Tracks how many sessions are open.
#[derive(Debug, Default)]
pub struct FakeConnector {
    servers: HashMap<String, FakeServer>,
    counters: Arc<Counters>,
}

impl FakeConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_server(mut self, name: &str, server: FakeServer) -> Self {
        self.servers.insert(name.to_string(), server);
        self
    }

    /// Sessions opened and not yet closed.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }

    /// Sessions opened over the connector's lifetime.
    #[must_use]
    pub fn opened_total(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    /// Highest number of remote calls observed running at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }

    /// `(server, remote tool)` for every call, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, String)> {
        self.counters
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Open a session to `name` directly.
    pub async fn session(&self, name: &str) -> Result<Arc<dyn ToolSession>, BridgeError> {
        let descriptor = ServerDescriptor::Network {
            url: format!("http://{name}.invalid/mcp"),
        };
        self.connect(name, &descriptor).await
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        server: &str,
        _descriptor: &ServerDescriptor,
    ) -> Result<Arc<dyn ToolSession>, BridgeError> {
        let Some(script) = self.servers.get(server) else {
            return Err(BridgeError::Connection {
                server: server.to_string(),
                reason: "no such fake server".to_string(),
            });
        };
        match script.connect {
            ConnectBehavior::Refuse => {
                return Err(BridgeError::Connection {
                    server: server.to_string(),
                    reason: "No such file or directory (os error 2)".to_string(),
                });
            }
            ConnectBehavior::Hang => std::future::pending::<()>().await,
            ConnectBehavior::Accept => {}
        }

        self.counters.open.fetch_add(1, Ordering::SeqCst);
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSession {
            server: server.to_string(),
            script: script.clone(),
            counters: Arc::clone(&self.counters),
            open: AtomicBool::new(true),
            gate: tokio::sync::Mutex::new(()),
        }))
    }
}

/// Session produced by [`FakeConnector`]. Serializes its own calls.
#[derive(Debug)]
pub struct FakeSession {
    server: String,
    script: FakeServer,
    counters: Arc<Counters>,
    open: AtomicBool,
    gate: tokio::sync::Mutex<()>,
}

struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ToolSession for FakeSession {
    fn server_name(&self) -> &str {
        &self.server
    }

    async fn discover(&self) -> Result<Vec<RemoteTool>, BridgeError> {
        if !self.is_open() || self.script.discovery_fails {
            return Err(BridgeError::Discovery {
                server: self.server.clone(),
                reason: "method not found".to_string(),
            });
        }
        Ok(self.script.tools.clone())
    }

    async fn invoke(&self, remote_name: &str, _args: Value) -> Result<Value, BridgeError> {
        if !self.is_open() {
            return Err(BridgeError::invocation(remote_name, "session is closed"));
        }
        let _gate = self.gate.lock().await;
        let _in_flight = InFlight::enter(&self.counters);
        self.counters
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((self.server.clone(), remote_name.to_string()));

        if !self.script.call_delay.is_zero() {
            tokio::time::sleep(self.script.call_delay).await;
        }

        match self.script.responses.get(remote_name) {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(reason)) => Err(BridgeError::invocation(remote_name, reason)),
            None => Ok(serde_json::json!({
                "content": [{ "type": "text", "text": format!("{remote_name} ok") }],
                "isError": false
            })),
        }
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.counters.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// One scripted model response.
#[derive(Debug, Clone)]
pub enum Step {
    Events(Vec<NormalizedEvent>),
    /// The response stream never yields.
    Stall,
    /// The request itself fails.
    Fail(String),
}

impl Step {
    /// A response that only streams text.
    #[must_use]
    pub fn text(text: &str) -> Self {
        Self::Events(vec![
            NormalizedEvent::MessageDelta {
                text: text.to_string(),
            },
            NormalizedEvent::Done,
        ])
    }

    /// A response requesting `(id, name, arguments_json)` tool calls.
    #[must_use]
    pub fn tools(calls: &[(&str, &str, &str)]) -> Self {
        let mut events = Vec::new();
        for (idx, (id, name, args)) in calls.iter().enumerate() {
            events.push(NormalizedEvent::ToolCallDelta {
                call_index: idx,
                id: Some((*id).to_string()),
                name: Some((*name).to_string()),
                arguments_delta: Some((*args).to_string()),
            });
        }
        for (idx, (id, name, args)) in calls.iter().enumerate() {
            events.push(NormalizedEvent::ToolCallComplete {
                call_index: idx,
                id: (*id).to_string(),
                name: (*name).to_string(),
                arguments_json: (*args).to_string(),
            });
        }
        events.push(NormalizedEvent::Done);
        Self::Events(events)
    }
}

#[derive(Debug)]
enum Fallback {
    Exhausted,
    AlwaysTool { name: String, arguments: String },
}

/// Model stand-in replaying [`Step`]s in order and recording every request.
#[derive(Debug)]
pub struct ScriptedDriver {
    steps: Mutex<VecDeque<Step>>,
    fallback: Fallback,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedDriver {
    #[must_use]
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback: Fallback::Exhausted,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A model that requests `name` on every call and never answers.
    #[must_use]
    pub fn always_tool(name: &str, arguments: &str) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: Fallback::AlwaysTool {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
            requests: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl LlmDriver for ScriptedDriver {
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<DriverStream> {
        let n = {
            let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
            requests.push(req);
            requests.len()
        };
        let next = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        let step = match (next, &self.fallback) {
            (Some(step), _) => step,
            (None, Fallback::AlwaysTool { name, arguments }) => {
                let id = format!("call_{n}");
                Step::tools(&[(id.as_str(), name.as_str(), arguments.as_str())])
            }
            (None, Fallback::Exhausted) => {
                anyhow::bail!("scripted driver has no response for request {n}")
            }
        };

        match step {
            Step::Events(events) => Ok(Box::pin(futures::stream::iter(
                events.into_iter().map(Ok),
            ))),
            Step::Stall => Ok(Box::pin(futures::stream::pending())),
            Step::Fail(message) => Err(anyhow::anyhow!(message)),
        }
    }
}
