//! Tool-Source Connector: one live MCP session per server per turn.
//!
//! [`Connector::connect`] opens a session from a [`ServerDescriptor`];
//! [`ToolSession::discover`] lists its tools and [`ToolSession::invoke`]
//! forwards calls. The rmcp-backed implementation admits one outstanding
//! request per session; parallelism only happens across sessions.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, JsonObject, RawContent},
    service::{Peer, RoleClient, RunningService, ServiceExt},
    transport::{StreamableHttpClientTransport, TokioChildProcess},
};
use serde_json::Value;
use tokio::process::Command;

use crate::error::BridgeError;
use crate::mcp::config::{ServerDescriptor, expand_env_map, expand_env_placeholders};

/// A tool as advertised by a remote server. The schema is kept opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTool {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Arc<JsonObject>,
}

/// An open connection to one MCP server.
#[async_trait]
pub trait ToolSession: Send + Sync + std::fmt::Debug {
    /// Registry key of the server this session belongs to.
    fn server_name(&self) -> &str;

    /// List the server's advertised tools.
    async fn discover(&self) -> Result<Vec<RemoteTool>, BridgeError>;

    /// Call `remote_name` with `args`, returning the server's result verbatim.
    async fn invoke(&self, remote_name: &str, args: Value) -> Result<Value, BridgeError>;

    /// Release the transport. Idempotent; later calls fail.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Opens sessions from descriptors.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    async fn connect(
        &self,
        server: &str,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<dyn ToolSession>, BridgeError>;
}

type ClientService = RunningService<RoleClient, ()>;

/// Connector speaking MCP through rmcp over stdio or streamable HTTP.
#[derive(Debug, Clone)]
pub struct RmcpConnector {
    handshake_timeout: Duration,
}

impl RmcpConnector {
    #[must_use]
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

impl Default for RmcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for RmcpConnector {
    async fn connect(
        &self,
        server: &str,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<dyn ToolSession>, BridgeError> {
        let connection_error = |reason: String| BridgeError::Connection {
            server: server.to_string(),
            reason,
        };

        let handshake = async {
            match descriptor {
                ServerDescriptor::Process { command, args, env } => {
                    let mut cmd = Command::new(command);
                    cmd.args(args).envs(expand_env_map(env)).kill_on_drop(true);

                    let transport = TokioChildProcess::new(cmd)
                        .map_err(|e| connection_error(format!("failed to spawn '{command}': {e}")))?;
                    ().serve(transport)
                        .await
                        .map_err(|e| connection_error(e.to_string()))
                }
                ServerDescriptor::Network { url } => {
                    let transport =
                        StreamableHttpClientTransport::from_uri(expand_env_placeholders(url));
                    ().serve(transport)
                        .await
                        .map_err(|e| connection_error(e.to_string()))
                }
            }
        };

        let service = tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|elapsed| {
                connection_error(format!(
                    "handshake did not complete within {:?} ({elapsed})",
                    self.handshake_timeout
                ))
            })??;

        tracing::debug!(
            server = %server,
            transport = descriptor.transport(),
            "MCP session opened"
        );

        Ok(Arc::new(RmcpSession::new(server, service)))
    }
}

/// Live rmcp client session.
pub struct RmcpSession {
    server: String,
    peer: Peer<RoleClient>,
    // Dropping the running service cancels it and tears down the transport.
    service: Mutex<Option<ClientService>>,
    open: AtomicBool,
    call_gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for RmcpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RmcpSession")
            .field("server", &self.server)
            .field("open", &self.is_open())
            .finish()
    }
}

impl RmcpSession {
    fn new(server: &str, service: ClientService) -> Self {
        Self {
            server: server.to_string(),
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
            open: AtomicBool::new(true),
            call_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn ensure_open(&self, tool: Option<&str>) -> Result<(), BridgeError> {
        if self.is_open() {
            return Ok(());
        }
        let reason = "session is closed".to_string();
        Err(match tool {
            Some(tool) => BridgeError::Invocation {
                tool: tool.to_string(),
                reason,
            },
            None => BridgeError::Discovery {
                server: self.server.clone(),
                reason,
            },
        })
    }
}

/// Flatten the text parts of a tool result for an error message.
fn error_text(result: &rmcp::model::CallToolResult) -> String {
    let text: Vec<&str> = result
        .content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect();
    if text.is_empty() {
        "tool reported an error".to_string()
    } else {
        text.join("\n")
    }
}

#[async_trait]
impl ToolSession for RmcpSession {
    fn server_name(&self) -> &str {
        &self.server
    }

    async fn discover(&self) -> Result<Vec<RemoteTool>, BridgeError> {
        self.ensure_open(None)?;
        let _gate = self.call_gate.lock().await;
        let tools = self
            .peer
            .list_all_tools()
            .await
            .map_err(|e| BridgeError::Discovery {
                server: self.server.clone(),
                reason: e.to_string(),
            })?;

        Ok(tools
            .into_iter()
            .map(|t| RemoteTool {
                name: t.name.to_string(),
                description: t.description.map(std::borrow::Cow::into_owned),
                input_schema: t.input_schema,
            })
            .collect())
    }

    async fn invoke(&self, remote_name: &str, args: Value) -> Result<Value, BridgeError> {
        self.ensure_open(Some(remote_name))?;
        let _gate = self.call_gate.lock().await;

        let arguments = match args {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(BridgeError::invocation(
                    remote_name,
                    format!("arguments must be a JSON object, got {other}"),
                ));
            }
        };

        let result = self
            .peer
            .call_tool(CallToolRequestParam {
                name: remote_name.to_string().into(),
                arguments,
            })
            .await
            .map_err(|e| {
                BridgeError::invocation(remote_name, format!("tools/call on '{}': {e}", self.server))
            })?;

        if result.is_error == Some(true) {
            return Err(BridgeError::invocation(remote_name, error_text(&result)));
        }

        serde_json::to_value(&result).map_err(|e| BridgeError::invocation(remote_name, e))
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let service = match self.service.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(service);
        tracing::debug!(server = %self.server, "MCP session closed");
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for RmcpSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Minimal line-delimited JSON-RPC peer answering the handshake,
    /// `tools/list` and `tools/call`.
    async fn scripted_server(stream: DuplexStream) {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let request: Value = serde_json::from_str(&line).unwrap();
            let Some(id) = request.get("id").cloned() else {
                continue;
            };
            let result = match request["method"].as_str() {
                Some("initialize") => json!({
                    "protocolVersion": request["params"]["protocolVersion"],
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "clock", "version": "0.1.0"}
                }),
                Some("tools/list") => json!({"tools": [
                    {"name": "now", "description": "Current time", "inputSchema": {"type": "object"}},
                    {"name": "fail", "inputSchema": {"type": "object"}}
                ]}),
                Some("tools/call") if request["params"]["name"] == "fail" => json!({
                    "content": [{"type": "text", "text": "clock is broken"}],
                    "isError": true
                }),
                Some("tools/call") => json!({
                    "content": [{"type": "text", "text": "12:00"}],
                    "isError": false
                }),
                _ => json!({}),
            };
            let reply = json!({"jsonrpc": "2.0", "id": id, "result": result});
            let mut bytes = serde_json::to_vec(&reply).unwrap();
            bytes.push(b'\n');
            if write.write_all(&bytes).await.is_err() {
                break;
            }
        }
    }

    async fn open_session() -> RmcpSession {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(scripted_server(server));
        let service = ().serve(tokio::io::split(client)).await.unwrap();
        RmcpSession::new("clock", service)
    }

    fn process(command: &str, args: &[&str]) -> ServerDescriptor {
        ServerDescriptor::Process {
            command: command.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            env: std::collections::HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_connection_error() {
        let connector = RmcpConnector::new(Duration::from_secs(5));
        let err = connector
            .connect("ghost", &process("/nonexistent/mcp-bin", &[]))
            .await
            .unwrap_err();

        match err {
            BridgeError::Connection { server, reason } => {
                assert_eq!(server, "ghost");
                assert!(reason.contains("/nonexistent/mcp-bin"), "{reason}");
            }
            other => panic!("expected connection error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_process_exiting_before_handshake_is_a_connection_error() {
        let connector = RmcpConnector::new(Duration::from_secs(5));
        let err = connector
            .connect("echo", &process("echo", &["hi"]))
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Connection { ref server, .. } if server == "echo"));
    }

    #[tokio::test]
    async fn test_silent_process_hits_handshake_timeout() {
        let connector = RmcpConnector::new(Duration::from_millis(200));
        let err = connector
            .connect("mute", &process("sleep", &["30"]))
            .await
            .unwrap_err();

        match err {
            BridgeError::Connection { reason, .. } => {
                assert!(reason.contains("handshake did not complete"), "{reason}");
            }
            other => panic!("expected connection error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_discover_and_invoke() {
        let session = open_session().await;
        assert_eq!(session.server_name(), "clock");

        let tools = session.discover().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["now", "fail"]);
        assert_eq!(tools[0].description.as_deref(), Some("Current time"));
        assert_eq!(tools[1].description, None);

        let result = session.invoke("now", json!({})).await.unwrap();
        assert_eq!(result["content"][0]["text"], "12:00");

        let err = session.invoke("fail", Value::Null).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Invocation { ref tool, ref reason } if tool == "fail" && reason == "clock is broken"
        ));

        let err = session.invoke("now", json!([1, 2])).await.unwrap_err();
        assert!(err.to_string().contains("must be a JSON object"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = open_session().await;
        assert!(session.is_open());

        session.close();
        assert!(!session.is_open());
        session.close();
        assert!(!session.is_open());

        assert!(matches!(
            session.discover().await.unwrap_err(),
            BridgeError::Discovery { .. }
        ));
        let err = session.invoke("now", json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::Invocation { ref reason, .. } if reason == "session is closed"));
    }
}
