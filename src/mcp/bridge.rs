//! Tool Execution Bridge.
//!
//! Runs one model-issued call against the aggregated namespace. Local tools
//! execute in-process; remote tools are forwarded to the owning session. Any
//! failure becomes a structured [`ToolOutcome`] the model can read, never an
//! error that ends the turn.
//!
//! Progress annotations travel on a per-turn side channel
//! ([`annotation_channel`]). For a given call id the channel carries exactly
//! `in-progress` followed by one terminal status. Once the turn closes its
//! [`AnnotationStream`], further annotations are dropped.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::BridgeError;
use crate::mcp::aggregator::{ToolHandler, ToolNamespace};
use crate::normalized::{NormalizedEvent, ToolStatus};

/// Lifecycle of one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl CallState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// What gets fed back to the model for a call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub content: Value,
    pub is_error: bool,
}

impl ToolOutcome {
    #[must_use]
    pub fn success(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    /// Failure shaped as `{"error": {"kind", "message"}}`.
    #[must_use]
    pub fn failure(err: &BridgeError) -> Self {
        Self {
            content: serde_json::json!({
                "error": {
                    "kind": err.kind(),
                    "message": err.to_string(),
                }
            }),
            is_error: true,
        }
    }

    /// Text form used for the `tool` message and the `tool_result` event.
    #[must_use]
    pub fn to_content_string(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// One invocation instance. The result slot is filled exactly once.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    arguments: Result<Value, String>,
    state: CallState,
    outcome: Option<ToolOutcome>,
}

impl ToolCall {
    /// Build a call from the model's raw argument string. An empty string
    /// means no arguments; invalid JSON is kept as a parse failure and
    /// reported when the call executes.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments_json: &str) -> Self {
        let arguments = if arguments_json.trim().is_empty() {
            Ok(Value::Object(serde_json::Map::new()))
        } else {
            serde_json::from_str(arguments_json).map_err(|e| e.to_string())
        };
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            state: CallState::Pending,
            outcome: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.state
    }

    #[must_use]
    pub fn outcome(&self) -> Option<&ToolOutcome> {
        self.outcome.as_ref()
    }

    /// Pending → Running.
    pub fn begin(&mut self) -> Result<(), BridgeError> {
        if self.state != CallState::Pending {
            return Err(BridgeError::invocation(
                &self.name,
                format!("call {} already started", self.id),
            ));
        }
        self.state = CallState::Running;
        Ok(())
    }

    /// Running → Succeeded | Failed. Rejects any second fill.
    pub fn finish(&mut self, outcome: ToolOutcome) -> Result<(), BridgeError> {
        if self.state != CallState::Running {
            return Err(BridgeError::invocation(
                &self.name,
                format!("call {} is {:?}, cannot record a result", self.id, self.state),
            ));
        }
        self.state = if outcome.is_error {
            CallState::Failed
        } else {
            CallState::Succeeded
        };
        self.outcome = Some(outcome);
        Ok(())
    }
}

/// Sending half of the annotation side channel, cloned into every call.
#[derive(Debug, Clone)]
pub struct AnnotationSink {
    tx: mpsc::UnboundedSender<NormalizedEvent>,
}

impl AnnotationSink {
    /// Publish a status for `call`. Returns `false` once the channel is closed.
    pub fn emit(&self, call: &ToolCall, status: ToolStatus) -> bool {
        self.tx
            .send(NormalizedEvent::ToolStatus {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                status,
            })
            .is_ok()
    }
}

/// Receiving half, owned by the turn.
#[derive(Debug)]
pub struct AnnotationStream {
    rx: mpsc::UnboundedReceiver<NormalizedEvent>,
}

impl AnnotationStream {
    pub async fn recv(&mut self) -> Option<NormalizedEvent> {
        self.rx.recv().await
    }

    /// Everything already queued, without waiting.
    pub fn drain(&mut self) -> Vec<NormalizedEvent> {
        let mut out = Vec::new();
        while let Ok(evt) = self.rx.try_recv() {
            out.push(evt);
        }
        out
    }

    /// Stop accepting annotations and return whatever was still queued.
    pub fn close(&mut self) -> Vec<NormalizedEvent> {
        self.rx.close();
        self.drain()
    }
}

/// Open the side channel for one turn.
#[must_use]
pub fn annotation_channel() -> (AnnotationSink, AnnotationStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AnnotationSink { tx }, AnnotationStream { rx })
}

impl ToolNamespace {
    /// Execute `call` and return it with its result slot filled.
    pub async fn execute(&self, mut call: ToolCall, sink: &AnnotationSink) -> ToolCall {
        if let Err(err) = call.begin() {
            tracing::warn!(tool_call_id = %call.id, error = %err, "Tool call re-executed");
            return call;
        }

        let outcome = match self.run(&call, sink).await {
            Ok(value) => ToolOutcome::success(value),
            Err(err) => {
                tracing::warn!(
                    tool_call_id = %call.id,
                    tool_name = %call.name,
                    error = %err,
                    "Tool call failed"
                );
                ToolOutcome::failure(&err)
            }
        };

        if let Err(err) = call.finish(outcome) {
            tracing::warn!(tool_call_id = %call.id, error = %err, "Tool result already recorded");
        }
        call
    }

    async fn run(&self, call: &ToolCall, sink: &AnnotationSink) -> Result<Value, BridgeError> {
        let Some(tool) = self.get(&call.name) else {
            return Err(BridgeError::invocation(&call.name, "unknown tool"));
        };
        let args = call
            .arguments
            .clone()
            .map_err(|e| BridgeError::invocation(&call.name, format!("invalid arguments JSON: {e}")))?;

        tracing::info!(
            tool_call_id = %call.id,
            tool_name = %call.name,
            origin = %tool.origin,
            "Executing tool call"
        );

        match &tool.handler {
            ToolHandler::Local(native) => {
                let progress = native.reports_progress();
                if progress {
                    sink.emit(call, ToolStatus::InProgress);
                }
                let result = native
                    .call(args)
                    .await
                    .map_err(|e| BridgeError::invocation(&call.name, format!("{e:#}")));
                if progress {
                    let status = if result.is_ok() {
                        ToolStatus::Success
                    } else {
                        ToolStatus::Failure
                    };
                    sink.emit(call, status);
                }
                result
            }
            ToolHandler::Remote {
                session,
                remote_name,
            } => session.invoke(remote_name, args).await.map_err(|err| match err {
                // Report under the name the model used.
                BridgeError::Invocation { reason, .. } => {
                    BridgeError::invocation(&call.name, reason)
                }
                other => other,
            }),
        }
    }
}
