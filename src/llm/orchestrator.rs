//! Conversational turn driver.
//!
//! One call to [`Orchestrator::run_turn`] is one chat turn:
//! 1. Snapshot the server registry and build the turn's tool namespace
//! 2. Stream a model response, collecting any tool calls
//! 3. Execute the step's tool calls concurrently, forwarding progress annotations
//! 4. Feed results back and repeat, at most `max_steps` times
//! 5. Close every session and the side channel, then emit `done`
//!
//! The turn is bounded by a wall-clock deadline and observes a cancellation
//! token. Dropping the returned stream mid-turn drops the turn's sessions,
//! which closes them.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use futures::stream::BoxStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::error::BridgeError;
use crate::mcp::aggregator::{Aggregator, TurnSessions};
use crate::mcp::bridge::{ToolCall, annotation_channel};
use crate::mcp::config::ServerMap;
use crate::mcp::store::ServerRegistry;
use crate::normalized::NormalizedEvent;

use super::{ChatCompletionsDriver, LlmDriver, LlmRequest, LlmSettings, Message};

/// Per-turn bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnLimits {
    /// Model calls allowed in one turn.
    pub max_steps: usize,
    /// Wall-clock bound on the whole turn.
    pub timeout: Duration,
}

impl From<&ChatConfig> for TurnLimits {
    fn from(chat: &ChatConfig) -> Self {
        Self {
            max_steps: chat.max_steps.max(1),
            timeout: chat.turn_timeout(),
        }
    }
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self::from(&ChatConfig::default())
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TurnEnd {
    Completed,
    BudgetExhausted,
    TimedOut,
    Cancelled,
    Failed(String),
}

impl TurnEnd {
    fn error_event(&self, limits: TurnLimits) -> Option<NormalizedEvent> {
        let (message, code) = match self {
            Self::Completed => return None,
            Self::BudgetExhausted => (
                BridgeError::BudgetExceeded {
                    max_steps: limits.max_steps,
                }
                .to_string(),
                "STEP_BUDGET_EXHAUSTED",
            ),
            Self::TimedOut => (
                format!("turn exceeded {}s", limits.timeout.as_secs()),
                "TURN_TIMEOUT",
            ),
            Self::Cancelled => ("turn cancelled".to_string(), "CANCELLED"),
            Self::Failed(message) => (message.clone(), "LLM_ERROR"),
        };
        Some(NormalizedEvent::Error {
            message,
            code: Some(code.to_string()),
        })
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::BudgetExhausted => "budget_exhausted",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }
}

/// Run `fut` unless the turn is cancelled or its deadline passes first.
async fn guarded<F: Future>(
    fut: F,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<F::Output, TurnEnd> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(TurnEnd::Cancelled),
        () = tokio::time::sleep_until(deadline) => Err(TurnEnd::TimedOut),
        out = fut => Ok(out),
    }
}

enum Progress {
    Annotation(NormalizedEvent),
    Finished(Vec<ToolCall>),
    Interrupted(TurnEnd),
}

/// Turn driver over an [`LlmDriver`] and a per-turn tool namespace.
#[derive(Clone)]
pub struct Orchestrator {
    driver: Arc<dyn LlmDriver>,
    registry: Arc<dyn ServerRegistry>,
    aggregator: Aggregator,
    limits: TurnLimits,
    system_prompt: Option<String>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("driver", &self.driver)
            .field("limits", &self.limits)
            .finish()
    }
}

impl Orchestrator {
    /// Orchestrator talking to a Chat Completions endpoint.
    pub fn new(
        settings: LlmSettings,
        registry: Arc<dyn ServerRegistry>,
        aggregator: Aggregator,
        limits: TurnLimits,
    ) -> Self {
        Self::with_driver(
            Arc::new(ChatCompletionsDriver::new(settings)),
            registry,
            aggregator,
            limits,
        )
    }

    pub fn with_driver(
        driver: Arc<dyn LlmDriver>,
        registry: Arc<dyn ServerRegistry>,
        aggregator: Aggregator,
        limits: TurnLimits,
    ) -> Self {
        Self {
            driver,
            registry,
            aggregator,
            limits,
            system_prompt: None,
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    #[must_use]
    pub fn limits(&self) -> TurnLimits {
        self.limits
    }

    #[must_use]
    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<dyn ServerRegistry> {
        &self.registry
    }

    /// Run one chat turn over `messages`.
    ///
    /// The stream always starts with `stream.start` and, unless dropped
    /// early, ends with `done`. A turn that stops for any reason other than
    /// a final answer emits one `error` event right before `done`.
    #[allow(clippy::too_many_lines)]
    pub fn run_turn(
        &self,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> BoxStream<'static, NormalizedEvent> {
        let this = self.clone();
        let request_id = Uuid::new_v4().to_string();

        let stream = async_stream::stream! {
            yield NormalizedEvent::StreamStart {
                request_id: request_id.clone(),
            };

            let limits = this.limits;
            let deadline = Instant::now() + limits.timeout;
            let (sink, mut annotations) = annotation_channel();
            let mut sessions: Option<TurnSessions> = None;
            let mut end = TurnEnd::Completed;

            let mut message_json: Vec<serde_json::Value> = this
                .system_prompt
                .iter()
                .map(|p| Message::system(p.as_str()))
                .chain(messages)
                .filter_map(|m| serde_json::to_value(m).ok())
                .collect();

            'turn: {
                let snapshot = match guarded(this.registry.list(), &cancel, deadline).await {
                    Ok(Ok(snapshot)) => snapshot,
                    Ok(Err(err)) => {
                        tracing::warn!(
                            request_id = %request_id,
                            error = %err,
                            "Server registry unreadable, continuing with built-in tools"
                        );
                        ServerMap::new()
                    }
                    Err(interrupted) => {
                        end = interrupted;
                        break 'turn;
                    }
                };

                let built = match guarded(this.aggregator.build(&snapshot), &cancel, deadline).await {
                    Ok(built) => built,
                    Err(interrupted) => {
                        end = interrupted;
                        break 'turn;
                    }
                };
                let namespace = built.namespace;
                let tools = namespace.openai_tools_json();
                sessions = Some(built.sessions);

                tracing::info!(
                    request_id = %request_id,
                    message_count = message_json.len(),
                    server_count = snapshot.len(),
                    failed_servers = built.failures.len(),
                    tool_count = tools.len(),
                    "Starting chat turn"
                );

                for step in 1..=limits.max_steps {
                    tracing::debug!(
                        request_id = %request_id,
                        step = step,
                        message_count = message_json.len(),
                        "Requesting model response"
                    );

                    let req = LlmRequest {
                        messages: message_json.clone(),
                        tools: tools.clone(),
                    };
                    let mut driver_stream = match guarded(this.driver.stream(req), &cancel, deadline).await {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            tracing::error!(request_id = %request_id, step = step, error = %e, "Failed to create driver stream");
                            end = TurnEnd::Failed(e.to_string());
                            break 'turn;
                        }
                        Err(interrupted) => {
                            end = interrupted;
                            break 'turn;
                        }
                    };

                    let mut assistant_text = String::new();
                    let mut calls: Vec<ToolCall> = Vec::new();
                    let mut completed: BTreeMap<usize, (String, String, String)> = BTreeMap::new();

                    loop {
                        let item = match guarded(driver_stream.next(), &cancel, deadline).await {
                            Ok(Some(item)) => item,
                            Ok(None) => break,
                            Err(interrupted) => {
                                end = interrupted;
                                break 'turn;
                            }
                        };
                        match item {
                            Ok(NormalizedEvent::MessageDelta { text }) => {
                                assistant_text.push_str(&text);
                                yield NormalizedEvent::MessageDelta { text };
                            }
                            Ok(evt @ NormalizedEvent::ToolCallDelta { .. }) => {
                                yield evt;
                            }
                            Ok(NormalizedEvent::ToolCallComplete { call_index, id, name, arguments_json }) => {
                                completed.insert(call_index, (id.clone(), name.clone(), arguments_json.clone()));
                                yield NormalizedEvent::ToolCallComplete { call_index, id, name, arguments_json };
                            }
                            Ok(NormalizedEvent::Error { message, .. }) => {
                                end = TurnEnd::Failed(message);
                                break 'turn;
                            }
                            Ok(NormalizedEvent::Done) => break,
                            Ok(_) => {}
                            Err(e) => {
                                tracing::error!(request_id = %request_id, step = step, error = %e, "Model stream failed");
                                end = TurnEnd::Failed(e.to_string());
                                break 'turn;
                            }
                        }
                    }

                    if completed.is_empty() {
                        tracing::info!(
                            request_id = %request_id,
                            step = step,
                            "Model produced a final answer"
                        );
                        break 'turn;
                    }

                    message_json.push(serde_json::json!({
                        "role": "assistant",
                        "content": if assistant_text.is_empty() { serde_json::Value::Null } else { serde_json::Value::String(assistant_text) },
                        "tool_calls": completed.values().map(|(id, name, arguments)| serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": { "name": name, "arguments": arguments }
                        })).collect::<Vec<_>>()
                    }));

                    for (id, name, arguments) in completed.into_values() {
                        tracing::info!(
                            request_id = %request_id,
                            step = step,
                            tool_call_id = %id,
                            tool_name = %name,
                            "Tool call requested"
                        );
                        calls.push(ToolCall::new(id, name, &arguments));
                    }

                    // All calls of a step run at once; annotations stream while they do.
                    let finished = {
                        let mut exec = std::pin::pin!(join_all(
                            calls.into_iter().map(|call| namespace.execute(call, &sink))
                        ));
                        loop {
                            let progress = tokio::select! {
                                biased;
                                () = cancel.cancelled() => Progress::Interrupted(TurnEnd::Cancelled),
                                () = tokio::time::sleep_until(deadline) => Progress::Interrupted(TurnEnd::TimedOut),
                                Some(evt) = annotations.recv() => Progress::Annotation(evt),
                                done = &mut exec => Progress::Finished(done),
                            };
                            match progress {
                                Progress::Annotation(evt) => {
                                    yield evt;
                                }
                                Progress::Finished(done) => break Some(done),
                                Progress::Interrupted(interrupted) => {
                                    end = interrupted;
                                    break None;
                                }
                            }
                        }
                    };
                    let Some(finished) = finished else {
                        break 'turn;
                    };

                    // A call's annotations always precede its result.
                    for evt in annotations.drain() {
                        yield evt;
                    }

                    for call in finished {
                        let (content, success) = match call.outcome() {
                            Some(outcome) => (outcome.to_content_string(), !outcome.is_error),
                            None => ("{\"error\":{\"kind\":\"invocation\",\"message\":\"no result\"}}".to_string(), false),
                        };
                        tracing::info!(
                            request_id = %request_id,
                            step = step,
                            tool_call_id = %call.id,
                            tool_name = %call.name,
                            success = success,
                            result_length = content.len(),
                            "Tool call finished"
                        );
                        yield NormalizedEvent::ToolResult {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            content: content.clone(),
                            success,
                        };
                        message_json.push(serde_json::json!({
                            "role": "tool",
                            "tool_call_id": call.id,
                            "content": content
                        }));
                    }

                    if step == limits.max_steps {
                        end = TurnEnd::BudgetExhausted;
                    }
                }
            }

            // Teardown runs on every exit path that still owns the stream.
            if let Some(sessions) = sessions.take() {
                sessions.close_all();
            }
            for evt in annotations.close() {
                yield evt;
            }

            match &end {
                TurnEnd::Completed => tracing::info!(request_id = %request_id, "Chat turn completed"),
                other => tracing::warn!(request_id = %request_id, outcome = other.label(), "Chat turn ended early"),
            }
            if let Some(evt) = end.error_event(limits) {
                yield evt;
            }
            yield NormalizedEvent::Done;
        };

        Box::pin(stream)
    }
}
