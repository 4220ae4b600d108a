//! OpenAI-compatible Chat Completions driver.
//!
//! Posts to the provider's chat completions URL with `stream: true` and turns
//! the SSE frames into [`NormalizedEvent`]s. Frame decoding lives in
//! [`FrameDecoder`] so it can be exercised without a network.

use std::collections::BTreeMap;

use anyhow::Context;
use futures::StreamExt;

use crate::normalized::NormalizedEvent;

use super::{DriverStream, LlmDriver, LlmRequest, LlmSettings, Provider};

/// Accumulated state for a streaming tool call.
#[derive(Debug, Default)]
struct ToolAccum {
    id: Option<String>,
    name: Option<String>,
    args: String,
}

/// Incremental decoder from raw SSE bytes to events.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    tool_accum: BTreeMap<usize, ToolAccum>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> anyhow::Result<Vec<NormalizedEvent>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some((pos, sep_len)) = find_frame_end(&self.buf) {
            let frame = self.buf.drain(..pos + sep_len).collect::<Vec<_>>();
            let text = String::from_utf8_lossy(&frame);

            for line in text.lines() {
                let line = line.trim();
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();

                if data == "[DONE]" {
                    self.flush_tool_calls(&mut out);
                    out.push(NormalizedEvent::Done);
                    continue;
                }

                let v: serde_json::Value =
                    serde_json::from_str(data).context("malformed chat completion chunk")?;
                if let Some(message) = v.get("error").and_then(|e| e.get("message")) {
                    anyhow::bail!("provider error: {message}");
                }
                self.decode_chunk(&v, &mut out);
            }
        }
        Ok(out)
    }

    fn decode_chunk(&mut self, v: &serde_json::Value, out: &mut Vec<NormalizedEvent>) {
        let choice = &v["choices"][0];
        let delta = &choice["delta"];

        // Assistant text delta
        if let Some(s) = delta.get("content").and_then(|x| x.as_str())
            && !s.is_empty()
        {
            out.push(NormalizedEvent::MessageDelta {
                text: s.to_string(),
            });
        }

        // Tool calls streaming deltas
        if let Some(arr) = delta.get("tool_calls").and_then(|x| x.as_array()) {
            for tc in arr {
                let idx = tc.get("index").and_then(serde_json::Value::as_u64).unwrap_or(0) as usize;
                let id = tc.get("id").and_then(|x| x.as_str()).map(ToString::to_string);
                let function = tc.get("function");
                let name = function
                    .and_then(|f| f.get("name"))
                    .and_then(|x| x.as_str())
                    .map(ToString::to_string);
                let args_delta = function
                    .and_then(|f| f.get("arguments"))
                    .and_then(|x| x.as_str())
                    .map(ToString::to_string);

                let entry = self.tool_accum.entry(idx).or_default();
                if entry.id.is_none() {
                    entry.id.clone_from(&id);
                }
                if entry.name.is_none() {
                    entry.name.clone_from(&name);
                }
                if let Some(ad) = &args_delta {
                    entry.args.push_str(ad);
                }

                out.push(NormalizedEvent::ToolCallDelta {
                    call_index: idx,
                    id,
                    name,
                    arguments_delta: args_delta,
                });
            }
        }

        // Any finish reason closes the calls assembled so far; some
        // compatible endpoints end tool calls with "stop".
        if choice.get("finish_reason").and_then(|x| x.as_str()).is_some() {
            self.flush_tool_calls(out);
        }
    }

    fn flush_tool_calls(&mut self, out: &mut Vec<NormalizedEvent>) {
        for (idx, a) in std::mem::take(&mut self.tool_accum) {
            if let (Some(id), Some(name)) = (a.id, a.name) {
                out.push(NormalizedEvent::ToolCallComplete {
                    call_index: idx,
                    id,
                    name,
                    arguments_json: a.args,
                });
            }
        }
    }
}

/// Driver for the Chat Completions API.
#[derive(Clone)]
pub struct ChatCompletionsDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsDriver")
            .field("base_url", &self.settings.base_url)
            .field("model", &self.settings.model)
            .field("provider", &self.settings.provider)
            .finish()
    }
}

impl ChatCompletionsDriver {
    /// Create a new Chat Completions driver with the given settings.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn request_body(&self, req: LlmRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.settings.model,
            "stream": true,
            "messages": req.messages,
        });
        if !req.tools.is_empty() {
            body["tools"] = serde_json::Value::Array(req.tools);
            body["tool_choice"] = "auto".into();
            if let Some(parallel) = self.settings.parallel_tool_calls
                && self.settings.provider.supports_parallel_tools()
            {
                body["parallel_tool_calls"] = parallel.into();
            }
        }
        body
    }
}

#[async_trait::async_trait]
impl LlmDriver for ChatCompletionsDriver {
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<DriverStream> {
        let url = self
            .settings
            .provider
            .build_chat_url(&self.settings.base_url, &self.settings.model);
        let body = self.request_body(req);

        let mut rb = self.http.post(&url).json(&body);
        if let Some(k) = &self.settings.api_key {
            rb = match self.settings.provider {
                Provider::AzureOpenAI { .. } => rb.header("api-key", k),
                _ => rb.bearer_auth(k),
            };
        }

        let resp = rb
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            anyhow::bail!("model API returned {status}: {detail}");
        }
        let byte_stream = resp.bytes_stream();

        let out = async_stream::try_stream! {
            let mut decoder = FrameDecoder::new();
            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk?;
                for event in decoder.push(&chunk)? {
                    yield event;
                }
            }
        };

        Ok(Box::pin(out))
    }
}

/// Position and length of the first blank-line frame separator.
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}
