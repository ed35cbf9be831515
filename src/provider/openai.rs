//! OpenAI Chat Completions API adapter.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tracing::debug;

use crate::config::ChatGptConfig;
use crate::error::{AicliError, Result};
use crate::tools::ToolSchema;
use crate::types::*;

use super::format::{generated_call_id, parse_tool_arguments, tool_result_content};
use super::http::{
    bearer_headers, error_from_response, parse_sse_line, shared_client, LineBuffer, SseLine,
};
use super::{AdapterCapabilities, ProviderAdapter, ProviderKind};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiAdapter {
    config: ChatGptConfig,
    api_key: String,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(config: ChatGptConfig, api_key: String) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            config,
            api_key,
            base_url,
        }
    }

    pub(crate) fn build_request_body(
        &self,
        conversation: &Conversation,
        tools: &[ToolSchema],
    ) -> serde_json::Value {
        let mut messages = Vec::with_capacity(conversation.len() + 1);
        if let Some(system) = &self.config.system_prompt {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        for msg in conversation {
            messages.extend(message_to_openai(msg));
        }

        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "stream": true,
        });

        if !tools.is_empty() {
            if let Some(obj) = body.as_object_mut() {
                let tool_defs: Vec<serde_json::Value> = tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect();
                obj.insert("tools".into(), tool_defs.into());
                obj.insert("tool_choice".into(), "auto".into());
            }
        }

        body
    }
}

/// One conversation message may become several wire messages (one per tool result).
fn message_to_openai(msg: &Message) -> Vec<serde_json::Value> {
    match msg.role {
        Role::User => vec![serde_json::json!({"role": "user", "content": msg.text()})],
        Role::Assistant => {
            let tool_calls = msg.tool_calls();
            let text = msg.text();
            if tool_calls.is_empty() {
                return vec![serde_json::json!({"role": "assistant", "content": text})];
            }
            let tc_json: Vec<serde_json::Value> = tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments_value().to_string(),
                        }
                    })
                })
                .collect();
            vec![serde_json::json!({
                "role": "assistant",
                "content": if text.is_empty() { serde_json::Value::Null } else { serde_json::Value::String(text) },
                "tool_calls": tc_json,
            })]
        }
        Role::Tool => msg
            .tool_results()
            .into_iter()
            .map(|tr| {
                serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tr.id,
                    "content": tool_result_content(tr),
                })
            })
            .collect(),
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Buffers streamed function-call fragments per `index`.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialCall>,
}

impl ToolCallAccumulator {
    fn absorb(&mut self, delta: OpenAiToolCallDelta) {
        let entry = self.calls.entry(delta.index).or_default();
        if let Some(id) = delta.id.filter(|s| !s.is_empty()) {
            entry.id = Some(id);
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name.filter(|s| !s.is_empty()) {
                entry.name = Some(name);
            }
            if let Some(args) = function.arguments {
                entry.arguments.push_str(&args);
            }
        }
    }

    /// Parse every buffer once, in index order.
    fn finish(&mut self) -> Result<Vec<ToolCallRequest>> {
        std::mem::take(&mut self.calls)
            .into_iter()
            .map(|(index, call)| {
                let name = call.name.ok_or_else(|| {
                    AicliError::protocol(format!("tool call at index {index} has no function name"))
                })?;
                let arguments = parse_tool_arguments(&name, &call.arguments)?;
                let id = call.id.unwrap_or_else(generated_call_id);
                Ok(ToolCallRequest::new(id, name, arguments))
            })
            .collect()
    }
}

/// Stream position after handling one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Streaming,
    /// `finish_reason` seen; buffered calls already flushed.
    Finished,
}

fn handle_chunk(
    chunk: OpenAiStreamChunk,
    acc: &mut ToolCallAccumulator,
    state: &mut StreamState,
    out: &mut Vec<NormalizedEvent>,
) -> Result<()> {
    if let Some(error) = chunk.error {
        return Err(AicliError::protocol(format!(
            "OpenAI stream error: {}",
            error.message.unwrap_or_else(|| "unknown error".into())
        )));
    }
    for choice in chunk.choices {
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            out.push(NormalizedEvent::text(text));
        }
        for delta in choice.delta.tool_calls.unwrap_or_default() {
            acc.absorb(delta);
        }
        if choice.finish_reason.is_some() && *state == StreamState::Streaming {
            for call in acc.finish()? {
                out.push(NormalizedEvent::ToolCallRequested { call });
            }
            *state = StreamState::Finished;
        }
    }
    Ok(())
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ChatGpt
    }

    fn model_id(&self) -> &str {
        &self.config.model
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_tools: true,
            supports_streaming: true,
            native_tool_protocol: true,
        }
    }

    async fn start_turn(
        &self,
        conversation: &Conversation,
        tools: &[ToolSchema],
    ) -> Result<EventStream> {
        let body = self.build_request_body(conversation, tools);
        let url = format!("{}/chat/completions", self.base_url);

        debug!(model = %self.config.model, messages = conversation.len(), "OpenAI start_turn");

        let resp = shared_client()
            .post(&url)
            .headers(bearer_headers(&self.api_key))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let byte_stream = resp.bytes_stream();

        let stream = async_stream::stream! {
            let mut lines = LineBuffer::new();
            let mut acc = ToolCallAccumulator::default();
            let mut state = StreamState::Streaming;
            let mut events = Vec::new();
            futures::pin_mut!(byte_stream);

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(AicliError::Network(e));
                        return;
                    }
                };

                for line in lines.push(&chunk) {
                    match parse_sse_line(&line) {
                        SseLine::Other => {}
                        SseLine::Done => {
                            if state == StreamState::Streaming {
                                match acc.finish() {
                                    Ok(calls) => {
                                        for call in calls {
                                            yield Ok(NormalizedEvent::ToolCallRequested { call });
                                        }
                                    }
                                    Err(e) => {
                                        yield Err(e);
                                        return;
                                    }
                                }
                            }
                            yield Ok(NormalizedEvent::TurnComplete);
                            return;
                        }
                        SseLine::Data(data) => {
                            let parsed = match serde_json::from_str::<OpenAiStreamChunk>(data) {
                                Ok(c) => c,
                                Err(e) => {
                                    yield Err(AicliError::protocol(format!("undecodable OpenAI chunk: {e}")));
                                    return;
                                }
                            };
                            let result = handle_chunk(parsed, &mut acc, &mut state, &mut events);
                            for ev in events.drain(..) {
                                yield Ok(ev);
                            }
                            if let Err(e) = result {
                                yield Err(e);
                                return;
                            }
                        }
                    }
                }
            }

            // Some compatible servers close after finish_reason without [DONE].
            if state == StreamState::Finished {
                yield Ok(NormalizedEvent::TurnComplete);
            } else {
                yield Err(AicliError::protocol("OpenAI stream ended before completion"));
            }
        };

        Ok(Box::pin(stream))
    }

    async fn validate(&self) -> Result<()> {
        let url = format!("{}/models", self.base_url);
        let resp = shared_client()
            .get(&url)
            .headers(bearer_headers(&self.api_key))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(())
    }
}

// OpenAI API stream types (internal)

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    error: Option<OpenAiStreamError>,
}

#[derive(Deserialize)]
struct OpenAiStreamError {
    message: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAiStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallDelta {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}
