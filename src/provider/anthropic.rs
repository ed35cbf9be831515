//! Anthropic Messages API adapter.

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use crate::config::ClaudeConfig;
use crate::error::{AicliError, Result};
use crate::tools::ToolSchema;
use crate::types::*;

use super::format::{parse_tool_arguments, tool_result_content};
use super::http::{
    anthropic_headers, error_from_response, parse_sse_line, shared_client, LineBuffer, SseLine,
};
use super::{AdapterCapabilities, ProviderAdapter, ProviderKind};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    config: ClaudeConfig,
    api_key: String,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(config: ClaudeConfig, api_key: String) -> Self {
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

    fn build_headers(&self) -> reqwest::header::HeaderMap {
        anthropic_headers(&self.api_key, API_VERSION)
    }

    pub(crate) fn build_request_body(
        &self,
        conversation: &Conversation,
        tools: &[ToolSchema],
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": encode_messages(conversation.messages()),
            "max_tokens": self.config.max_tokens,
            "stream": true,
        });

        if let Some(obj) = body.as_object_mut() {
            if let Some(system) = &self.config.system_prompt {
                obj.insert("system".into(), system.clone().into());
            }
            if !tools.is_empty() {
                let tool_defs: Vec<serde_json::Value> = tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect();
                obj.insert("tools".into(), tool_defs.into());
            }
        }

        body
    }
}

/// Encode the conversation as Messages API turns.
///
/// Consecutive tool results are merged into a single user turn of
/// `tool_result` blocks, which is what the API expects after a `tool_use` turn.
fn encode_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    let mut out: Vec<serde_json::Value> = Vec::new();
    let mut pending_results: Vec<serde_json::Value> = Vec::new();

    let flush = |out: &mut Vec<serde_json::Value>, pending: &mut Vec<serde_json::Value>| {
        if !pending.is_empty() {
            out.push(serde_json::json!({
                "role": "user",
                "content": std::mem::take(pending),
            }));
        }
    };

    for msg in messages {
        match msg.role {
            Role::Tool => {
                for tr in msg.tool_results() {
                    pending_results.push(serde_json::json!({
                        "type": "tool_result",
                        "tool_use_id": tr.id,
                        "content": tool_result_content(tr),
                        "is_error": tr.is_error(),
                    }));
                }
            }
            Role::User => {
                flush(&mut out, &mut pending_results);
                out.push(serde_json::json!({
                    "role": "user",
                    "content": msg.text(),
                }));
            }
            Role::Assistant => {
                flush(&mut out, &mut pending_results);
                let mut content: Vec<serde_json::Value> = Vec::new();
                for part in &msg.content {
                    match part {
                        ContentPart::Text { text } if !text.is_empty() => {
                            content.push(serde_json::json!({"type": "text", "text": text}));
                        }
                        ContentPart::ToolCall(tc) => {
                            content.push(serde_json::json!({
                                "type": "tool_use",
                                "id": tc.id,
                                "name": tc.name,
                                "input": tc.arguments,
                            }));
                        }
                        _ => {}
                    }
                }
                if !content.is_empty() {
                    out.push(serde_json::json!({
                        "role": "assistant",
                        "content": content,
                    }));
                }
            }
        }
    }
    flush(&mut out, &mut pending_results);
    out
}

/// Block currently being streamed.
enum OpenBlock {
    Text,
    ToolUse {
        id: String,
        name: String,
        input: String,
    },
    Other,
}

/// Translate one decoded SSE event. Returns `Ok(true)` once the message is complete.
fn handle_event(
    event: &serde_json::Value,
    block: &mut Option<OpenBlock>,
    out: &mut Vec<NormalizedEvent>,
) -> Result<bool> {
    let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match event_type {
        "content_block_start" => {
            let Some(start) = event.get("content_block") else {
                return Err(AicliError::protocol("content_block_start without content_block"));
            };
            let btype = start.get("type").and_then(|t| t.as_str()).unwrap_or("");
            *block = Some(match btype {
                "text" => {
                    if let Some(text) = start.get("text").and_then(|t| t.as_str()) {
                        if !text.is_empty() {
                            out.push(NormalizedEvent::text(text));
                        }
                    }
                    OpenBlock::Text
                }
                "tool_use" => {
                    let id = start.get("id").and_then(|v| v.as_str());
                    let name = start.get("name").and_then(|v| v.as_str());
                    let (Some(id), Some(name)) = (id, name) else {
                        return Err(AicliError::protocol("tool_use block without id or name"));
                    };
                    OpenBlock::ToolUse {
                        id: id.to_string(),
                        name: name.to_string(),
                        input: String::new(),
                    }
                }
                _ => OpenBlock::Other,
            });
        }
        "content_block_delta" => {
            let delta = event.get("delta");
            let delta_type = delta
                .and_then(|d| d.get("type"))
                .and_then(|t| t.as_str())
                .unwrap_or("");
            match (delta_type, block.as_mut()) {
                ("text_delta", _) => {
                    if let Some(text) = delta.and_then(|d| d.get("text")).and_then(|t| t.as_str()) {
                        out.push(NormalizedEvent::text(text));
                    }
                }
                ("input_json_delta", Some(OpenBlock::ToolUse { input, .. })) => {
                    if let Some(json) = delta
                        .and_then(|d| d.get("partial_json"))
                        .and_then(|t| t.as_str())
                    {
                        input.push_str(json);
                    }
                }
                ("input_json_delta", _) => {
                    return Err(AicliError::protocol("input_json_delta outside a tool_use block"));
                }
                _ => {}
            }
        }
        "content_block_stop" => {
            if let Some(OpenBlock::ToolUse { id, name, input }) = block.take() {
                let arguments = parse_tool_arguments(&name, &input)?;
                out.push(NormalizedEvent::ToolCallRequested {
                    call: ToolCallRequest::new(id, name, arguments),
                });
            }
        }
        "message_stop" => {
            out.push(NormalizedEvent::TurnComplete);
            return Ok(true);
        }
        "error" => {
            let message = event
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(AicliError::protocol(format!("Anthropic stream error: {message}")));
        }
        // message_start, message_delta, ping
        _ => {}
    }
    Ok(false)
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
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
        let url = format!("{}/messages", self.base_url);

        debug!(model = %self.config.model, messages = conversation.len(), "Anthropic start_turn");

        let resp = shared_client()
            .post(&url)
            .headers(self.build_headers())
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let byte_stream = resp.bytes_stream();

        let stream = async_stream::stream! {
            let mut lines = LineBuffer::new();
            let mut block: Option<OpenBlock> = None;
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
                    let SseLine::Data(data) = parse_sse_line(&line) else {
                        continue;
                    };
                    let event: serde_json::Value = match serde_json::from_str(data) {
                        Ok(v) => v,
                        Err(e) => {
                            yield Err(AicliError::protocol(format!("undecodable Anthropic event: {e}")));
                            return;
                        }
                    };
                    let done = handle_event(&event, &mut block, &mut events);
                    for ev in events.drain(..) {
                        yield Ok(ev);
                    }
                    match done {
                        Ok(true) => return,
                        Ok(false) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }

            yield Err(AicliError::protocol("Anthropic stream ended before message_stop"));
        };

        Ok(Box::pin(stream))
    }

    async fn validate(&self) -> Result<()> {
        let url = format!("{}/models", self.base_url);
        let resp = shared_client()
            .get(&url)
            .headers(self.build_headers())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(())
    }
}
