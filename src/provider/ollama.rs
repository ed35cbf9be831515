//! Ollama `/api/generate` adapter.
//!
//! The generate endpoint has no tool protocol, so the conversation is
//! flattened into a single prompt and tool calls are recovered from the text
//! with a [`DirectiveParser`].

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tracing::debug;

use crate::config::OllamaConfig;
use crate::error::{AicliError, Result};
use crate::tools::ToolSchema;
use crate::tunnel::TunnelEndpoint;
use crate::types::*;

use super::directive::{DirectiveChunk, DirectiveParser};
use super::http::{error_from_response, shared_client, LineBuffer};
use super::{AdapterCapabilities, ProviderAdapter, ProviderKind};

/// How long a request waits for a degraded tunnel to recover.
const TUNNEL_RECOVERY_WAIT: Duration = Duration::from_secs(15);
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OllamaAdapter {
    config: OllamaConfig,
    endpoint: Option<TunnelEndpoint>,
}

impl OllamaAdapter {
    pub fn new(config: OllamaConfig) -> Self {
        Self {
            config,
            endpoint: None,
        }
    }

    /// Route requests through a tunnel's local port instead of `base_url`.
    pub fn with_tunnel(mut self, endpoint: TunnelEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Resolved before every request so a reconnected tunnel is picked up.
    async fn base_url(&self) -> Result<String> {
        match &self.endpoint {
            Some(endpoint) => {
                let port = endpoint.acquire(TUNNEL_RECOVERY_WAIT).await?;
                Ok(format!("http://127.0.0.1:{port}"))
            }
            None => Ok(self.config.base_url.trim_end_matches('/').to_string()),
        }
    }

    pub(crate) fn build_request_body(
        &self,
        conversation: &Conversation,
        tools: &[ToolSchema],
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "prompt": build_prompt(self.config.system_prompt.as_deref(), conversation, tools),
            "stream": true,
        });
        if !self.config.options.is_empty() {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("options".into(), serde_json::json!(self.config.options));
            }
        }
        body
    }
}

/// Flatten the conversation into `Human:` / `Assistant:` / `Tool result:` sections.
pub(crate) fn build_prompt(
    system_prompt: Option<&str>,
    conversation: &Conversation,
    tools: &[ToolSchema],
) -> String {
    let mut parts = Vec::new();
    if let Some(system) = system_prompt {
        parts.push(format!("System: {system}"));
    }
    if !tools.is_empty() {
        parts.push(tool_catalogue(tools));
    }

    for msg in conversation {
        match msg.role {
            Role::User => parts.push(format!("Human: {}", msg.text())),
            Role::Assistant => {
                let mut section = format!("Assistant: {}", msg.text());
                for call in msg.tool_calls() {
                    let directive = serde_json::json!({
                        "tool_call": {"name": call.name, "arguments": call.arguments},
                    });
                    section.push_str(&format!("\n{directive}"));
                }
                parts.push(section);
            }
            Role::Tool => {
                for result in msg.tool_results() {
                    parts.push(format!("Tool result: {}", result.model_text()));
                }
            }
        }
    }

    parts.push("Assistant:".to_string());
    parts.join("\n\n")
}

fn tool_catalogue(tools: &[ToolSchema]) -> String {
    let mut out = String::from("Available tools:\n");
    for tool in tools {
        out.push_str(&format!(
            "- {}: {} Parameters: {}\n",
            tool.name, tool.description, tool.parameters
        ));
    }
    out.push_str(
        "\nIf you need to use a tool, respond with JSON format: \
         {\"tool_call\": {\"name\": \"tool_name\", \"arguments\": {...}}}",
    );
    out
}

fn to_events(chunks: Vec<DirectiveChunk>) -> impl Iterator<Item = NormalizedEvent> {
    chunks.into_iter().map(|chunk| match chunk {
        DirectiveChunk::Text(text) => NormalizedEvent::TextDelta { text },
        DirectiveChunk::Call(call) => NormalizedEvent::ToolCallRequested { call },
    })
}

/// Handle one NDJSON line. Returns `Ok(true)` once `done` is seen.
fn handle_line(
    line: &str,
    parser: &mut DirectiveParser,
    out: &mut Vec<NormalizedEvent>,
) -> Result<bool> {
    let chunk: OllamaGenerateChunk = serde_json::from_str(line)
        .map_err(|e| AicliError::protocol(format!("undecodable Ollama chunk: {e}")))?;
    if let Some(error) = chunk.error {
        return Err(AicliError::protocol(format!("Ollama error: {error}")));
    }
    if let Some(text) = chunk.response.filter(|t| !t.is_empty()) {
        out.extend(to_events(parser.push(&text)?));
    }
    if chunk.done {
        out.extend(to_events(parser.finish()));
        out.push(NormalizedEvent::TurnComplete);
        return Ok(true);
    }
    Ok(false)
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn model_id(&self) -> &str {
        &self.config.model
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_tools: true,
            supports_streaming: true,
            native_tool_protocol: false,
        }
    }

    async fn start_turn(
        &self,
        conversation: &Conversation,
        tools: &[ToolSchema],
    ) -> Result<EventStream> {
        let base_url = self.base_url().await?;
        let body = self.build_request_body(conversation, tools);
        let url = format!("{base_url}/api/generate");

        debug!(model = %self.config.model, url = %url, "Ollama start_turn");

        // Bounds the header wait and each idle gap, never the whole body.
        let idle = Duration::from_secs(self.config.timeout_secs);
        let request = shared_client().post(&url).json(&body).send();
        let resp = match tokio::time::timeout(idle, request).await {
            Ok(resp) => resp?,
            Err(_) => return Err(AicliError::Timeout(millis(idle))),
        };

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let byte_stream = resp.bytes_stream();

        let stream = async_stream::stream! {
            let mut lines = LineBuffer::new();
            let mut parser = DirectiveParser::new();
            let mut events = Vec::new();
            futures::pin_mut!(byte_stream);

            let mut ended = false;
            while !ended {
                let next = match tokio::time::timeout(idle, byte_stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        yield Err(AicliError::Timeout(millis(idle)));
                        return;
                    }
                };
                let pending: Vec<String> = match next {
                    Some(Ok(chunk)) => lines.push(&chunk),
                    Some(Err(e)) => {
                        yield Err(AicliError::Network(e));
                        return;
                    }
                    None => {
                        // A final line may arrive without a trailing newline.
                        ended = true;
                        lines.finish().into_iter().collect()
                    }
                };

                for line in pending {
                    let done = handle_line(&line, &mut parser, &mut events);
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

            yield Err(AicliError::protocol("Ollama stream ended before done"));
        };

        Ok(Box::pin(stream))
    }

    async fn validate(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url().await?);
        let resp = shared_client()
            .get(&url)
            .timeout(VALIDATE_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Deserialize)]
struct OllamaGenerateChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}
