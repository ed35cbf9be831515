//! Provider adapter trait and the three backend implementations.
//!
//! Every adapter turns a [`Conversation`] plus tool schemas into one backend
//! request and normalizes the streamed response into [`NormalizedEvent`]s:
//! text deltas, fully assembled tool calls, and exactly one `TurnComplete`.
//! An `Err` item ends the stream.

pub mod anthropic;
pub mod directive;
pub mod format;
pub mod http;
pub mod ollama;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::config::AppConfig;
use crate::error::{AicliError, Result};
use crate::tools::ToolSchema;
use crate::tunnel::TunnelEndpoint;
use crate::types::{Conversation, EventStream};

pub use anthropic::AnthropicAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

/// Supported backends.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "claude", alias = "anthropic")]
    #[strum(to_string = "claude", serialize = "anthropic")]
    Claude,
    #[serde(rename = "chatgpt", alias = "openai")]
    #[strum(to_string = "chatgpt", serialize = "openai")]
    ChatGpt,
    #[serde(rename = "ollama")]
    #[strum(to_string = "ollama")]
    Ollama,
}

/// What an adapter can do, fixed when it is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdapterCapabilities {
    pub supports_tools: bool,
    pub supports_streaming: bool,
    /// Tool calls arrive as structured protocol events rather than
    /// directives embedded in text.
    pub native_tool_protocol: bool,
}

/// Core trait implemented by all backends.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// The model ID this adapter serves.
    fn model_id(&self) -> &str;

    fn capabilities(&self) -> AdapterCapabilities;

    /// Send the conversation and stream the normalized response.
    ///
    /// Errors returned here (rather than inside the stream) happened before
    /// any event was produced.
    async fn start_turn(
        &self,
        conversation: &Conversation,
        tools: &[ToolSchema],
    ) -> Result<EventStream>;

    /// Cheap authenticated probe that the backend is reachable and usable.
    async fn validate(&self) -> Result<()>;
}

/// Build the adapter for `kind` from configuration.
///
/// `endpoint` is the tunnel endpoint for a remote Ollama server; it is
/// ignored by the hosted backends.
pub fn create_adapter(
    kind: ProviderKind,
    config: &AppConfig,
    endpoint: Option<TunnelEndpoint>,
) -> Result<Arc<dyn ProviderAdapter>> {
    let providers = &config.providers;
    match kind {
        ProviderKind::Claude => {
            let claude = &providers.claude;
            let api_key = claude
                .api_key
                .clone()
                .ok_or_else(|| AicliError::Authentication("Missing ANTHROPIC_API_KEY".into()))?;
            Ok(Arc::new(AnthropicAdapter::new(claude.clone(), api_key)))
        }
        ProviderKind::ChatGpt => {
            let chatgpt = &providers.chatgpt;
            let api_key = chatgpt
                .api_key
                .clone()
                .ok_or_else(|| AicliError::Authentication("Missing OPENAI_API_KEY".into()))?;
            Ok(Arc::new(OpenAiAdapter::new(chatgpt.clone(), api_key)))
        }
        ProviderKind::Ollama => {
            let adapter = OllamaAdapter::new(providers.ollama.clone());
            Ok(Arc::new(match endpoint {
                Some(endpoint) => adapter.with_tunnel(endpoint),
                None => adapter,
            }))
        }
    }
}
