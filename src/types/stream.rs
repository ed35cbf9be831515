//! Streaming types.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::message::ToolCallRequest;
use crate::error::AicliError;

/// Backend-independent representation of streamed model output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEvent {
    /// Incremental assistant text.
    TextDelta { text: String },
    /// A complete tool call; arguments are fully assembled.
    ToolCallRequested { call: ToolCallRequest },
    /// End of the model's response. Emitted exactly once per successful turn.
    TurnComplete,
}

impl NormalizedEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }
}

/// Stream produced by a provider adapter. An `Err` item is terminal.
pub type EventStream = BoxStream<'static, Result<NormalizedEvent, AicliError>>;
