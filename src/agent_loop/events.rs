//! Loop states and the events reported to callers while a turn runs.

use std::sync::Arc;

use serde::Serialize;
use strum::Display;

use crate::types::{ToolCallRequest, ToolResult};

/// Where the conversation loop is in a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoopState {
    WaitInput,
    Streaming,
    /// At least one tool call has arrived in the current response.
    ToolPending,
    Executing,
    /// The last turn failed. The next input starts a fresh turn.
    Error,
}

/// Event payloads delivered to a [`LoopEventSink`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    StateChanged { state: LoopState },
    AssistantDelta { text: String },
    ToolCallStarted { call: ToolCallRequest },
    ToolResult { result: ToolResult },
    /// Informational message, e.g. a retry or the iteration cap.
    Notice { message: String },
    Failed { error: String },
}

pub type LoopEventSink = Arc<dyn Fn(LoopEvent) + Send + Sync>;

/// How a turn ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed,
    /// The model kept calling tools; the loop stopped it.
    IterationCapReached,
    /// Cancelled by the user. Partial text was kept, pending calls answered
    /// with an "interrupted" error.
    Interrupted,
}
