//! The conversation loop: stream a response, run requested tools, repeat.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AgentSettings;
use crate::error::{AicliError, Result};
use crate::tools::ToolSchema;
use crate::types::{EventStream, Message, NormalizedEvent, ToolCallRequest, ToolResult};
use crate::util::retry::RetryPolicy;

use super::events::{LoopEvent, LoopEventSink, LoopState, TurnOutcome};
use super::session::Session;

pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 20;

const INTERRUPTED: &str = "interrupted";

/// Drives one user turn at a time against a [`Session`].
pub struct ConversationLoop {
    max_iterations: usize,
    retry: RetryPolicy,
    sink: Option<LoopEventSink>,
    state: LoopState,
}

impl Default for ConversationLoop {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOOL_ITERATIONS)
    }
}

impl std::fmt::Debug for ConversationLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationLoop")
            .field("max_iterations", &self.max_iterations)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// How one streamed response ended.
enum StreamStep {
    Complete {
        text: String,
        calls: Vec<ToolCallRequest>,
    },
    Interrupted {
        text: String,
    },
}

struct StreamFailure {
    error: AicliError,
    /// Whether any event reached the sink before the failure.
    emitted: bool,
}

impl ConversationLoop {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
            retry: RetryPolicy::default(),
            sink: None,
            state: LoopState::WaitInput,
        }
    }

    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self::new(settings.max_tool_iterations)
    }

    pub fn with_event_sink(mut self, sink: LoopEventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    fn emit(&self, event: LoopEvent) {
        if let Some(sink) = &self.sink {
            (sink)(event);
        }
    }

    fn set_state(&mut self, state: LoopState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "loop state");
            self.state = state;
            self.emit(LoopEvent::StateChanged { state });
        }
    }

    fn fail(&mut self, session: &mut Session, error: AicliError) -> AicliError {
        if error.is_fatal_for_provider() {
            warn!(provider = %session.kind(), error = %error, "disabling provider after auth failure");
            session.disable(error.to_string());
        }
        self.set_state(LoopState::Error);
        self.emit(LoopEvent::Failed {
            error: error.to_string(),
        });
        error
    }

    /// Run one user turn to completion, cancellation, or failure.
    ///
    /// Whatever was appended to the conversation before a failure stays there.
    pub async fn run_turn(
        &mut self,
        session: &mut Session,
        input: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        if let Some(reason) = session.disabled_reason() {
            let error = AicliError::Authentication(format!(
                "{} is unavailable until the provider is switched or reconfigured: {reason}",
                session.kind()
            ));
            self.set_state(LoopState::Error);
            return Err(error);
        }

        session.conversation_mut().push(Message::user(input));
        let schemas = if session.adapter().capabilities().supports_tools {
            session.tools().schemas()
        } else {
            Vec::new()
        };
        let mut iterations = 0usize;

        loop {
            self.set_state(LoopState::Streaming);
            let step = match self.stream_response(session, &schemas, cancel).await {
                Ok(step) => step,
                Err(error) => return Err(self.fail(session, error)),
            };

            let (text, calls) = match step {
                StreamStep::Interrupted { text } => {
                    if !text.is_empty() {
                        session.conversation_mut().push(Message::assistant(text));
                    }
                    self.set_state(LoopState::WaitInput);
                    return Ok(TurnOutcome::Interrupted);
                }
                StreamStep::Complete { text, calls } => (text, calls),
            };

            session
                .conversation_mut()
                .push(Message::assistant_with_calls(text, calls.clone()));
            if calls.is_empty() {
                self.set_state(LoopState::WaitInput);
                return Ok(TurnOutcome::Completed);
            }

            iterations += 1;
            self.set_state(LoopState::Executing);
            if !self.execute_calls(session, &calls, cancel).await {
                self.set_state(LoopState::WaitInput);
                return Ok(TurnOutcome::Interrupted);
            }

            if iterations >= self.max_iterations {
                let notice = format!(
                    "Stopped after {iterations} tool iterations. Send another message to continue."
                );
                warn!(iterations, "tool iteration cap reached");
                session.conversation_mut().push(Message::assistant(&notice));
                self.emit(LoopEvent::Notice { message: notice });
                self.set_state(LoopState::WaitInput);
                return Ok(TurnOutcome::IterationCapReached);
            }
        }
    }

    /// Run queued calls one at a time. Returns `false` if cancelled, after
    /// answering the interrupted call and every call behind it.
    async fn execute_calls(
        &mut self,
        session: &mut Session,
        calls: &[ToolCallRequest],
        cancel: &CancellationToken,
    ) -> bool {
        let tools = session.tools().clone();
        for (index, call) in calls.iter().enumerate() {
            self.emit(LoopEvent::ToolCallStarted { call: call.clone() });
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = tools.execute(call) => Some(result),
            };

            let Some(result) = result else {
                for pending in &calls[index..] {
                    let result = ToolResult::failure(&pending.id, INTERRUPTED);
                    self.emit(LoopEvent::ToolResult {
                        result: result.clone(),
                    });
                    session.conversation_mut().push(Message::tool_result(result));
                }
                return false;
            };

            self.emit(LoopEvent::ToolResult {
                result: result.clone(),
            });
            session.conversation_mut().push(Message::tool_result(result));
        }
        true
    }

    /// Start a response and read it to the end, retrying transport errors
    /// that happen before anything was forwarded to the sink.
    async fn stream_response(
        &mut self,
        session: &Session,
        schemas: &[ToolSchema],
        cancel: &CancellationToken,
    ) -> Result<StreamStep> {
        let mut backoff = self.retry.backoff();
        let mut attempt = 1u32;

        loop {
            debug!(
                provider = %session.kind(),
                model = %session.adapter().model_id(),
                messages = session.conversation().len(),
                attempt,
                "starting turn"
            );
            let started = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StreamStep::Interrupted { text: String::new() }),
                started = session.adapter().start_turn(session.conversation(), schemas) => started,
            };

            let failure = match started {
                Ok(stream) => match self.consume(stream, cancel).await {
                    Ok(step) => return Ok(step),
                    Err(failure) => failure,
                },
                Err(error) => StreamFailure {
                    error,
                    emitted: false,
                },
            };

            if failure.emitted
                || !failure.error.is_retryable()
                || attempt >= self.retry.max_attempts
            {
                return Err(failure.error);
            }

            let delay = self.retry.delay_after(&failure.error, &mut backoff);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure.error,
                "retrying turn"
            );
            self.emit(LoopEvent::Notice {
                message: format!("{}; retrying in {:.1}s", failure.error, delay.as_secs_f64()),
            });
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StreamStep::Interrupted { text: String::new() }),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn consume(
        &mut self,
        mut stream: EventStream,
        cancel: &CancellationToken,
    ) -> std::result::Result<StreamStep, StreamFailure> {
        let mut text = String::new();
        let mut calls = Vec::new();
        let mut emitted = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StreamStep::Interrupted { text }),
                next = stream.next() => next,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(error)) => return Err(StreamFailure { error, emitted }),
                None => {
                    return Err(StreamFailure {
                        error: AicliError::protocol("stream ended without completing the turn"),
                        emitted,
                    })
                }
            };

            emitted = true;
            match event {
                NormalizedEvent::TextDelta { text: delta } => {
                    text.push_str(&delta);
                    self.emit(LoopEvent::AssistantDelta { text: delta });
                }
                NormalizedEvent::ToolCallRequested { call } => {
                    debug!(tool = %call.name, id = %call.id, "tool call queued");
                    calls.push(call);
                    self.set_state(LoopState::ToolPending);
                }
                NormalizedEvent::TurnComplete => return Ok(StreamStep::Complete { text, calls }),
            }
        }
    }
}
