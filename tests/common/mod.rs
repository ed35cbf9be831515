//! Shared test helpers: a scripted provider adapter and a fake SSH connector.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use aicli::error::{AicliError, Result};
use aicli::provider::{AdapterCapabilities, ProviderAdapter, ProviderKind};
use aicli::tools::ToolSchema;
use aicli::tunnel::{SshConnector, SshSession, TunnelSpec};
use aicli::types::*;

// ---------------------------------------------------------------------------
// Scripted adapter
// ---------------------------------------------------------------------------

/// What the scripted adapter does for one `start_turn` call.
pub enum Reply {
    Events(Vec<Result<NormalizedEvent>>),
    StartError(AicliError),
    /// Emit these events, then never finish.
    Stall(Vec<NormalizedEvent>),
}

type Responder = Box<dyn Fn(usize, &Conversation) -> Reply + Send + Sync>;

pub struct ScriptedAdapter {
    responder: Responder,
    calls: AtomicUsize,
    seen: Mutex<Vec<Conversation>>,
}

impl ScriptedAdapter {
    /// `responder` gets the zero-based call index and the conversation sent.
    pub fn new(responder: impl Fn(usize, &Conversation) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Replies in order; a call past the end is a protocol error.
    pub fn queue(replies: Vec<Reply>) -> Arc<Self> {
        let replies = Mutex::new(VecDeque::from(replies));
        Self::new(move |_, _| {
            replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Reply::StartError(AicliError::protocol("script exhausted")))
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    fn model_id(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_tools: true,
            supports_streaming: true,
            native_tool_protocol: true,
        }
    }

    async fn start_turn(&self, conversation: &Conversation, _tools: &[ToolSchema]) -> Result<EventStream> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(conversation.clone());
        match (self.responder)(index, conversation) {
            Reply::Events(events) => Ok(stream::iter(events).boxed()),
            Reply::StartError(err) => Err(err),
            Reply::Stall(events) => Ok(stream::iter(events.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed()),
        }
    }

    async fn validate(&self) -> Result<()> {
        Ok(())
    }
}

pub fn text(t: &str) -> Result<NormalizedEvent> {
    Ok(NormalizedEvent::text(t))
}

pub fn call(id: &str, name: &str, arguments: serde_json::Value) -> Result<NormalizedEvent> {
    let arguments = match arguments {
        serde_json::Value::Object(map) => map,
        _ => ToolArgumentMap::new(),
    };
    Ok(NormalizedEvent::ToolCallRequested {
        call: ToolCallRequest::new(id, name, arguments),
    })
}

pub fn done() -> Result<NormalizedEvent> {
    Ok(NormalizedEvent::TurnComplete)
}

// ---------------------------------------------------------------------------
// Fake SSH connector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPlan {
    Healthy,
    AuthFailure,
    Refused,
}

/// Records every connect attempt. Sessions share one health switch.
pub struct FakeConnector {
    plans: Mutex<VecDeque<ConnectPlan>>,
    fallback: ConnectPlan,
    pub attempts: Mutex<Vec<(tokio::time::Instant, u16)>>,
    pub healthy: Arc<AtomicBool>,
    pub shutdowns: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn new(plans: Vec<ConnectPlan>, fallback: ConnectPlan) -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(VecDeque::from(plans)),
            fallback,
            attempts: Mutex::new(Vec::new()),
            healthy: Arc::new(AtomicBool::new(true)),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn healthy() -> Arc<Self> {
        Self::new(Vec::new(), ConnectPlan::Healthy)
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn attempt_times(&self) -> Vec<tokio::time::Instant> {
        self.attempts.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl SshConnector for FakeConnector {
    async fn connect(
        &self,
        spec: &TunnelSpec,
        local_port: u16,
        _timeout: Duration,
    ) -> Result<Box<dyn SshSession>> {
        self.attempts
            .lock()
            .unwrap()
            .push((tokio::time::Instant::now(), local_port));
        let plan = self.plans.lock().unwrap().pop_front().unwrap_or(self.fallback);
        match plan {
            ConnectPlan::Healthy => Ok(Box::new(FakeSession {
                healthy: self.healthy.clone(),
                shutdowns: self.shutdowns.clone(),
            })),
            ConnectPlan::AuthFailure => Err(AicliError::Authentication(format!(
                "SSH authentication to {} failed: Permission denied (publickey).",
                spec.destination()
            ))),
            ConnectPlan::Refused => Err(AicliError::tunnel_connect("Connection refused")),
        }
    }
}

struct FakeSession {
    healthy: Arc<AtomicBool>,
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl SshSession for FakeSession {
    async fn check(&mut self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AicliError::tunnel_session("probe failed"))
        }
    }

    async fn shutdown(&mut self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}
