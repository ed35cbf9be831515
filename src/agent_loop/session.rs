//! Per-conversation state passed explicitly to every loop operation.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::Result;
use crate::provider::{create_adapter, ProviderAdapter, ProviderKind};
use crate::tools::ToolRegistry;
use crate::tunnel::{TunnelHandle, TunnelManager, TunnelState};
use crate::types::Conversation;

/// Active provider, its adapter, the conversation and the tunnel it uses.
pub struct Session {
    kind: ProviderKind,
    adapter: Arc<dyn ProviderAdapter>,
    /// Set after an authentication failure; cleared by switching provider.
    disabled: Option<String>,
    conversation: Conversation,
    tools: Arc<ToolRegistry>,
    tunnels: Arc<TunnelManager>,
    tunnel: Option<TunnelHandle>,
    config: AppConfig,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("kind", &self.kind)
            .field("model", &self.adapter.model_id())
            .field("messages", &self.conversation.len())
            .field("tunnel", &self.tunnel.as_ref().map(|t| t.local_port()))
            .field("disabled", &self.disabled)
            .finish()
    }
}

impl Session {
    /// Build a session for `kind`, opening its tunnel first when one is
    /// configured.
    pub async fn open(
        kind: ProviderKind,
        config: AppConfig,
        tools: Arc<ToolRegistry>,
        tunnels: Arc<TunnelManager>,
    ) -> Result<Self> {
        let (adapter, tunnel) = connect(kind, &config, &tunnels).await?;
        Ok(Self {
            kind,
            adapter,
            disabled: None,
            conversation: Conversation::new(),
            tools,
            tunnels,
            tunnel,
            config,
        })
    }

    /// Wrap an already-built adapter. No tunnel is involved.
    pub fn with_adapter(adapter: Arc<dyn ProviderAdapter>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            kind: adapter.kind(),
            adapter,
            disabled: None,
            conversation: Conversation::new(),
            tools,
            tunnels: Arc::new(TunnelManager::default()),
            tunnel: None,
            config: AppConfig::default(),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub(crate) fn conversation_mut(&mut self) -> &mut Conversation {
        &mut self.conversation
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn tunnel(&self) -> Option<&TunnelHandle> {
        self.tunnel.as_ref()
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Why the adapter refuses new turns, if it does.
    pub fn disabled_reason(&self) -> Option<&str> {
        self.disabled.as_deref()
    }

    pub(crate) fn disable(&mut self, reason: impl Into<String>) {
        self.disabled = Some(reason.into());
    }

    /// Drop all messages. The provider and tunnel are kept.
    pub fn clear(&mut self) {
        self.conversation.clear();
    }

    /// Make `kind` the active provider. The conversation is kept as is.
    ///
    /// The old adapter stays active if the new one cannot be built.
    pub async fn switch_provider(&mut self, kind: ProviderKind) -> Result<()> {
        let keep_tunnel = kind == self.kind
            && self.tunnel.as_ref().is_some_and(|t| {
                !matches!(t.status().state, TunnelState::Error | TunnelState::Closed)
            });

        if keep_tunnel {
            let endpoint = self.tunnel.as_ref().map(TunnelHandle::endpoint);
            self.adapter = create_adapter(kind, &self.config, endpoint)?;
        } else {
            // A broken tunnel for the same remote is replaced by the manager.
            let (adapter, tunnel) = connect(kind, &self.config, &self.tunnels).await?;
            if let Some(old) = self.tunnel.take() {
                self.tunnels.close(&old).await;
            }
            self.adapter = adapter;
            self.tunnel = tunnel;
        }

        info!(from = %self.kind, to = %kind, model = %self.adapter.model_id(), "provider switched");
        self.kind = kind;
        self.disabled = None;
        Ok(())
    }

    /// Change the active model and rebuild the adapter.
    pub fn set_model(&mut self, model: impl Into<String>) -> Result<()> {
        self.config.set_model(self.kind, model);
        let endpoint = self.tunnel.as_ref().map(TunnelHandle::endpoint);
        self.adapter = create_adapter(self.kind, &self.config, endpoint)?;
        self.disabled = None;
        Ok(())
    }

    /// Close this session's tunnel.
    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.tunnel.take() {
            debug!(port = handle.local_port(), "closing session tunnel");
            self.tunnels.close(&handle).await;
        }
    }
}

async fn connect(
    kind: ProviderKind,
    config: &AppConfig,
    tunnels: &TunnelManager,
) -> Result<(Arc<dyn ProviderAdapter>, Option<TunnelHandle>)> {
    let spec = match kind {
        ProviderKind::Ollama => config.providers.ollama.tunnel.clone(),
        _ => None,
    };
    let Some(spec) = spec else {
        return Ok((create_adapter(kind, config, None)?, None));
    };

    let handle = tunnels.open(spec).await?;
    match create_adapter(kind, config, Some(handle.endpoint())) {
        Ok(adapter) => Ok((adapter, Some(handle))),
        Err(e) => {
            tunnels.close(&handle).await;
            Err(e)
        }
    }
}
