//! aicli: a terminal AI agent over Claude, ChatGPT and Ollama.
//!
//! The model drives a set of local tools (files, shell, search) through a
//! [`agent_loop::ConversationLoop`]. Every backend is hidden behind
//! [`provider::ProviderAdapter`], which turns its wire protocol into the same
//! [`types::NormalizedEvent`] stream. A remote Ollama server can be reached
//! through an SSH tunnel managed by [`tunnel::TunnelManager`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use aicli::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> aicli::error::Result<()> {
//! let config = AppConfig::load(None)?;
//! let tools = Arc::new(ToolRegistry::with_builtins(".", &BuiltinSettings::from(&config.agent)));
//! let tunnels = Arc::new(TunnelManager::default());
//! let mut session = Session::open(ProviderKind::Claude, config, tools, tunnels).await?;
//!
//! let mut runner = ConversationLoop::default();
//! runner.run_turn(&mut session, "What files are here?", &CancellationToken::new()).await?;
//! println!("{}", session.conversation().last().map(|m| m.text()).unwrap_or_default());
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod config;
pub mod error;
pub mod prelude;
pub mod provider;
pub mod tools;
pub mod tunnel;
pub mod types;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;
