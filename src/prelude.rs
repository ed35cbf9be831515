//! Convenience re-exports for common use.

pub use crate::agent_loop::{ConversationLoop, LoopEvent, LoopState, Session, TurnOutcome};
pub use crate::config::AppConfig;
pub use crate::error::{AicliError, Result};
pub use crate::provider::{create_adapter, ProviderAdapter, ProviderKind};
pub use crate::tools::{AgentTool, AgentToolParameters, BuiltinSettings, Tool, ToolArguments, ToolRegistry};
pub use crate::tunnel::{TunnelManager, TunnelSpec};
pub use crate::types::{Conversation, Message, NormalizedEvent, Role, ToolCallRequest, ToolResult};
