//! Error types for aicli.

pub mod unified;

pub use unified::{ErrorCategory, RecoverySuggestion};

use std::fmt;

use thiserror::Error;

/// Which side of a tunnel's life an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelPhase {
    /// Raised by `open`; the tunnel never became usable.
    Connect,
    /// Raised after the tunnel was open, once reconnects are exhausted.
    Session,
}

impl fmt::Display for TunnelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("connect"),
            Self::Session => f.write_str("session"),
        }
    }
}

/// Primary error type for all aicli operations.
#[derive(Error, Debug)]
pub enum AicliError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Tunnel {phase} error: {message}")]
    Tunnel { phase: TunnelPhase, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl AicliError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    pub fn tunnel_connect(message: impl Into<String>) -> Self {
        Self::Tunnel {
            phase: TunnelPhase::Connect,
            message: message.into(),
        }
    }

    pub fn tunnel_session(message: impl Into<String>) -> Self {
        Self::Tunnel {
            phase: TunnelPhase::Session,
            message: message.into(),
        }
    }

    /// The error surfaced once a live tunnel cannot be recovered.
    pub fn remote_unreachable(detail: impl fmt::Display) -> Self {
        Self::Tunnel {
            phase: TunnelPhase::Session,
            message: format!("remote backend unreachable ({detail})"),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Authentication(_) => ErrorCategory::Authentication,
            Self::RateLimited { .. } | Self::Network(_) | Self::Timeout(_) => {
                ErrorCategory::Transport
            }
            Self::Api { status, .. } => match status {
                401 | 403 => ErrorCategory::Authentication,
                408 | 429 | 500..=599 => ErrorCategory::Transport,
                _ => ErrorCategory::Protocol,
            },
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::ToolExecution { .. } => ErrorCategory::ToolExecution,
            Self::Tunnel { .. } => ErrorCategory::Tunnel,
            Self::Configuration(_) | Self::Toml(_) => ErrorCategory::Configuration,
            Self::Serialization(_) => ErrorCategory::Serialization,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transport)
    }

    /// Errors that make the current provider unusable until it is reconfigured.
    pub fn is_fatal_for_provider(&self) -> bool {
        matches!(self.category(), ErrorCategory::Authentication)
    }

    /// Suggest recovery actions.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self.category() {
            ErrorCategory::Authentication => RecoverySuggestion::CheckCredentials,
            ErrorCategory::Transport => RecoverySuggestion::RetryWithBackoff,
            ErrorCategory::Protocol => RecoverySuggestion::RetryTurn,
            ErrorCategory::Tunnel => RecoverySuggestion::CheckRemoteHost,
            ErrorCategory::ToolExecution => RecoverySuggestion::FeedBackToModel,
            ErrorCategory::Configuration => RecoverySuggestion::CheckConfiguration,
            _ => RecoverySuggestion::None,
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, AicliError>;
