//! Error classification and recovery hints.

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed or unexpected stream content.
    Protocol,
    /// Network failure, server error, rate limit or timeout.
    Transport,
    Authentication,
    ToolExecution,
    Tunnel,
    Configuration,
    Serialization,
    Unknown,
}

/// Suggested recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySuggestion {
    RetryWithBackoff,
    RetryTurn,
    CheckCredentials,
    CheckConfiguration,
    CheckRemoteHost,
    FeedBackToModel,
    None,
}
