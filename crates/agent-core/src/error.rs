//! Error Types

use std::time::Duration;

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// LLM provider error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider unavailable or not responding
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Tool not found in registry
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Two tools were registered under the same name
    #[error("Duplicate tool name: {0}")]
    DuplicateTool(String),

    /// Tool validation failed
    #[error("Tool validation error: {0}")]
    ToolValidation(String),

    /// Local tool raised an error
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// Malformed frame, closed stream or dead tool server process
    #[error("Protocol transport error: {0}")]
    Transport(String),

    /// No matching response within the request timeout
    #[error("Protocol timeout: '{method}' got no response within {after:?}")]
    Timeout { method: String, after: Duration },

    /// Remote tool session is permanently unusable
    #[error("Remote tool session terminated")]
    SessionTerminated,

    /// Maximum iterations reached in the dispatch loop
    #[error("Maximum iterations ({0}) reached")]
    MaxIterations(usize),

    /// The current turn was cancelled by the caller
    #[error("Turn cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Build a `ToolExecution` error
    pub fn tool_execution(tool: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.to_string(),
        }
    }

    /// Whether the error is confined to a single tool call.
    ///
    /// These are reported back to the model as a failed tool result
    /// instead of aborting the turn.
    pub const fn is_tool_level(&self) -> bool {
        matches!(
            self,
            Self::ToolNotFound(_)
                | Self::ToolValidation(_)
                | Self::ToolExecution { .. }
                | Self::Transport(_)
                | Self::Timeout { .. }
                | Self::SessionTerminated
        )
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider(msg) => format!("The AI service encountered an error: {msg}"),
            Self::ProviderUnavailable(_) => "The AI service is currently unavailable. Please try again.".into(),
            Self::ToolNotFound(name) => format!("The tool '{name}' is not available."),
            Self::ToolValidation(msg) => format!("Invalid tool input: {msg}"),
            Self::ToolExecution { message, .. } => format!("Tool error: {message}"),
            Self::Transport(_) | Self::SessionTerminated => "The tool server is not reachable.".into(),
            Self::Timeout { .. } => "The tool server did not answer in time.".into(),
            Self::MaxIterations(_) => "The request took too long to process. Please try a simpler query.".into(),
            Self::Cancelled => "The request was cancelled.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_level_classification() {
        assert!(AgentError::ToolNotFound("x".into()).is_tool_level());
        assert!(AgentError::SessionTerminated.is_tool_level());
        assert!(!AgentError::MaxIterations(3).is_tool_level());
        assert!(!AgentError::Provider("down".into()).is_tool_level());
    }

    #[test]
    fn test_display() {
        let err = AgentError::tool_execution("tool_calc", "Division by zero");
        assert_eq!(err.to_string(), "Tool 'tool_calc' failed: Division by zero");

        let err = AgentError::Timeout {
            method: "tools/call".into(),
            after: Duration::from_millis(250),
        };
        assert!(err.to_string().contains("250ms"));
    }
}
