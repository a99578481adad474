//! Error Types

use std::time::Duration;

use agent_core::AgentError;
use thiserror::Error;

use crate::protocol::JsonRpcError;

pub type Result<T> = std::result::Result<T, RemoteError>;

#[derive(Error, Debug)]
pub enum RemoteError {
    /// The tool server process could not be started
    #[error("Failed to spawn tool server '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed frame, closed pipe or exited process
    #[error("Transport failure: {0}")]
    Transport(String),

    /// No matching response within the deadline
    #[error("'{method}' got no response within {after:?}")]
    Timeout { method: String, after: Duration },

    /// The server answered with a JSON-RPC error object
    #[error("Tool server error: {0}")]
    Rpc(JsonRpcError),

    /// The session will not accept further calls
    #[error("Session terminated")]
    Terminated,

    #[error("Invalid tool server configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Faults that leave the stream in an unknown state
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Io(_) | Self::Json(_) | Self::Spawn { .. }
        )
    }
}

impl From<RemoteError> for AgentError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Timeout { method, after } => Self::Timeout { method, after },
            RemoteError::Terminated => Self::SessionTerminated,
            RemoteError::Config(message) => Self::Config(message),
            other => Self::Transport(other.to_string()),
        }
    }
}
