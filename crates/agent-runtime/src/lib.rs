//! # agent-runtime
//!
//! Model adapters for the tool-calling agent.
//!
//! ## Providers
//!
//! - **Ollama** (default): Local LLM inference via Ollama's chat API
//!
//! Models without native tool support are driven through fenced
//! ```` ```tool ```` blocks; see [`fenced`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::ollama::OllamaProvider;
//!
//! let provider = OllamaProvider::new("http://localhost", 11434)?;
//! let agent = AgentBuilder::new()
//!     .provider(Arc::new(provider))
//!     .tool(TimeTool)
//!     .build()?;
//! ```

pub mod fenced;

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(feature = "ollama")]
pub use ollama::{OllamaConfig, OllamaProvider};

// Re-export core types for convenience
pub use agent_core::{
    Agent, AgentError, LlmProvider, Message, MessageLog, Result, Role, Tool, ToolRegistry,
};
