//! # agent-core
//!
//! Tool-calling orchestration: the message log, the dual-backend tool
//! registry, the model adapter abstraction and the dispatch loop.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Agent                                │
//! │  ┌─────────────┐  ┌──────────────┐  ┌─────────────────────┐  │
//! │  │  Dispatch   │  │    Tool      │  │   LlmProvider       │  │
//! │  │    Loop     │──│   Registry   │  │   (Strategy)        │  │
//! │  └─────────────┘  └──────┬───────┘  └─────────────────────┘  │
//! │         │            local │ remote                          │
//! │   MessageLog        Tool   │  RemoteTools ── tool server     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` trait hides the model backend; the `RemoteTools` trait
//! hides the out-of-process tool server. Both are supplied by other crates.

pub mod builtin;
pub mod error;
pub mod message;
pub mod provider;
pub mod reasoning;
pub mod tool;

pub use error::{AgentError, Result};
pub use message::{Message, MessageLog, Role};
pub use provider::{Completion, GenerationOptions, LlmProvider, ModelResponse};
pub use reasoning::{Agent, AgentBuilder, AgentConfig};
pub use tool::{
    ExecutionKind, ParameterSchema, RemoteTools, Tool, ToolCallRequest, ToolCallResult,
    ToolDescriptor, ToolOutcome, ToolRegistry, ToolSchema,
};
