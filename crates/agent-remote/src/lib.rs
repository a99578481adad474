//! # agent-remote
//!
//! Out-of-process tools. A [`RemoteToolSession`] supervises one tool server
//! subprocess and speaks newline-delimited JSON-RPC with it over stdio;
//! [`ToolServer`] is the other end of the same protocol.
//!
//! ```rust,ignore
//! let session = RemoteToolSession::connect(RemoteSessionConfig::new("tool-server", ["--stdio"])).await?;
//! registry.register_remote(session.tools(), Arc::new(session.clone()))?;
//! ```

pub mod config;
pub mod error;
mod process;
pub mod protocol;
pub mod server;
pub mod session;

pub use config::RemoteSessionConfig;
pub use error::{RemoteError, Result};
pub use server::{ServerTool, ToolServer};
pub use session::{RemoteToolSession, SessionState};
