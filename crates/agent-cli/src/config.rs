//! Application configuration
//!
//! Environment (and `.env`) first, then command-line flags on top.

use agent_core::AgentConfig;
use agent_remote::RemoteSessionConfig;
use agent_runtime::OllamaConfig;
use clap::Parser;

#[derive(Parser, Debug, Default)]
#[command(name = "agent", version, about = "Chat with a local model that can call tools")]
pub struct Cli {
    /// Model to chat with (overrides AGENT_MODEL)
    #[arg(long, short)]
    pub model: Option<String>,

    /// Command line that starts the tool server (overrides TOOL_SERVER_COMMAND)
    #[arg(long, value_name = "COMMAND")]
    pub tool_server: Option<String>,

    /// Run with local tools only
    #[arg(long, conflicts_with = "tool_server")]
    pub no_remote: bool,

    /// Run the tool calls of one response concurrently
    #[arg(long)]
    pub parallel: bool,
}

/// Everything the binary needs to wire an agent together
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub ollama: OllamaConfig,
    pub remote: Option<RemoteSessionConfig>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            agent: AgentConfig::from_env()?,
            ollama: OllamaConfig::from_env()?,
            remote: RemoteSessionConfig::from_env()?,
        })
    }

    /// Apply command-line overrides
    pub fn with_cli(mut self, cli: &Cli) -> anyhow::Result<Self> {
        if let Some(model) = &cli.model {
            self.agent.generation.model.clone_from(model);
        }
        if cli.parallel {
            self.agent.parallel_tool_calls = true;
        }
        if cli.no_remote {
            self.remote = None;
        } else if let Some(line) = &cli.tool_server {
            // Only the command changes; cwd, timeouts and budgets stay as configured
            let parsed = RemoteSessionConfig::from_command_line(line)?;
            let mut remote = self.remote.take().unwrap_or_default();
            remote.command = parsed.command;
            remote.args = parsed.args;
            self.remote = Some(remote);
        }
        Ok(self)
    }
}
