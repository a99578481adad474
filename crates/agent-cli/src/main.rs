//! Terminal chat with a tool-calling agent.
//!
//! Local tools are always available; remote tools come from a tool server
//! subprocess when one is configured.

mod config;
mod repl;

use std::sync::Arc;

use agent_core::{
    Agent, LlmProvider, ToolRegistry,
    builtin::{CalculatorTool, TimeTool},
};
use agent_remote::RemoteToolSession;
use agent_runtime::OllamaProvider;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{AppConfig, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?.with_cli(&cli)?;

    let provider = Arc::new(OllamaProvider::from_config(config.ollama.clone())?);
    match provider.health_check().await {
        Ok(true) => tracing::info!(url = %config.ollama.base_url(), "Connected to Ollama"),
        Ok(false) | Err(_) => {
            tracing::warn!("Ollama not available, turns will fail");
            tracing::warn!("Make sure Ollama is running: ollama serve");
        }
    }

    let mut tools = ToolRegistry::new();
    tools.register_local(TimeTool)?;
    tools.register_local(CalculatorTool)?;

    let session = match config.remote {
        Some(remote) => match RemoteToolSession::connect(remote).await {
            Ok(session) => {
                tools.register_remote(session.tools(), Arc::new(session.clone()))?;
                Some(session)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Tool server unavailable, continuing with local tools");
                None
            }
        },
        None => None,
    };

    tracing::info!(count = tools.len(), tools = ?tools.names(), "Registered tools");

    let model = config.agent.generation.model.clone();
    let agent = Agent::new(provider, Arc::new(tools), config.agent);

    println!("Chatting with {model}. Type 'quit' or 'exit' to leave, Ctrl-C cancels a turn.");
    let outcome = repl::run(&agent).await;

    if let Some(session) = session {
        session.shutdown().await;
    }
    outcome
}
