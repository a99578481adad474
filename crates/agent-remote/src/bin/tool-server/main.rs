//! Reference tool server.
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout; logs go to stderr.

mod diagnostics;
mod news;
mod weather;

use std::sync::Arc;

use agent_remote::ToolServer;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tool-server", version, about = "Weather and news tools over stdio")]
struct Args {
    /// Also expose echo, sleep, crash, garble, ask_roots, cwd and env for client testing
    #[arg(long, env = "TOOL_SERVER_DIAGNOSTICS")]
    diagnostics: bool,

    /// Advertise tools in pages of this many entries
    #[arg(long)]
    page_size: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries protocol frames, so logs must stay on stderr
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .init();

    let args = Args::parse();

    let mut server = ToolServer::new("tool-server", env!("CARGO_PKG_VERSION"))
        .with_tool(weather::WeatherTool)
        .with_tool(news::NewsTool);
    if args.diagnostics {
        server = diagnostics::install(server);
    }
    if let Some(size) = args.page_size {
        server = server.with_page_size(size);
    }
    tracing::debug!(tools = ?server.tool_names(), "Tool server ready");

    Arc::new(server)
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await?;
    tracing::info!("Input closed, exiting");
    Ok(())
}
