//! Tools that misbehave on request, for exercising client supervision.

use std::io::Write as _;
use std::time::Duration;

use agent_core::{ParameterSchema, ToolSchema};
use agent_remote::{ServerTool, ToolServer};
use async_trait::async_trait;
use serde_json::{Map, Value};

pub fn install(server: ToolServer) -> ToolServer {
    server
        .with_tool(Echo)
        .with_tool(Sleep)
        .with_tool(Crash)
        .with_tool(Garble)
        .with_tool(AskRoots)
        .with_tool(Cwd)
        .with_tool(EnvVar)
}

fn string_arg<'a>(arguments: &'a Map<String, Value>, name: &str) -> anyhow::Result<&'a str> {
    arguments
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("'{name}' must be a string"))
}

struct Echo;

#[async_trait]
impl ServerTool for Echo {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("echo", "Return the given text unchanged")
            .with_parameters(&[ParameterSchema::required("text", "string", "Text to return")])
    }

    async fn call(&self, arguments: Map<String, Value>) -> anyhow::Result<String> {
        string_arg(&arguments, "text").map(str::to_string)
    }
}

struct Sleep;

#[async_trait]
impl ServerTool for Sleep {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("sleep", "Wait before answering").with_parameters(&[
            ParameterSchema::required("ms", "integer", "Milliseconds to wait"),
        ])
    }

    async fn call(&self, arguments: Map<String, Value>) -> anyhow::Result<String> {
        let ms = arguments
            .get("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow::anyhow!("'ms' must be a non-negative integer"))?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(format!("slept {ms} ms"))
    }
}

struct Crash;

#[async_trait]
impl ServerTool for Crash {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("crash", "Exit the server process without answering")
    }

    async fn call(&self, _arguments: Map<String, Value>) -> anyhow::Result<String> {
        tracing::warn!("Crash requested, exiting");
        std::process::exit(3);
    }
}

struct Garble;

#[async_trait]
impl ServerTool for Garble {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("garble", "Write a line that is not a valid frame, then answer")
    }

    async fn call(&self, _arguments: Map<String, Value>) -> anyhow::Result<String> {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(b"{\"jsonrpc\": \"2.0\", \"id\": \n")?;
        stdout.flush()?;
        Ok("garbled".into())
    }
}

/// Highest request id the client is likely to have in flight during tests
const ASKED_IDS: u64 = 64;

struct AskRoots;

#[async_trait]
impl ServerTool for AskRoots {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "ask_roots",
            "Send the client roots/list requests reusing its own ids, then answer",
        )
    }

    async fn call(&self, _arguments: Map<String, Value>) -> anyhow::Result<String> {
        {
            let mut stdout = std::io::stdout().lock();
            for id in 1..=ASKED_IDS {
                writeln!(stdout, r#"{{"jsonrpc":"2.0","id":{id},"method":"roots/list"}}"#)?;
            }
            stdout.flush()?;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok("asked".into())
    }
}

struct Cwd;

#[async_trait]
impl ServerTool for Cwd {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("cwd", "Report the server's working directory")
    }

    async fn call(&self, _arguments: Map<String, Value>) -> anyhow::Result<String> {
        Ok(std::env::current_dir()?.display().to_string())
    }
}

struct EnvVar;

#[async_trait]
impl ServerTool for EnvVar {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("env", "Read one of the server's environment variables")
            .with_parameters(&[ParameterSchema::required("name", "string", "Variable name")])
    }

    async fn call(&self, arguments: Map<String, Value>) -> anyhow::Result<String> {
        let name = string_arg(&arguments, "name")?;
        std::env::var(name).map_err(|_| anyhow::anyhow!("{name} is not set"))
    }
}
