//! Ollama LLM Provider
//!
//! Implementation of `LlmProvider` for local Ollama inference. Tools are
//! offered through Ollama's native tool calling; models that answer in text
//! instead are understood through fenced ```` ```tool ```` blocks (see
//! [`crate::fenced`]).

use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    provider::{
        Completion, GenerationOptions, LlmProvider, ModelInfo, ModelResponse, ProviderInfo,
        TokenUsage,
    },
    tool::{ToolCallRequest, ToolSchema},
};
use async_trait::async_trait;
use ollama_rs::{
    Ollama,
    generation::{
        chat::{ChatMessage, ChatMessageResponse, MessageRole, request::ChatMessageRequest},
        tools::{ToolCall, ToolInfo},
    },
    models::ModelOptions,
};
use serde_json::{Map, Value, json};

use crate::fenced;

/// Ollama provider configuration
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    /// Ollama host URL
    pub host: String,

    /// Ollama port
    pub port: u16,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Send tool schemas through native tool calling. When off, the
    /// catalogue is written into the system prompt instead.
    pub native_tools: bool,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".into(),
            port: 11434,
            timeout_secs: 120,
            native_tools: true,
        }
    }
}

impl OllamaConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("OLLAMA_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_env("OLLAMA_PORT")? {
            config.port = port;
        }
        if let Some(secs) = parse_env("OLLAMA_TIMEOUT_SECS")? {
            config.timeout_secs = secs;
        }
        if let Some(native) = parse_env("OLLAMA_NATIVE_TOOLS")? {
            config.native_tools = native;
        }
        Ok(config)
    }

    pub fn base_url(&self) -> String {
        format!("{}:{}", self.host.trim_end_matches('/'), self.port)
    }

    fn validate(&self) -> Result<()> {
        if !(self.host.starts_with("http://") || self.host.starts_with("https://")) {
            return Err(AgentError::Config(format!(
                "OLLAMA_HOST must start with http:// or https://, got {:?}",
                self.host
            )));
        }
        if self.timeout_secs == 0 {
            return Err(AgentError::Config("OLLAMA_TIMEOUT_SECS must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| AgentError::Config(format!("{key}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Ollama LLM provider
pub struct OllamaProvider {
    client: Ollama,
    config: OllamaConfig,
}

impl OllamaProvider {
    /// Create a new Ollama provider with custom host/port
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        Self::from_config(OllamaConfig {
            host: host.into(),
            port,
            ..Default::default()
        })
    }

    /// Create from configuration
    pub fn from_config(config: OllamaConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            client: Ollama::new(config.host.clone(), config.port),
            config,
        })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_config(OllamaConfig::from_env()?)
    }

    /// Create with default localhost settings
    pub fn localhost() -> Result<Self> {
        Self::from_config(OllamaConfig::default())
    }

    pub const fn config(&self) -> &OllamaConfig {
        &self.config
    }

    /// Convert agent messages to Ollama format.
    ///
    /// With native tools, calls ride on `tool_calls` and results use the
    /// `tool` role; otherwise both are rendered as text the model was
    /// taught to read.
    fn convert_messages(
        messages: &[Message],
        system_prompt: Option<String>,
        native_tools: bool,
    ) -> Result<Vec<ChatMessage>> {
        let mut converted = Vec::with_capacity(messages.len() + 1);
        if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
            converted.push(ChatMessage::new(MessageRole::System, prompt));
        }

        for m in messages {
            let message = match m.role {
                Role::System => ChatMessage::new(MessageRole::System, m.content.clone()),
                Role::User => ChatMessage::new(MessageRole::User, m.content.clone()),
                Role::Assistant if native_tools => {
                    let mut message = ChatMessage::new(MessageRole::Assistant, m.content.clone());
                    message.tool_calls = m
                        .tool_calls
                        .iter()
                        .map(to_tool_call)
                        .collect::<Result<Vec<_>>>()?;
                    message
                }
                Role::Assistant => {
                    let mut content = m.content.clone();
                    if m.has_tool_calls() {
                        if !content.is_empty() {
                            content.push('\n');
                        }
                        content.push_str(&fenced::render_calls(&m.tool_calls));
                    }
                    ChatMessage::new(MessageRole::Assistant, content)
                }
                Role::ToolResult => match &m.tool_result {
                    Some(result) if native_tools => {
                        ChatMessage::new(MessageRole::Tool, result.outcome.text().to_string())
                    }
                    Some(result) => ChatMessage::new(MessageRole::User, fenced::render_result(result)),
                    None => ChatMessage::new(MessageRole::User, m.content.clone()),
                },
            };
            converted.push(message);
        }
        Ok(converted)
    }

    /// Convert Ollama response to a final answer or a batch of tool calls
    fn convert_completion(response: ChatMessageResponse, requested_model: &str) -> Completion {
        let usage = token_usage(&response);
        let ChatMessageResponse { model, message, .. } = response;

        let mut requests: Vec<ToolCallRequest> = message
            .tool_calls
            .into_iter()
            .map(|call| ToolCallRequest {
                id: String::new(),
                name: call.function.name,
                arguments: coerce_arguments(call.function.arguments),
            })
            .collect();

        let mut text = message.content;
        if requests.is_empty() {
            let (prose, parsed) = fenced::parse_tool_calls(&text);
            if !parsed.is_empty() {
                text = prose;
                requests = parsed;
            }
        }

        let response = if requests.is_empty() {
            ModelResponse::Final { text }
        } else {
            ModelResponse::ToolCalls { text, requests }
        };

        let mut completion = Completion::new(
            response,
            if model.is_empty() { requested_model.to_string() } else { model },
        );
        completion.usage = usage;
        completion
    }

    /// Build Ollama model options
    fn build_options(opts: &GenerationOptions) -> ModelOptions {
        let options = ModelOptions::default()
            .temperature(opts.temperature)
            .top_p(opts.top_p)
            .num_predict(i32::try_from(opts.max_tokens).unwrap_or(i32::MAX));
        if opts.stop_sequences.is_empty() {
            options
        } else {
            options.stop(opts.stop_sequences.clone())
        }
    }
}

/// Express a schema as Ollama's function tool description
fn to_tool_info(schema: &ToolSchema) -> Result<ToolInfo> {
    Ok(serde_json::from_value(json!({
        "type": "function",
        "function": {
            "name": schema.name,
            "description": schema.description,
            "parameters": schema.parameters,
        }
    }))?)
}

fn to_tool_call(call: &ToolCallRequest) -> Result<ToolCall> {
    Ok(serde_json::from_value(json!({
        "function": {
            "name": call.name,
            "arguments": Value::Object(call.arguments.clone()),
        }
    }))?)
}

/// Some models send arguments as a JSON-encoded string
fn coerce_arguments(arguments: Value) -> Map<String, Value> {
    match arguments {
        Value::Object(map) => map,
        Value::String(raw) => match serde_json::from_str(&raw) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        _ => Map::new(),
    }
}

fn token_usage(response: &ChatMessageResponse) -> Option<TokenUsage> {
    // Read through serde; the counts are absent on some server versions
    let data = serde_json::to_value(response.final_data.as_ref()?).ok()?;
    let count = |key: &str| {
        data.get(key)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    };
    let (prompt, generated) = (count("prompt_eval_count")?, count("eval_count")?);
    Some(TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: generated,
        total_tokens: prompt.saturating_add(generated),
    })
}

/// Connection-level failures mean the server is not there; the rest are
/// reported as provider errors.
fn map_error(err: &(dyn std::error::Error + 'static)) -> AgentError {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::TimedOut
            ) {
                return AgentError::ProviderUnavailable(err.to_string());
            }
        }
        source = e.source();
    }
    AgentError::Provider(err.to_string())
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn info(&self) -> Result<ProviderInfo> {
        let models = self.list_models().await.unwrap_or_default();

        Ok(ProviderInfo {
            name: "Ollama".into(),
            version: None, // Not exposed through ollama-rs
            models,
            supports_tools: self.config.native_tools,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        match self.client.list_local_models().await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("Ollama health check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<Completion> {
        let native = self.config.native_tools;

        let mut system_prompt = options.system_prompt.clone();
        if !native && !tools.is_empty() {
            let section = fenced::render_tool_prompt(tools);
            system_prompt = Some(match system_prompt {
                Some(prompt) => format!("{prompt}\n\n{section}"),
                None => section,
            });
        }

        let ollama_messages = Self::convert_messages(messages, system_prompt, native)?;
        let message_count = ollama_messages.len();
        let mut request = ChatMessageRequest::new(options.model.clone(), ollama_messages)
            .options(Self::build_options(options));
        if native && !tools.is_empty() {
            request = request.tools(tools.iter().map(to_tool_info).collect::<Result<Vec<_>>>()?);
        }

        tracing::debug!(
            model = %options.model,
            messages = message_count,
            tools = tools.len(),
            native,
            "Sending chat request"
        );
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let response = tokio::time::timeout(timeout, self.client.send_chat_messages(request))
            .await
            .map_err(|_| {
                AgentError::ProviderUnavailable(format!("no answer from Ollama within {timeout:?}"))
            })?
            .map_err(|e| map_error(&e))?;

        Ok(Self::convert_completion(response, &options.model))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let models = self
            .client
            .list_local_models()
            .await
            .map_err(|e| AgentError::ProviderUnavailable(e.to_string()))?;

        Ok(models
            .into_iter()
            .map(|m| ModelInfo {
                id: m.name.clone(),
                name: m.name,
                context_length: None, // Not exposed by Ollama API
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use agent_core::{ToolCallResult, ToolOutcome, provider::FinishReason};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OllamaConfig::default();
        assert_eq!(config.host, "http://localhost");
        assert_eq!(config.port, 11434);
        assert_eq!(config.base_url(), "http://localhost:11434");
    }

    #[test]
    fn test_host_needs_scheme() {
        let err = OllamaProvider::new("localhost", 11434).err().unwrap();
        assert!(matches!(err, AgentError::Config(_)));
    }

    fn turn() -> Vec<Message> {
        let call = ToolCallRequest::new("c1", "tool_time", json!({}));
        let result = ToolCallResult::new(&call, ToolOutcome::success("2026-10-15 09:00:00"));
        vec![
            Message::user("What time is it?"),
            Message::tool_calls("", vec![call]),
            Message::tool_result(result),
        ]
    }

    #[test]
    fn test_native_message_conversion() {
        let converted =
            OllamaProvider::convert_messages(&turn(), Some("Be brief.".into()), true).unwrap();

        assert_eq!(converted.len(), 4);
        assert!(matches!(converted[0].role, MessageRole::System));
        assert_eq!(converted[2].tool_calls[0].function.name, "tool_time");
        assert!(matches!(converted[3].role, MessageRole::Tool));
        assert_eq!(converted[3].content, "2026-10-15 09:00:00");
    }

    #[test]
    fn test_text_message_conversion() {
        let converted = OllamaProvider::convert_messages(&turn(), None, false).unwrap();

        assert_eq!(converted.len(), 3);
        assert!(converted[1].content.contains("```tool"));
        assert!(converted[1].tool_calls.is_empty());
        assert!(matches!(converted[2].role, MessageRole::User));
        assert!(converted[2].content.starts_with("[Tool 'tool_time' returned]"));
    }

    #[test]
    fn test_tool_info_carries_schema() {
        let schema = ToolSchema::new("get_weather", "Weather forecast").with_json_schema(json!({
            "type": "object",
            "properties": {"location": {"type": "string"}},
            "required": ["location"]
        }));
        let info = serde_json::to_value(to_tool_info(&schema).unwrap()).unwrap();
        assert_eq!(info["type"], "function");
        assert_eq!(info["function"]["name"], "get_weather");
        assert_eq!(info["function"]["parameters"]["required"][0], "location");
    }

    fn reply(message: Value) -> ChatMessageResponse {
        serde_json::from_value(json!({
            "model": "llama3.2",
            "created_at": "2026-10-15T09:00:00Z",
            "message": message,
            "done": true,
            "total_duration": 1000,
            "load_duration": 10,
            "prompt_eval_count": 30,
            "prompt_eval_duration": 100,
            "eval_count": 12,
            "eval_duration": 200
        }))
        .unwrap()
    }

    #[test]
    fn test_native_tool_calls_in_response() {
        let response = reply(json!({
            "role": "assistant",
            "content": "",
            "tool_calls": [
                {"function": {"name": "get_weather", "arguments": {"location": "Paris"}}},
                {"function": {"name": "tool_calc", "arguments": "{\"expression\": \"1+1\"}"}}
            ]
        }));

        let completion = OllamaProvider::convert_completion(response, "llama3.2");
        assert_eq!(completion.usage.unwrap().total_tokens, 42);
        let ModelResponse::ToolCalls { requests, .. } = completion.response else {
            panic!("expected tool calls");
        };
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].arguments["location"], "Paris");
        assert_eq!(requests[1].arguments["expression"], "1+1");
    }

    #[test]
    fn test_fenced_fallback_in_response() {
        let response = reply(json!({
            "role": "assistant",
            "content": "```tool\n{\"tool\": \"tool_time\", \"arguments\": {}}\n```"
        }));

        let completion = OllamaProvider::convert_completion(response, "qwen2.5");
        assert!(matches!(
            completion.response,
            ModelResponse::ToolCalls { ref requests, .. } if requests[0].name == "tool_time"
        ));
        assert_eq!(completion.finish_reason, Some(FinishReason::ToolUse));
    }

    #[test]
    fn test_final_answer() {
        let response = reply(json!({"role": "assistant", "content": "It is 9 o'clock."}));

        let completion = OllamaProvider::convert_completion(response, "llama3.2");
        assert_eq!(completion.response, ModelResponse::final_text("It is 9 o'clock."));
        assert_eq!(completion.model, "llama3.2");
    }

    #[derive(Debug)]
    struct Wrapped(std::io::Error);

    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "request failed")
        }
    }

    impl std::error::Error for Wrapped {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_error_mapping() {
        let refused = Wrapped(std::io::ErrorKind::ConnectionRefused.into());
        assert!(matches!(map_error(&refused), AgentError::ProviderUnavailable(_)));

        let other = Wrapped(std::io::Error::other("bad body"));
        assert!(matches!(map_error(&other), AgentError::Provider(_)));
    }

    /// Serve exactly one canned HTTP response and hand back the request body
    async fn one_shot_server(body: &'static str) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if received.len() >= split + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let reply = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            let text = String::from_utf8_lossy(&received).to_string();
            text.split_once("\r\n\r\n").map(|(_, b)| b.to_string()).unwrap_or_default()
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_complete_over_http() {
        let (port, server) = one_shot_server(
            r#"{"model":"llama3.2","created_at":"2026-10-15T09:00:00Z","message":{"role":"assistant","content":"Hello!"},"done":true,"total_duration":1,"load_duration":1,"prompt_eval_count":5,"prompt_eval_duration":1,"eval_count":2,"eval_duration":1}"#,
        )
        .await;
        let provider = OllamaProvider::new("http://127.0.0.1", port).unwrap();
        let tools = vec![ToolSchema::new("tool_time", "Current local time")];
        let options = GenerationOptions {
            system_prompt: Some("Be brief.".into()),
            ..GenerationOptions::default()
        };

        let completion = provider
            .complete(&[Message::user("Hi")], &tools, &options)
            .await
            .unwrap();
        assert_eq!(completion.response, ModelResponse::final_text("Hello!"));

        let sent: Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(sent["messages"][0]["role"], "system");
        assert_eq!(sent["messages"][1]["content"], "Hi");
        assert_eq!(sent["tools"][0]["function"]["name"], "tool_time");
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        // Bind then drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let provider = OllamaProvider::new("http://127.0.0.1", port).unwrap();

        let result = provider
            .complete(&[Message::user("Hi")], &[], &GenerationOptions::default())
            .await;
        assert!(result.is_err());
        assert!(!provider.health_check().await.unwrap());
    }
}
