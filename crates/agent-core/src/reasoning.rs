//! Dispatch Loop
//!
//! Alternates between the model and tool execution until the model gives a
//! final answer or the iteration cap is hit. Every tool call requested in a
//! model turn gets exactly one result appended before the model is asked
//! again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::message::{Message, MessageLog};
use crate::provider::{GenerationOptions, LlmProvider, ModelResponse};
use crate::tool::{ToolCallRequest, ToolCallResult, ToolRegistry, ToolSchema};

/// Agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// System prompt sent with every model call
    pub system_prompt: String,

    /// Maximum tool rounds per turn before giving up
    pub max_iterations: usize,

    /// Generation options
    pub generation: GenerationOptions,

    /// Run the tool calls of one model response concurrently
    pub parallel_tool_calls: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_iterations: 10,
            generation: GenerationOptions::default(),
            parallel_tool_calls: false,
        }
    }
}

impl AgentConfig {
    /// Read overrides from `AGENT_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(prompt) = std::env::var("AGENT_SYSTEM_PROMPT") {
            config.system_prompt = prompt;
        }
        if let Ok(model) = std::env::var("AGENT_MODEL") {
            config.generation.model = model;
        }
        if let Some(max) = parse_env::<usize>("AGENT_MAX_ITERATIONS")? {
            if max == 0 {
                return Err(AgentError::Config("AGENT_MAX_ITERATIONS must be at least 1".into()));
            }
            config.max_iterations = max;
        }
        if let Some(temperature) = parse_env::<f32>("AGENT_TEMPERATURE")? {
            config.generation.temperature = temperature;
        }
        if let Some(parallel) = parse_env::<bool>("AGENT_PARALLEL_TOOLS")? {
            config.parallel_tool_calls = parallel;
        }

        Ok(config)
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

const DEFAULT_SYSTEM_PROMPT: &str = r"You are a helpful AI assistant with access to tools.

You can:
- Get the current time when needed
- Perform mathematical calculations
- Look up weather and local news for a location
- and much more using your own knowledge

Always be concise and helpful. Use tools when appropriate to provide accurate information.";

/// The dispatch orchestrator
pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    config: AgentConfig,
}

impl Agent {
    /// Create a new agent
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            config,
        }
    }

    /// Create with default configuration
    pub fn with_defaults(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self::new(provider, tools, AgentConfig::default())
    }

    fn generation_options(&self) -> GenerationOptions {
        let mut options = self.config.generation.clone();
        if options.system_prompt.is_none() && !self.config.system_prompt.is_empty() {
            options.system_prompt = Some(self.config.system_prompt.clone());
        }
        options
    }

    /// Run one user turn to completion
    pub async fn run_turn(&self, log: &mut MessageLog, input: &str) -> Result<String> {
        self.run_turn_with_cancel(log, input, &CancellationToken::new()).await
    }

    /// Run one user turn, aborting when `cancel` fires.
    ///
    /// On cancellation during tool dispatch every request of the round still
    /// gets an error result, and in-flight remote calls are abandoned.
    pub async fn run_turn_with_cancel(
        &self,
        log: &mut MessageLog,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        log.append(Message::user(input));

        let schemas: Vec<ToolSchema> = self.tools.schemas();
        let options = self.generation_options();
        let mut iterations = 0;

        loop {
            let completion = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AgentError::Cancelled),
                completion = self.provider.complete(log.snapshot(), &schemas, &options) => completion?,
            };

            let (text, requests) = match completion.response {
                ModelResponse::Final { text } => {
                    log.append(Message::assistant(&text));
                    return Ok(text);
                }
                ModelResponse::ToolCalls { text, requests } if requests.is_empty() => {
                    tracing::debug!("Model returned an empty tool call batch, treating as final");
                    log.append(Message::assistant(&text));
                    return Ok(text);
                }
                ModelResponse::ToolCalls { text, requests } => (text, assign_call_ids(requests)),
            };

            log.append(Message::tool_calls(text, requests.clone()));

            let results = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                results = self.dispatch(&requests) => Some(results),
            };

            let Some(results) = results else {
                tracing::info!(pending = requests.len(), "Turn cancelled during tool dispatch");
                for request in &requests {
                    log.append(Message::tool_result(ToolCallResult::failure(
                        request,
                        AgentError::Cancelled,
                    )));
                }
                return Err(AgentError::Cancelled);
            };

            for result in results {
                log.append(Message::tool_result(result));
            }

            iterations += 1;
            if iterations > self.config.max_iterations {
                tracing::warn!(iterations, "Tool loop limit reached, aborting turn");
                return Err(AgentError::MaxIterations(self.config.max_iterations));
            }
        }
    }

    /// Run with a simple string input (creates temporary conversation)
    pub async fn ask(&self, question: &str) -> Result<String> {
        let mut log = MessageLog::new();
        self.run_turn(&mut log, question).await
    }

    /// Execute a batch, returning results in request order
    async fn dispatch(&self, requests: &[ToolCallRequest]) -> Vec<ToolCallResult> {
        if self.config.parallel_tool_calls && requests.len() > 1 {
            futures::future::join_all(requests.iter().map(|call| self.execute_tool(call))).await
        } else {
            let mut results = Vec::with_capacity(requests.len());
            for call in requests {
                results.push(self.execute_tool(call).await);
            }
            results
        }
    }

    /// Execute a tool call; failures become error results
    async fn execute_tool(&self, call: &ToolCallRequest) -> ToolCallResult {
        tracing::info!(tool = %call.name, id = %call.id, "Executing tool");
        let started = Instant::now();

        let result = match self.tools.execute(&call.name, call.arguments.clone()).await {
            Ok(outcome) => ToolCallResult::new(call, outcome),
            Err(e) if e.is_tool_level() => {
                tracing::warn!(tool = %call.name, id = %call.id, error = %e, "Tool call failed");
                ToolCallResult::failure(call, format!("Error: {e}"))
            }
            Err(e) => {
                tracing::error!(tool = %call.name, id = %call.id, error = %e, "Tool backend misbehaved");
                ToolCallResult::failure(call, format!("Internal error: {e}"))
            }
        };

        tracing::debug!(tool = %call.name, elapsed = ?started.elapsed(), success = result.is_success(), "Tool finished");
        result
    }

    /// Get the tool registry
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Get configuration
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }
}

/// Give every request a non-empty id that is unique within the batch
fn assign_call_ids(requests: Vec<ToolCallRequest>) -> Vec<ToolCallRequest> {
    let mut seen = HashSet::new();
    requests
        .into_iter()
        .map(|mut call| {
            if call.id.is_empty() || !seen.insert(call.id.clone()) {
                call.id = format!("call_{}", uuid::Uuid::new_v4().simple());
                seen.insert(call.id.clone());
            }
            call
        })
        .collect()
}

/// Builder for Agent configuration
pub struct AgentBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    tools: ToolRegistry,
    config: AgentConfig,
    error: Option<AgentError>,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            tools: ToolRegistry::new(),
            config: AgentConfig::default(),
            error: None,
        }
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn tool<T: crate::tool::Tool + 'static>(mut self, tool: T) -> Self {
        if let Err(e) = self.tools.register_local(tool) {
            self.error.get_or_insert(e);
        }
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.generation.model = model.into();
        self
    }

    pub const fn temperature(mut self, temp: f32) -> Self {
        self.config.generation.temperature = temp;
        self
    }

    pub const fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_iterations = max;
        self
    }

    pub const fn parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.config.parallel_tool_calls = enabled;
        self
    }

    pub fn build(self) -> Result<Agent> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if self.config.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".into()));
        }
        let provider = self.provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;

        Ok(Agent::new(provider, Arc::new(self.tools), self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{CalculatorTool, TimeTool};
    use crate::message::Role;
    use crate::provider::{Completion, ModelInfo, ProviderInfo};
    use crate::tool::{RemoteTools, ToolOutcome};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays scripted responses and records every history it was given
    struct ScriptedProvider {
        script: Mutex<VecDeque<ModelResponse>>,
        repeat_last: bool,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<ModelResponse>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                repeat_last: false,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn forever(response: ModelResponse) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::from([response])),
                repeat_last: true,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn info(&self) -> Result<ProviderInfo> {
            Ok(ProviderInfo {
                name: "scripted".into(),
                version: None,
                models: Vec::new(),
                supports_tools: true,
            })
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        async fn complete(
            &self,
            messages: &[Message],
            _tools: &[ToolSchema],
            _options: &GenerationOptions,
        ) -> Result<Completion> {
            self.seen.lock().unwrap().push(messages.to_vec());
            let mut script = self.script.lock().unwrap();
            let response = if self.repeat_last && script.len() == 1 {
                script[0].clone()
            } else {
                script
                    .pop_front()
                    .ok_or_else(|| AgentError::Provider("script exhausted".into()))?
            };
            Ok(Completion::new(response, "scripted"))
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>> {
            Ok(Vec::new())
        }
    }

    /// Remote backend answering after a per-tool delay
    struct DelayedRemote;

    #[async_trait]
    impl RemoteTools for DelayedRemote {
        async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolOutcome> {
            let ms = arguments["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ToolOutcome::success(format!("{name} after {ms}ms")))
        }
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest::new(id, name, args)
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut tools = ToolRegistry::new();
        tools.register_local(TimeTool).unwrap();
        tools.register_local(CalculatorTool).unwrap();
        tools
            .register_remote(
                vec![ToolSchema::new("slow", "Sleeps for `ms` milliseconds")],
                Arc::new(DelayedRemote),
            )
            .unwrap();
        Arc::new(tools)
    }

    #[tokio::test]
    async fn test_single_local_tool_turn() {
        let provider = ScriptedProvider::new(vec![
            ModelResponse::tool_calls(vec![call("call_1", "tool_time", json!({}))]),
            ModelResponse::final_text("It is noon."),
        ]);
        let agent = Agent::with_defaults(provider.clone(), registry());
        let mut log = MessageLog::new();

        let answer = agent.run_turn(&mut log, "What time is it?").await.unwrap();
        assert_eq!(answer, "It is noon.");

        let roles: Vec<Role> = log.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::ToolResult, Role::Assistant]);
        assert!(log.snapshot()[1].has_tool_calls());
        assert_eq!(log.snapshot()[2].tool_call_id.as_deref(), Some("call_1"));
        assert!(log.snapshot()[2].tool_result.as_ref().unwrap().is_success());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_every_request_answered_before_next_model_call() {
        let provider = ScriptedProvider::new(vec![
            ModelResponse::tool_calls(vec![
                call("a", "tool_calc", json!({"expression": "2 + 2"})),
                call("b", "does_not_exist", json!({})),
                call("c", "tool_calc", json!({})),
            ]),
            ModelResponse::tool_calls(vec![call("d", "tool_time", json!({}))]),
            ModelResponse::final_text("done"),
        ]);
        let agent = Agent::with_defaults(provider.clone(), registry());
        let mut log = MessageLog::new();

        agent.run_turn(&mut log, "go").await.unwrap();

        // Each history handed to the model has every requested id answered
        for history in provider.seen.lock().unwrap().iter() {
            let requested: Vec<&str> = history
                .iter()
                .flat_map(|m| m.tool_calls.iter().map(|c| c.id.as_str()))
                .collect();
            let answered: Vec<&str> = history
                .iter()
                .filter_map(|m| m.tool_call_id.as_deref())
                .collect();
            assert_eq!(requested, answered);
        }

        // Failures are fed back as data, not raised
        let results: Vec<&ToolCallResult> =
            log.iter().filter_map(|m| m.tool_result.as_ref()).collect();
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].outcome.text(), "4");
        assert!(!results[1].is_success());
        assert!(results[1].outcome.text().contains("Tool not found"));
        assert!(!results[2].is_success());
        assert!(results[2].outcome.text().contains("expression"));
    }

    #[tokio::test]
    async fn test_loop_guard() {
        let provider = ScriptedProvider::forever(ModelResponse::tool_calls(vec![call(
            "again",
            "tool_time",
            json!({}),
        )]));
        let agent = AgentBuilder::new()
            .provider(provider.clone())
            .tools(ToolRegistry::new())
            .max_iterations(3)
            .build()
            .unwrap();
        let mut log = MessageLog::new();

        let err = agent.run_turn(&mut log, "loop forever").await.unwrap_err();
        assert!(matches!(err, AgentError::MaxIterations(3)));
        assert_eq!(provider.calls(), 4);
        // user + 4 * (tool call, tool result)
        assert_eq!(log.len(), 9);
        assert_eq!(log.last().unwrap().role, Role::ToolResult);
    }

    #[tokio::test]
    async fn test_cap_allows_exactly_that_many_rounds() {
        let provider = ScriptedProvider::new(vec![
            ModelResponse::tool_calls(vec![call("t", "tool_time", json!({}))]),
            ModelResponse::final_text("noon"),
        ]);
        let agent = AgentBuilder::new()
            .provider(provider.clone())
            .tool(TimeTool)
            .max_iterations(1)
            .build()
            .unwrap();
        let mut log = MessageLog::new();

        let answer = agent.run_turn(&mut log, "What time is it?").await.unwrap();
        assert_eq!(answer, "noon");
        assert_eq!(log.len(), 4);
        assert_eq!(provider.calls(), 2);
    }

    /// Never answers within a test's lifetime
    struct StalledProvider;

    #[async_trait]
    impl LlmProvider for StalledProvider {
        async fn info(&self) -> Result<ProviderInfo> {
            Ok(ProviderInfo {
                name: "stalled".into(),
                version: None,
                models: Vec::new(),
                supports_tools: true,
            })
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        async fn complete(
            &self,
            _messages: &[Message],
            _tools: &[ToolSchema],
            _options: &GenerationOptions,
        ) -> Result<Completion> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Completion::new(ModelResponse::final_text("too late"), "stalled"))
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_cancel_during_model_call() {
        let agent = Agent::with_defaults(Arc::new(StalledProvider), registry());
        let mut log = MessageLog::new();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = agent
            .run_turn_with_cancel(&mut log, "anyone there?", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(log.len(), 1);
        assert_eq!(log.snapshot()[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_parallel_results_keep_request_order() {
        let provider = ScriptedProvider::new(vec![
            ModelResponse::tool_calls(vec![
                call("first", "slow", json!({"ms": 80})),
                call("second", "slow", json!({"ms": 10})),
                call("third", "slow", json!({"ms": 40})),
            ]),
            ModelResponse::final_text("ok"),
        ]);
        let config = AgentConfig {
            parallel_tool_calls: true,
            ..AgentConfig::default()
        };
        let agent = Agent::new(provider, registry(), config);
        let mut log = MessageLog::new();

        let started = Instant::now();
        agent.run_turn(&mut log, "go").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(130));

        let ids: Vec<&str> = log.iter().filter_map(|m| m.tool_call_id.as_deref()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_cancel_during_dispatch() {
        let provider = ScriptedProvider::new(vec![ModelResponse::tool_calls(vec![
            call("x", "slow", json!({"ms": 10_000})),
            call("y", "tool_time", json!({})),
        ])]);
        let agent = Agent::with_defaults(provider, registry());
        let mut log = MessageLog::new();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = agent
            .run_turn_with_cancel(&mut log, "slow please", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));

        let results: Vec<&ToolCallResult> =
            log.iter().filter_map(|m| m.tool_result.as_ref()).collect();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.is_success()));
    }

    /// Remote backend failing with a non tool-level error
    struct MisconfiguredRemote;

    #[async_trait]
    impl RemoteTools for MisconfiguredRemote {
        async fn invoke(&self, _name: &str, _arguments: Value) -> Result<ToolOutcome> {
            Err(AgentError::Config("no command configured".into()))
        }
    }

    #[tokio::test]
    async fn test_backend_errors_still_become_results() {
        let mut tools = ToolRegistry::new();
        tools
            .register_remote(
                vec![ToolSchema::new("lookup", "Broken lookup")],
                Arc::new(MisconfiguredRemote),
            )
            .unwrap();
        let provider = ScriptedProvider::new(vec![
            ModelResponse::tool_calls(vec![call("l", "lookup", json!({}))]),
            ModelResponse::final_text("sorry"),
        ]);
        let agent = Agent::with_defaults(provider, Arc::new(tools));
        let mut log = MessageLog::new();

        assert_eq!(agent.run_turn(&mut log, "look it up").await.unwrap(), "sorry");
        let result = log.snapshot()[2].tool_result.as_ref().unwrap();
        assert!(!result.is_success());
        assert!(result.outcome.text().starts_with("Internal error"));
    }

    #[tokio::test]
    async fn test_missing_and_duplicate_ids_are_replaced() {
        let provider = ScriptedProvider::new(vec![
            ModelResponse::tool_calls(vec![
                call("", "tool_time", json!({})),
                call("dup", "tool_time", json!({})),
                call("dup", "tool_time", json!({})),
            ]),
            ModelResponse::final_text("done"),
        ]);
        let agent = Agent::with_defaults(provider, registry());
        let mut log = MessageLog::new();
        agent.run_turn(&mut log, "times").await.unwrap();

        let ids: Vec<&str> = log.snapshot()[1].tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| !id.is_empty()));
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 3);
        assert_eq!(ids[1], "dup");
    }

    #[test]
    fn test_builder_requires_provider() {
        let err = AgentBuilder::new().build().err().unwrap();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn test_builder_reports_duplicate_tool() {
        let provider = ScriptedProvider::new(Vec::new());
        let err = AgentBuilder::new()
            .provider(provider)
            .tool(TimeTool)
            .tool(TimeTool)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::DuplicateTool(name) if name == "tool_time"));
    }
}
