//! Tool System
//!
//! Tools are described by explicit [`ToolSchema`] records and registered
//! once at startup. Each registered tool has an execution kind: `local`
//! tools run in-process, `remote` tools are forwarded to a [`RemoteTools`]
//! backend (a tool server subprocess). The registry is the single dispatch
//! point, so the orchestrator never distinguishes between the two.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{AgentError, Result};

/// Tool call request from the LLM
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Call ID, unique within one model turn
    #[serde(default)]
    pub id: String,

    /// Tool identifier
    #[serde(alias = "tool")]
    pub name: String,

    /// Arguments as a JSON object
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of one tool call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success {
        output: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Error {
        message: String,
    },
}

impl ToolOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self::Success {
            output: output.into(),
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Wrap a structured value, rendering strings verbatim and anything
    /// else as compact JSON.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(text) => Self::success(text),
            other => Self::Success {
                output: other.to_string(),
                data: Some(other),
            },
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Text shown to the model
    pub fn text(&self) -> &str {
        match self {
            Self::Success { output, .. } => output,
            Self::Error { message } => message,
        }
    }
}

/// Result from tool execution, correlated 1:1 with a [`ToolCallRequest`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// ID of the request this answers
    pub request_id: String,

    /// Tool that was called
    pub name: String,

    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

impl ToolCallResult {
    pub fn new(request: &ToolCallRequest, outcome: ToolOutcome) -> Self {
        Self {
            request_id: request.id.clone(),
            name: request.name.clone(),
            outcome,
        }
    }

    pub fn failure(request: &ToolCallRequest, error: impl fmt::Display) -> Self {
        Self::new(request, ToolOutcome::error(error.to_string()))
    }

    pub const fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Parameter definition used to build a tool's JSON schema
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameter name
    pub name: String,

    /// JSON Schema type (string, number, boolean, object, array)
    #[serde(rename = "type")]
    pub param_type: String,

    /// Human-readable description
    pub description: String,

    /// Whether this parameter is required
    #[serde(default)]
    pub required: bool,

    /// Default value if not provided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Enum of allowed values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
}

impl ParameterSchema {
    pub fn required(
        name: impl Into<String>,
        param_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            description: description.into(),
            required: true,
            default: None,
            enum_values: None,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        param_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }
}

/// Tool definition schema (for LLM function calling)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Unique tool identifier
    pub name: String,

    /// Human-readable description (shown to LLM)
    pub description: String,

    /// JSON Schema of the argument object
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: empty_object_schema(),
        }
    }

    /// Build the JSON schema from a list of parameter definitions
    pub fn with_parameters(mut self, params: &[ParameterSchema]) -> Self {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for param in params {
            let mut prop = Map::new();
            prop.insert("type".into(), Value::String(param.param_type.clone()));
            prop.insert("description".into(), Value::String(param.description.clone()));
            if let Some(default) = &param.default {
                prop.insert("default".into(), default.clone());
            }
            if let Some(values) = &param.enum_values {
                prop.insert("enum".into(), Value::Array(values.clone()));
            }
            properties.insert(param.name.clone(), Value::Object(prop));
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }

        self.parameters = serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        });
        self
    }

    /// Use a raw JSON schema (as received from a tool server)
    pub fn with_json_schema(mut self, schema: Value) -> Self {
        self.parameters = if schema.is_object() {
            schema
        } else {
            empty_object_schema()
        };
        self
    }

    /// Names listed in the schema's `required` array
    pub fn required_parameters(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Check that every required argument is present
    pub fn validate(&self, arguments: &Map<String, Value>) -> Result<()> {
        for name in self.required_parameters() {
            if !arguments.contains_key(name) {
                return Err(AgentError::ToolValidation(format!(
                    "Missing required parameter '{}' for tool '{}'",
                    name, self.name
                )));
            }
        }
        Ok(())
    }
}

/// Where a tool runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    Local,
    Remote,
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Registered tool: schema plus execution kind
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub schema: ToolSchema,
    pub kind: ExecutionKind,
}

impl ToolDescriptor {
    pub fn name(&self) -> &str {
        &self.schema.name
    }
}

/// Local tool trait - implement to add new in-process capabilities
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool's schema for LLM function calling
    fn schema(&self) -> ToolSchema;

    /// Execute the tool with given arguments
    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value>;

    /// Validate arguments before execution (optional)
    fn validate(&self, arguments: &Map<String, Value>) -> Result<()> {
        self.schema().validate(arguments)
    }
}

/// Remote tool backend, implemented by the tool server session.
///
/// `Ok` carries tool-level outcomes, including errors the tool reported on
/// purpose. `Err` is reserved for transport faults (`Transport`, `Timeout`,
/// `SessionTerminated`).
#[async_trait]
pub trait RemoteTools: Send + Sync {
    async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolOutcome>;
}

/// Adapter turning a plain function into a [`Tool`]
pub struct FnTool<F> {
    schema: ToolSchema,
    func: F,
}

impl<F> FnTool<F>
where
    F: Fn(&Map<String, Value>) -> anyhow::Result<Value> + Send + Sync,
{
    pub const fn new(schema: ToolSchema, func: F) -> Self {
        Self { schema, func }
    }
}

#[async_trait]
impl<F> Tool for FnTool<F>
where
    F: Fn(&Map<String, Value>) -> anyhow::Result<Value> + Send + Sync,
{
    fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value> {
        (self.func)(arguments).map_err(|e| AgentError::tool_execution(&self.schema.name, e))
    }
}

enum Backend {
    Local(Arc<dyn Tool>),
    Remote(Arc<dyn RemoteTools>),
}

struct Entry {
    descriptor: ToolDescriptor,
    backend: Backend,
}

/// Registry for available tools
#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, schema: ToolSchema, kind: ExecutionKind, backend: Backend) -> Result<()> {
        if self.index.contains_key(&schema.name) {
            return Err(AgentError::DuplicateTool(schema.name));
        }
        tracing::debug!(tool = %schema.name, %kind, "Registering tool");
        self.index.insert(schema.name.clone(), self.entries.len());
        self.entries.push(Entry {
            descriptor: ToolDescriptor { schema, kind },
            backend,
        });
        Ok(())
    }

    /// Register a local tool
    pub fn register_local<T: Tool + 'static>(&mut self, tool: T) -> Result<()> {
        self.register_boxed(Arc::new(tool))
    }

    /// Register a shared local tool
    pub fn register_boxed(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let schema = tool.schema();
        self.insert(schema, ExecutionKind::Local, Backend::Local(tool))
    }

    /// Register a plain function as a local tool
    pub fn register_fn<F>(&mut self, schema: ToolSchema, func: F) -> Result<()>
    where
        F: Fn(&Map<String, Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register_local(FnTool::new(schema, func))
    }

    /// Register every tool discovered from a remote session.
    ///
    /// Nothing is registered when any name collides.
    pub fn register_remote(
        &mut self,
        schemas: Vec<ToolSchema>,
        session: Arc<dyn RemoteTools>,
    ) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for schema in &schemas {
            if self.index.contains_key(&schema.name) || !seen.insert(schema.name.as_str()) {
                return Err(AgentError::DuplicateTool(schema.name.clone()));
            }
        }
        for schema in schemas {
            self.insert(schema, ExecutionKind::Remote, Backend::Remote(Arc::clone(&session)))?;
        }
        Ok(())
    }

    /// Look up a tool's descriptor
    pub fn resolve(&self, name: &str) -> Result<&ToolDescriptor> {
        self.entry(name).map(|entry| &entry.descriptor)
    }

    fn entry(&self, name: &str) -> Result<&Entry> {
        self.index
            .get(name)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))
    }

    /// Execute a tool by name.
    ///
    /// Local failures come back as `ToolExecution`/`ToolValidation`;
    /// remote tool-level errors come back as `Ok(ToolOutcome::Error)`.
    pub async fn execute(&self, name: &str, arguments: Map<String, Value>) -> Result<ToolOutcome> {
        let entry = self.entry(name)?;

        match &entry.backend {
            Backend::Local(tool) => {
                tool.validate(&arguments)?;
                let value = tool.execute(&arguments).await.map_err(|e| match e {
                    e @ (AgentError::ToolExecution { .. } | AgentError::ToolValidation(_)) => e,
                    other => AgentError::tool_execution(name, other),
                })?;
                Ok(ToolOutcome::from_value(value))
            }
            Backend::Remote(session) => session.invoke(name, Value::Object(arguments)).await,
        }
    }

    /// Get all tool schemas in registration order
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.entries.iter().map(|e| e.descriptor.schema.clone()).collect()
    }

    /// Get all descriptors in registration order
    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.entries.iter().map(|e| &e.descriptor)
    }

    /// Get tool names
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.descriptor.name()).collect()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingRemote {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl RemoteTools for RecordingRemote {
        async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolOutcome> {
            self.calls.lock().unwrap().push((name.to_string(), arguments));
            if name == "broken" {
                return Err(AgentError::Transport("stream closed".into()));
            }
            Ok(ToolOutcome::success(format!("remote:{name}")))
        }
    }

    fn echo_schema(name: &str) -> ToolSchema {
        ToolSchema::new(name, "Echo the text back")
            .with_parameters(&[ParameterSchema::required("text", "string", "Text to echo")])
    }

    fn registry_with_echo() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register_fn(echo_schema("echo"), |args| {
                Ok(args.get("text").cloned().unwrap_or(Value::Null))
            })
            .unwrap();
        registry
    }

    #[test]
    fn test_schema_from_parameters() {
        let schema = ToolSchema::new("search", "Search").with_parameters(&[
            ParameterSchema::required("query", "string", "Query"),
            ParameterSchema::optional("limit", "integer", "Max results").with_default(json!(5)),
        ]);

        assert_eq!(schema.required_parameters(), vec!["query"]);
        assert_eq!(schema.parameters["properties"]["limit"]["default"], json!(5));
    }

    #[tokio::test]
    async fn test_local_execution() {
        let registry = registry_with_echo();
        let args = json!({"text": "hi"}).as_object().cloned().unwrap();

        let outcome = registry.execute("echo", args).await.unwrap();
        assert_eq!(outcome, ToolOutcome::success("hi"));
        assert_eq!(registry.resolve("echo").unwrap().kind, ExecutionKind::Local);
    }

    #[tokio::test]
    async fn test_missing_argument_is_validation_error() {
        let registry = registry_with_echo();
        let err = registry.execute("echo", Map::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolValidation(_)));
    }

    #[tokio::test]
    async fn test_local_failure_is_wrapped() {
        let mut registry = ToolRegistry::new();
        registry
            .register_fn(ToolSchema::new("fails", "Always fails"), |_| {
                anyhow::bail!("boom")
            })
            .unwrap();

        let err = registry.execute("fails", Map::new()).await.unwrap_err();
        match err {
            AgentError::ToolExecution { tool, message } => {
                assert_eq!(tool, "fails");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        assert!(matches!(registry.resolve("nope"), Err(AgentError::ToolNotFound(_))));
        let err = registry.execute("nope", Map::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolNotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_remote_routing() {
        let remote = Arc::new(RecordingRemote {
            calls: Mutex::new(Vec::new()),
        });
        let mut registry = registry_with_echo();
        registry
            .register_remote(
                vec![ToolSchema::new("get_weather", "Weather"), ToolSchema::new("broken", "Broken")],
                remote.clone(),
            )
            .unwrap();

        assert_eq!(registry.names(), vec!["echo", "get_weather", "broken"]);
        assert_eq!(registry.resolve("get_weather").unwrap().kind, ExecutionKind::Remote);

        let args = json!({"location": "Paris"}).as_object().cloned().unwrap();
        let outcome = registry.execute("get_weather", args).await.unwrap();
        assert_eq!(outcome.text(), "remote:get_weather");

        let err = registry.execute("broken", Map::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));

        let calls = remote.calls.lock().unwrap();
        assert_eq!(calls[0], ("get_weather".to_string(), json!({"location": "Paris"})));
    }

    #[test]
    fn test_name_collision_is_rejected() {
        let remote = Arc::new(RecordingRemote {
            calls: Mutex::new(Vec::new()),
        });
        let mut registry = registry_with_echo();

        let err = registry
            .register_fn(echo_schema("echo"), |_| Ok(Value::Null))
            .unwrap_err();
        assert!(matches!(err, AgentError::DuplicateTool(name) if name == "echo"));

        let err = registry
            .register_remote(
                vec![ToolSchema::new("news", "News"), ToolSchema::new("echo", "Echo")],
                remote,
            )
            .unwrap_err();
        assert!(matches!(err, AgentError::DuplicateTool(_)));
        // Nothing from the rejected batch is registered
        assert!(registry.resolve("news").is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_result_serialization() {
        let request = ToolCallRequest::new("call_1", "tool_time", json!({}));
        let result = ToolCallResult::failure(&request, "no clock");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["request_id"], "call_1");
        assert_eq!(value["status"], "error");
        assert_eq!(value["message"], "no clock");
    }
}
