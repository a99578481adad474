//! Text-protocol tool calling for models without native function calling.
//!
//! The tool catalogue is rendered into the system prompt and the model is
//! asked to answer with fenced blocks:
//!
//! ````text
//! ```tool
//! {"tool": "get_weather", "arguments": {"location": "Paris"}}
//! ```
//! ````

use std::fmt::Write as _;

use agent_core::{ToolCallRequest, ToolCallResult, ToolSchema};
use serde_json::Value;

const FENCE_OPEN: &str = "```tool";
const FENCE_CLOSE: &str = "```";

/// System prompt section describing the tools and the call format
pub fn render_tool_prompt(tools: &[ToolSchema]) -> String {
    let mut prompt = String::from("## Available Tools\n\n");
    prompt.push_str("To use a tool, respond with one JSON block per call:\n\n");
    prompt.push_str("```tool\n{\"tool\": \"tool_name\", \"arguments\": {\"arg\": \"value\"}}\n```\n\n");
    prompt.push_str("You may request several tools at once. Wait for their results before answering.\n\n");

    for schema in tools {
        let _ = writeln!(prompt, "### {}", schema.name);
        let _ = writeln!(prompt, "{}", schema.description);

        let required = schema.required_parameters();
        if let Some(properties) = schema.parameters.get("properties").and_then(Value::as_object) {
            if !properties.is_empty() {
                prompt.push_str("**Parameters:**\n");
            }
            for (name, property) in properties {
                let kind = property.get("type").and_then(Value::as_str).unwrap_or("any");
                let description = property.get("description").and_then(Value::as_str).unwrap_or("");
                let marker = if required.contains(&name.as_str()) { " (required)" } else { "" };
                let _ = writeln!(prompt, "- `{name}` ({kind}){marker}: {description}");
            }
        }
        prompt.push('\n');
    }

    prompt
}

/// Render calls the way the model is asked to write them
pub fn render_calls(calls: &[ToolCallRequest]) -> String {
    calls
        .iter()
        .map(|call| {
            let body = serde_json::json!({"tool": call.name, "arguments": call.arguments});
            format!("{FENCE_OPEN}\n{body}\n{FENCE_CLOSE}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Tool result as a plain-text message
pub fn render_result(result: &ToolCallResult) -> String {
    if result.outcome.is_success() {
        format!("[Tool '{}' returned]\n{}", result.name, result.outcome.text())
    } else {
        format!("[Tool '{}' failed]\n{}", result.name, result.outcome.text())
    }
}

/// Extract every fenced tool call from `content`.
///
/// Returns the remaining prose and the calls in order of appearance. Blocks
/// whose body is not a valid call are left in the prose.
pub fn parse_tool_calls(content: &str) -> (String, Vec<ToolCallRequest>) {
    let mut calls = Vec::new();
    let mut prose = String::new();
    let mut rest = content;

    while let Some(start) = rest.find(FENCE_OPEN) {
        let after_marker = &rest[start + FENCE_OPEN.len()..];
        let Some(end) = after_marker.find(FENCE_CLOSE) else {
            break;
        };
        let body = after_marker[..end].trim();
        match serde_json::from_str::<ToolCallRequest>(body) {
            Ok(call) if !call.name.is_empty() => {
                prose.push_str(&rest[..start]);
                calls.push(call);
            }
            _ => {
                tracing::debug!(block = body, "Ignoring unparseable tool block");
                prose.push_str(&rest[..start + FENCE_OPEN.len() + end + FENCE_CLOSE.len()]);
            }
        }
        rest = &after_marker[end + FENCE_CLOSE.len()..];
    }
    prose.push_str(rest);

    if calls.is_empty() {
        if let Some(call) = parse_inline_call(content) {
            return (String::new(), vec![call]);
        }
    }
    (prose.trim().to_string(), calls)
}

/// Some models drop the fence and answer with the bare JSON object
fn parse_inline_call(content: &str) -> Option<ToolCallRequest> {
    let trimmed = content.trim();
    if !trimmed.starts_with('{') || !trimmed.contains(r#""tool""#) {
        return None;
    }
    serde_json::from_str::<ToolCallRequest>(trimmed)
        .ok()
        .filter(|call| !call.name.is_empty())
}
