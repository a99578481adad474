//! Tool server side of the protocol.
//!
//! [`ToolServer`] answers `initialize`, `tools/list`, `tools/call` and `ping`
//! on any line-oriented byte stream. Each request runs on its own task and
//! responses are written as they complete, so a slow tool never blocks a
//! fast one and answers may leave out of request order.

use std::sync::Arc;

use agent_core::ToolSchema;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    CallToolParams, CallToolResult, ClientMessage, InitializeResult, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, PeerInfo, ToolDef, ToolsListParams,
    ToolsListResult, encode_frame, error_codes, methods,
};

/// A tool hosted by a [`ToolServer`]
#[async_trait]
pub trait ServerTool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    /// Run the tool. `Err` becomes an `isError` result, not a protocol error.
    async fn call(&self, arguments: Map<String, Value>) -> anyhow::Result<String>;
}

pub struct ToolServer {
    info: PeerInfo,
    tools: Vec<Arc<dyn ServerTool>>,
    page_size: Option<usize>,
}

impl ToolServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: PeerInfo {
                name: name.into(),
                version: version.into(),
            },
            tools: Vec::new(),
            page_size: None,
        }
    }

    #[must_use]
    pub fn with_tool<T: ServerTool + 'static>(mut self, tool: T) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    /// Split `tools/list` into pages of `size` entries
    #[must_use]
    pub const fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.schema().name).collect()
    }

    fn find(&self, name: &str) -> Option<&Arc<dyn ServerTool>> {
        self.tools.iter().find(|t| t.schema().name == name)
    }

    /// Serve until `input` reaches EOF and every accepted request has been
    /// answered.
    pub async fn serve<R, W>(self: Arc<Self>, input: R, output: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, mut queue) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer = tokio::spawn(async move {
            let mut output = output;
            while let Some(frame) = queue.recv().await {
                output.write_all(&frame).await?;
                output.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        });

        info!(server = %self.info.name, tools = self.tools.len(), "Serving tools");
        let mut lines = BufReader::new(input).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match ClientMessage::from_line(line) {
                Ok(ClientMessage::Request(request)) => {
                    let server = Arc::clone(&self);
                    let outbound = outbound.clone();
                    tokio::spawn(async move {
                        let response = server.handle_request(request).await;
                        send(&outbound, &response);
                    });
                }
                Ok(ClientMessage::Notification(notification)) => {
                    debug!(method = %notification.method, "Notification received");
                }
                Ok(ClientMessage::Response(response)) => {
                    debug!(id = %response.id, "Ignoring response from client");
                }
                Err(e) => {
                    warn!(error = %e, "Unparseable frame");
                    let error = JsonRpcError::new(error_codes::PARSE_ERROR, e.to_string());
                    send(&outbound, &JsonRpcResponse::failure(Value::Null, error));
                }
            }
        }

        debug!("Input closed, draining in-flight requests");
        drop(outbound);
        writer.await.map_err(std::io::Error::other)?
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        debug!(%id, method = %method, "Request received");

        let result = match method.as_str() {
            methods::INITIALIZE => to_result(&InitializeResult {
                protocol_version: PROTOCOL_VERSION.to_string(),
                capabilities: json!({"tools": {"listChanged": false}}),
                server_info: self.info.clone(),
            }),
            methods::TOOLS_LIST => self.list(params),
            methods::TOOLS_CALL => self.call(params).await,
            methods::PING => Ok(json!({})),
            other => Err(JsonRpcError::new(
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        };

        match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(error) => JsonRpcResponse::failure(id, error),
        }
    }

    fn list(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: ToolsListParams = match params {
            None | Some(Value::Null) => ToolsListParams::default(),
            params => parse_params(params)?,
        };
        let defs: Vec<ToolDef> = self.tools.iter().map(|t| ToolDef::from(&t.schema())).collect();

        let Some(size) = self.page_size.filter(|size| *size > 0) else {
            return to_result(&ToolsListResult {
                tools: defs,
                next_cursor: None,
            });
        };
        let start = match params.cursor.as_deref() {
            None => 0,
            Some(cursor) => cursor.parse::<usize>().map_err(|_| {
                JsonRpcError::new(error_codes::INVALID_PARAMS, format!("Bad cursor: {cursor}"))
            })?,
        };
        let end = (start + size).min(defs.len());
        let page = defs.get(start..end).map(<[ToolDef]>::to_vec).unwrap_or_default();
        to_result(&ToolsListResult {
            tools: page,
            next_cursor: (end < defs.len()).then(|| end.to_string()),
        })
    }

    async fn call(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let CallToolParams { name, arguments } = parse_params(params)?;
        let tool = self.find(&name).ok_or_else(|| {
            JsonRpcError::new(error_codes::INVALID_PARAMS, format!("Unknown tool: {name}"))
        })?;

        let arguments = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(JsonRpcError::new(
                    error_codes::INVALID_PARAMS,
                    format!("Arguments must be an object, got {other}"),
                ));
            }
        };

        let result = match tool.schema().validate(&arguments) {
            Err(e) => CallToolResult::error(e.to_string()),
            Ok(()) => match tool.call(arguments).await {
                Ok(text) => CallToolResult::text(text),
                Err(e) => {
                    debug!(tool = %name, error = %e, "Tool reported an error");
                    CallToolResult::error(e.to_string())
                }
            },
        };
        to_result(&result)
    }
}

fn send(outbound: &mpsc::UnboundedSender<Vec<u8>>, response: &JsonRpcResponse) {
    match encode_frame(response) {
        Ok(frame) => {
            // Writer is gone only when output failed; nothing left to tell.
            let _ = outbound.send(frame);
        }
        Err(e) => error!(error = %e, "Failed to encode response"),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    let params = params
        .ok_or_else(|| JsonRpcError::new(error_codes::INVALID_PARAMS, "Missing params"))?;
    serde_json::from_value(params)
        .map_err(|e| JsonRpcError::new(error_codes::INVALID_PARAMS, e.to_string()))
}

fn to_result<T: serde::Serialize>(value: &T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value)
        .map_err(|e| JsonRpcError::new(error_codes::INTERNAL_ERROR, e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use agent_core::ParameterSchema;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    use super::*;

    struct Upper;

    #[async_trait]
    impl ServerTool for Upper {
        fn schema(&self) -> ToolSchema {
            ToolSchema::new("upper", "Uppercase text").with_parameters(&[
                ParameterSchema::required("text", "string", "Text to convert"),
            ])
        }

        async fn call(&self, arguments: Map<String, Value>) -> anyhow::Result<String> {
            let text = arguments
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("text must be a string"))?;
            Ok(text.to_uppercase())
        }
    }

    struct Nap;

    #[async_trait]
    impl ServerTool for Nap {
        fn schema(&self) -> ToolSchema {
            ToolSchema::new("nap", "Sleep briefly")
        }

        async fn call(&self, _arguments: Map<String, Value>) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("rested".into())
        }
    }

    fn server() -> ToolServer {
        ToolServer::new("test-server", "0.0.1")
            .with_tool(Upper)
            .with_tool(Nap)
    }

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest::new(1, method, Some(params))
    }

    #[tokio::test]
    async fn test_initialize_reports_server_info() {
        let response = server().handle_request(request(methods::INITIALIZE, json!({}))).await;
        let result: InitializeResult = serde_json::from_value(response.into_result().unwrap()).unwrap();
        assert_eq!(result.server_info.name, "test-server");
        assert_eq!(result.protocol_version, PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_call_and_tool_errors() {
        let server = server();

        let ok = server
            .handle_request(request(methods::TOOLS_CALL, json!({"name": "upper", "arguments": {"text": "hi"}})))
            .await;
        let ok: CallToolResult = serde_json::from_value(ok.into_result().unwrap()).unwrap();
        assert!(!ok.is_error);
        assert_eq!(ok.joined_text(), "HI");

        let missing = server
            .handle_request(request(methods::TOOLS_CALL, json!({"name": "upper", "arguments": {}})))
            .await;
        let missing: CallToolResult = serde_json::from_value(missing.into_result().unwrap()).unwrap();
        assert!(missing.is_error);
        assert!(missing.joined_text().contains("text"));

        let unknown = server
            .handle_request(request(methods::TOOLS_CALL, json!({"name": "nope"})))
            .await;
        assert_eq!(unknown.into_result().unwrap_err().code, error_codes::INVALID_PARAMS);

        let method = server.handle_request(request("resources/list", json!({}))).await;
        assert_eq!(method.into_result().unwrap_err().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pagination() {
        let server = server().with_page_size(1);

        let first = server.handle_request(request(methods::TOOLS_LIST, json!({}))).await;
        let first: ToolsListResult = serde_json::from_value(first.into_result().unwrap()).unwrap();
        assert_eq!(first.tools.len(), 1);
        assert_eq!(first.next_cursor.as_deref(), Some("1"));

        let second = server
            .handle_request(request(methods::TOOLS_LIST, json!({"cursor": "1"})))
            .await;
        let second: ToolsListResult = serde_json::from_value(second.into_result().unwrap()).unwrap();
        assert_eq!(second.tools[0].name, "nap");
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_serve_answers_out_of_order() {
        let (client, server_end) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_end);
        let serving = tokio::spawn(Arc::new(server()).serve(server_read, server_write));

        let (client_read, mut client_write) = tokio::io::split(client);
        let slow = JsonRpcRequest::new(1, methods::TOOLS_CALL, Some(json!({"name": "nap"})));
        let fast = JsonRpcRequest::new(
            2,
            methods::TOOLS_CALL,
            Some(json!({"name": "upper", "arguments": {"text": "x"}})),
        );
        client_write.write_all(&encode_frame(&slow).unwrap()).await.unwrap();
        client_write.write_all(&encode_frame(&fast).unwrap()).await.unwrap();
        client_write.write_all(b"{broken\n").await.unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let line = lines.next_line().await.unwrap().unwrap();
            let response: JsonRpcResponse = serde_json::from_str(&line).unwrap();
            ids.push(response.id);
        }
        // Parse error and the fast call both beat the sleeping one
        assert_eq!(ids.last(), Some(&json!(1)));
        assert!(ids.contains(&Value::Null));

        drop(lines);
        drop(client_write);
        serving.await.unwrap().unwrap();
    }
}
