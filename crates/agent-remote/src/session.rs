//! Remote Tool Session
//!
//! Owns one tool server subprocess and multiplexes tool calls over its
//! stdin/stdout. Every request carries a fresh correlation id; a background
//! reader task routes each response to the caller waiting on that id, so any
//! number of calls may be in flight and the server may answer in any order.
//!
//! ## Lifecycle
//!
//! ```text
//!  Unstarted ──start──▶ Starting ──handshake ok──▶ Ready ◀──respawn ok──┐
//!                          │                         │                  │
//!                    handshake failed        transport fault /          │
//!                          │                 too many timeouts          │
//!                          ▼                         ▼                  │
//!                      Terminated ◀──budget spent── Degraded ───────────┘
//! ```
//!
//! Any transport fault (malformed frame, closed pipe, exited process) fails
//! every call in flight and moves the session to `Degraded`; the session then
//! respawns the process while its restart budget lasts. `Terminated` is
//! final: calls fail fast with [`RemoteError::Terminated`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use agent_core::{RemoteTools, ToolOutcome, ToolSchema};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RemoteSessionConfig;
use crate::error::{RemoteError, Result};
use crate::process::{self, ServerProcess};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, PeerInfo,
    ServerMessage, ToolDef, ToolsListParams, ToolsListResult, encode_frame, error_codes, methods,
};

/// Upper bound on `tools/list` pages followed during discovery
const MAX_LIST_PAGES: usize = 64;

/// Name announced in the handshake
const CLIENT_NAME: &str = "agent-remote";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Unstarted,
    Starting,
    Ready,
    Degraded,
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// What a waiting caller receives: the response, or why it never came
type Reply = std::result::Result<JsonRpcResponse, String>;

struct Pending {
    generation: u64,
    reply: oneshot::Sender<Reply>,
}

/// State shared with the per-process reader and writer tasks.
///
/// `generation` increases with every spawned process, so a task belonging
/// to a replaced process can never fail calls or flip the state of its
/// successor.
struct Shared {
    name: String,
    pending: Mutex<HashMap<u64, Pending>>,
    state: watch::Sender<SessionState>,
    generation: AtomicU64,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(server = %self.name, from = %previous, to = %next, "Session state changed");
        }
    }

    /// Ready -> Degraded, only for the current process
    fn degrade(&self, generation: u64, reason: &str) -> bool {
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        let changed = self.state.send_if_modified(|state| {
            if *state == SessionState::Ready {
                *state = SessionState::Degraded;
                true
            } else {
                false
            }
        });
        if changed {
            warn!(server = %self.name, generation, reason, "Tool server degraded");
        }
        changed
    }

    /// Route a response to its caller
    fn deliver(&self, response: JsonRpcResponse) {
        let Some(id) = response.correlation_id() else {
            warn!(server = %self.name, id = %response.id, "Dropping response without a usable id");
            return;
        };
        let entry = self.pending.lock().remove(&id);
        match entry {
            Some(entry) => {
                // The caller may have gone away in the meantime.
                let _ = entry.reply.send(Ok(response));
            }
            None => {
                warn!(server = %self.name, id, "Dropping response with unknown correlation id");
            }
        }
    }

    /// Fail every call waiting on `generation` (or on any generation)
    fn fail_pending(&self, generation: Option<u64>, reason: &str) {
        let failed: Vec<Pending> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, entry)| generation.is_none_or(|g| entry.generation == g))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        if !failed.is_empty() {
            debug!(server = %self.name, count = failed.len(), reason, "Failing in-flight calls");
        }
        for entry in failed {
            let _ = entry.reply.send(Err(reason.to_string()));
        }
    }

    fn connection_lost(&self, generation: u64, reason: &str) {
        self.degrade(generation, reason);
        self.fail_pending(Some(generation), reason);
    }

    fn handle_notification(&self, notification: &JsonRpcNotification) {
        match notification.method.as_str() {
            "notifications/message" => {
                let data = notification
                    .params
                    .as_ref()
                    .and_then(|p| p.get("data"))
                    .map(ToString::to_string)
                    .unwrap_or_default();
                info!(server = %self.name, "{data}");
            }
            other => {
                debug!(server = %self.name, method = other, "Ignoring notification");
            }
        }
    }
}

/// Removes the pending entry when the waiting call finishes or is dropped,
/// so a late response for an abandoned call is treated as unknown.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.id);
    }
}

struct Connection {
    generation: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    process: ServerProcess,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct Inner {
    config: RemoteSessionConfig,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    connection: Mutex<Option<Connection>>,
    /// Serializes start, respawn and shutdown
    lifecycle: tokio::sync::Mutex<()>,
    consecutive_timeouts: AtomicU32,
    restarts: AtomicU32,
    tools: RwLock<Vec<ToolDef>>,
    server_info: RwLock<PeerInfo>,
}

/// Handle to a supervised tool server. Cheap to clone.
#[derive(Clone)]
pub struct RemoteToolSession {
    inner: Arc<Inner>,
}

impl RemoteToolSession {
    /// Create an unstarted session
    pub fn new(config: RemoteSessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Unstarted);
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            pending: Mutex::new(HashMap::new()),
            state,
            generation: AtomicU64::new(0),
        });
        Self {
            inner: Arc::new(Inner {
                config,
                shared,
                next_id: AtomicU64::new(1),
                connection: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                consecutive_timeouts: AtomicU32::new(0),
                restarts: AtomicU32::new(0),
                tools: RwLock::new(Vec::new()),
                server_info: RwLock::new(PeerInfo::default()),
            }),
        }
    }

    /// Create a session and bring it to `Ready`
    pub async fn connect(config: RemoteSessionConfig) -> Result<Self> {
        let session = Self::new(config);
        session.start().await?;
        Ok(session)
    }

    /// Spawn the process, perform the handshake and load the tool list.
    ///
    /// A failure here terminates the session.
    pub async fn start(&self) -> Result<()> {
        self.inner.config.validate()?;
        self.inner.recover().await
    }

    /// Ask the server for its tools and refresh the cached list
    pub async fn discover(&self) -> Result<Vec<ToolSchema>> {
        self.inner.ensure_ready().await?;
        let tools = match self.inner.list_tools().await {
            Ok(tools) => tools,
            Err(err) => return Err(self.inner.after_failure(err)),
        };
        self.inner.update_tools(tools);
        Ok(self.tools())
    }

    /// Tools learned during the last discovery
    pub fn tools(&self) -> Vec<ToolSchema> {
        self.inner.tools.read().iter().map(ToolDef::to_schema).collect()
    }

    /// Call a tool.
    ///
    /// Tool-level failures (including JSON-RPC errors such as an unknown
    /// tool) come back as `Ok(ToolOutcome::Error)`; `Err` means the call
    /// could not be completed over the transport.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutcome> {
        self.inner.ensure_ready().await?;

        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        let deadline = self.inner.config.request_timeout;
        match self.inner.request(methods::TOOLS_CALL, Some(params), deadline).await {
            Ok(result) => {
                self.inner.consecutive_timeouts.store(0, Ordering::Release);
                Ok(match serde_json::from_value::<CallToolResult>(result) {
                    Ok(result) => result.into_outcome(),
                    Err(e) => ToolOutcome::error(format!("Unreadable result from '{name}': {e}")),
                })
            }
            Err(RemoteError::Rpc(err)) => {
                self.inner.consecutive_timeouts.store(0, Ordering::Release);
                debug!(server = %self.inner.config.name, tool = name, error = %err, "Tool call rejected");
                Ok(ToolOutcome::error(format!("Tool '{name}' failed: {err}")))
            }
            Err(err) => Err(self.inner.after_failure(err)),
        }
    }

    /// Round-trip a `ping`
    pub async fn ping(&self) -> Result<()> {
        self.inner.ensure_ready().await?;
        let deadline = self.inner.config.request_timeout;
        match self.inner.request(methods::PING, None, deadline).await {
            Ok(_) => Ok(()),
            Err(err) => Err(self.inner.after_failure(err)),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.shared.state()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.shared.state.subscribe()
    }

    /// Respawns performed so far
    pub fn restart_count(&self) -> u32 {
        self.inner.restarts.load(Ordering::Acquire)
    }

    pub fn server_info(&self) -> PeerInfo {
        self.inner.server_info.read().clone()
    }

    /// OS process id of the current tool server, if one is running
    pub fn process_id(&self) -> Option<u32> {
        self.inner
            .connection
            .lock()
            .as_ref()
            .and_then(|conn| conn.process.id())
    }

    /// Number of calls waiting for a response
    pub fn in_flight(&self) -> usize {
        self.inner.shared.pending.lock().len()
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Close stdin, give the server its grace period, then kill it.
    /// Calls still in flight fail; later calls fail fast.
    pub async fn shutdown(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.state() != SessionState::Terminated {
            info!(server = %self.inner.config.name, "Shutting down tool server");
        }
        self.inner.terminate(true, "session shut down").await;
    }
}

#[async_trait]
impl RemoteTools for RemoteToolSession {
    async fn invoke(&self, name: &str, arguments: Value) -> agent_core::Result<ToolOutcome> {
        self.call_tool(name, arguments).await.map_err(Into::into)
    }
}

impl std::fmt::Debug for RemoteToolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteToolSession")
            .field("name", &self.inner.config.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Inner {
    async fn ensure_ready(self: &Arc<Self>) -> Result<()> {
        match self.shared.state() {
            SessionState::Ready => Ok(()),
            SessionState::Terminated => Err(RemoteError::Terminated),
            SessionState::Unstarted | SessionState::Starting | SessionState::Degraded => {
                self.recover().await
            }
        }
    }

    /// Bring the session to `Ready`, respawning if it degraded.
    async fn recover(self: &Arc<Self>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let respawn = match self.shared.state() {
            SessionState::Ready => return Ok(()),
            SessionState::Terminated => return Err(RemoteError::Terminated),
            SessionState::Unstarted => false,
            SessionState::Starting | SessionState::Degraded => true,
        };

        if respawn {
            let used = self.restarts.load(Ordering::Acquire);
            if used >= self.config.restart_budget {
                error!(
                    server = %self.config.name,
                    budget = self.config.restart_budget,
                    "Restart budget exhausted, terminating session"
                );
                self.terminate(false, "restart budget exhausted").await;
                return Err(RemoteError::Terminated);
            }
            self.restarts.store(used + 1, Ordering::Release);
            warn!(
                server = %self.config.name,
                attempt = used + 1,
                budget = self.config.restart_budget,
                "Respawning tool server"
            );
        }

        match self.launch().await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(server = %self.config.name, error = %err, "Tool server failed to start");
                self.terminate(false, "tool server failed to start").await;
                Err(err)
            }
        }
    }

    /// Spawn a fresh process and run the handshake. Caller holds `lifecycle`.
    async fn launch(&self) -> Result<()> {
        self.shared.set_state(SessionState::Starting);
        self.teardown(false).await;

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let spawned = process::spawn(&self.config)?;
        let pid = spawned.process.id();

        let (outbound, queue) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_frames(
            Arc::clone(&self.shared),
            generation,
            spawned.stdin,
            queue,
        ));
        let reader = tokio::spawn(read_frames(
            Arc::clone(&self.shared),
            generation,
            spawned.stdout,
            outbound.downgrade(),
        ));
        *self.connection.lock() = Some(Connection {
            generation,
            outbound,
            process: spawned.process,
            reader,
            writer,
        });
        info!(server = %self.config.name, command = %self.config.command, ?pid, generation, "Tool server spawned");

        self.handshake().await?;
        let tools = self.list_tools().await?;
        self.update_tools(tools);

        self.consecutive_timeouts.store(0, Ordering::Release);
        self.shared.set_state(SessionState::Ready);
        Ok(())
    }

    async fn handshake(&self) -> Result<()> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({}),
            client_info: PeerInfo {
                name: CLIENT_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let result = self
            .request(
                methods::INITIALIZE,
                Some(serde_json::to_value(&params)?),
                self.config.init_timeout,
            )
            .await?;
        let init: InitializeResult = serde_json::from_value(result)?;

        if init.protocol_version != PROTOCOL_VERSION {
            warn!(
                server = %self.config.name,
                theirs = %init.protocol_version,
                ours = PROTOCOL_VERSION,
                "Protocol version mismatch, continuing"
            );
        }
        info!(
            server = %self.config.name,
            server_name = %init.server_info.name,
            server_version = %init.server_info.version,
            "Tool server initialized"
        );
        *self.server_info.write() = init.server_info;

        self.notify(methods::INITIALIZED, None)
    }

    async fn list_tools(&self) -> Result<Vec<ToolDef>> {
        let mut tools = Vec::new();
        let mut cursor = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = serde_json::to_value(ToolsListParams { cursor })?;
            let result = self
                .request(methods::TOOLS_LIST, Some(params), self.config.request_timeout)
                .await?;
            let page: ToolsListResult = serde_json::from_value(result)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
        Err(RemoteError::transport(format!(
            "tools/list did not finish within {MAX_LIST_PAGES} pages"
        )))
    }

    fn update_tools(&self, tools: Vec<ToolDef>) {
        let mut cached = self.tools.write();
        if !cached.is_empty() {
            let before: Vec<&str> = cached.iter().map(|t| t.name.as_str()).collect();
            let after: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
            if before != after {
                warn!(server = %self.config.name, ?before, ?after, "Tool server changed its tool set");
            }
        }
        debug!(server = %self.config.name, count = tools.len(), "Discovered tools");
        *cached = tools;
    }

    /// Send a request and wait for the matching response
    async fn request(&self, method: &str, params: Option<Value>, deadline: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = encode_frame(&JsonRpcRequest::new(id, method, params))?;
        let (reply, response) = oneshot::channel();

        {
            let connection = self.connection.lock();
            let conn = connection
                .as_ref()
                .ok_or_else(|| RemoteError::transport("tool server is not running"))?;
            self.shared.pending.lock().insert(
                id,
                Pending {
                    generation: conn.generation,
                    reply,
                },
            );
            if conn.outbound.send(frame).is_err() {
                self.shared.pending.lock().remove(&id);
                return Err(RemoteError::transport("tool server input is closed"));
            }
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };
        debug!(server = %self.config.name, id, method, "Request sent");

        match tokio::time::timeout(deadline, response).await {
            Err(_) => Err(RemoteError::Timeout {
                method: method.to_string(),
                after: deadline,
            }),
            Ok(Err(_)) => Err(RemoteError::transport("response channel closed")),
            Ok(Ok(Err(reason))) => Err(RemoteError::Transport(reason)),
            Ok(Ok(Ok(response))) => response.into_result().map_err(RemoteError::Rpc),
        }
    }

    fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let frame = encode_frame(&JsonRpcNotification::new(method, params))?;
        let connection = self.connection.lock();
        let conn = connection
            .as_ref()
            .ok_or_else(|| RemoteError::transport("tool server is not running"))?;
        conn.outbound
            .send(frame)
            .map_err(|_| RemoteError::transport("tool server input is closed"))
    }

    /// Book-keeping after a failed exchange; returns the error unchanged.
    ///
    /// Transport faults and runs of timeouts leave the session `Degraded`;
    /// a respawn is then started in the background so the next call finds
    /// a fresh process.
    fn after_failure(self: &Arc<Self>, err: RemoteError) -> RemoteError {
        let degraded = match &err {
            RemoteError::Timeout { method, .. } => {
                let count = self.consecutive_timeouts.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(server = %self.config.name, method = %method, count, "Request timed out");
                if count > self.config.max_consecutive_timeouts {
                    let generation = self.shared.generation.load(Ordering::Acquire);
                    self.shared.degrade(generation, "too many consecutive timeouts")
                } else {
                    false
                }
            }
            err if err.is_transport() => self.shared.state() == SessionState::Degraded,
            _ => false,
        };

        if degraded {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = inner.recover().await {
                    debug!(server = %inner.config.name, error = %err, "Background respawn failed");
                }
            });
        }
        err
    }

    /// Stop the process and make the session final. Caller holds `lifecycle`.
    async fn terminate(&self, graceful: bool, reason: &str) {
        self.shared.set_state(SessionState::Terminated);
        self.teardown(graceful).await;
        self.shared.fail_pending(None, reason);
    }

    /// Stop the current process, if any
    async fn teardown(&self, graceful: bool) {
        let conn = self.connection.lock().take();
        let Some(conn) = conn else {
            return;
        };
        let Connection {
            generation,
            outbound,
            process,
            reader,
            mut writer,
        } = conn;

        if graceful {
            // Dropping the sender lets the writer flush and close stdin.
            drop(outbound);
            if tokio::time::timeout(self.config.shutdown_timeout, &mut writer)
                .await
                .is_err()
            {
                writer.abort();
            }
            process.terminate(self.config.shutdown_timeout).await;
        } else {
            writer.abort();
            process.kill().await;
        }
        reader.abort();
        self.shared.fail_pending(Some(generation), "tool server stopped");
        debug!(server = %self.config.name, generation, "Tool server stopped");
    }
}

async fn write_frames(
    shared: Arc<Shared>,
    generation: u64,
    stdin: ChildStdin,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let mut writer = BufWriter::new(stdin);
    while let Some(frame) = queue.recv().await {
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            shared.connection_lost(generation, &format!("write to tool server failed: {e}"));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Refuse a server-initiated request; this client offers no capabilities.
fn refuse(shared: &Shared, request: &JsonRpcRequest, replies: &mpsc::WeakUnboundedSender<Vec<u8>>) {
    debug!(server = %shared.name, method = %request.method, "Refusing server request");
    let response = JsonRpcResponse::failure(
        request.id.clone(),
        JsonRpcError::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", request.method),
        ),
    );
    match (encode_frame(&response), replies.upgrade()) {
        (Ok(frame), Some(outbound)) => {
            let _ = outbound.send(frame);
        }
        (Err(e), _) => warn!(server = %shared.name, error = %e, "Cannot encode refusal"),
        (Ok(_), None) => {}
    }
}

/// The reader only holds a weak sender so that dropping the connection's
/// sender still closes the child's stdin.
async fn read_frames(
    shared: Arc<Shared>,
    generation: u64,
    stdout: ChildStdout,
    replies: mpsc::WeakUnboundedSender<Vec<u8>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(None) => break "tool server closed its output".to_string(),
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match ServerMessage::from_line(line) {
                    Ok(ServerMessage::Response(response)) => shared.deliver(response),
                    Ok(ServerMessage::Request(request)) => refuse(&shared, &request, &replies),
                    Ok(ServerMessage::Notification(notification)) => {
                        shared.handle_notification(&notification);
                    }
                    Err(e) => break format!("malformed frame from tool server: {e}"),
                }
            }
            Err(e) => break format!("read from tool server failed: {e}"),
        }
    };
    shared.connection_lost(generation, &reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JSONRPC_VERSION;

    fn shared() -> Shared {
        let (state, _) = watch::channel(SessionState::Ready);
        Shared {
            name: "test".into(),
            pending: Mutex::new(HashMap::new()),
            state,
            generation: AtomicU64::new(1),
        }
    }

    fn response(id: u64) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Value::from(id),
            result: Some(serde_json::json!({"ok": true})),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_deliver_routes_by_id() {
        let shared = shared();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        shared.pending.lock().insert(10, Pending { generation: 1, reply: tx_a });
        shared.pending.lock().insert(11, Pending { generation: 1, reply: tx_b });

        shared.deliver(response(11));
        shared.deliver(response(10));

        assert_eq!(rx_a.await.unwrap().unwrap().correlation_id(), Some(10));
        assert_eq!(rx_b.await.unwrap().unwrap().correlation_id(), Some(11));
        assert!(shared.pending.lock().is_empty());
    }

    #[test]
    fn test_unknown_id_is_dropped() {
        let shared = shared();
        let (tx, _rx) = oneshot::channel();
        shared.pending.lock().insert(1, Pending { generation: 1, reply: tx });

        shared.deliver(response(99));

        assert_eq!(shared.pending.lock().len(), 1);
        assert_eq!(shared.state(), SessionState::Ready);
    }

    #[test]
    fn test_server_request_is_refused_not_delivered() {
        let shared = shared();
        let (tx, mut rx) = oneshot::channel();
        shared.pending.lock().insert(5, Pending { generation: 1, reply: tx });
        let (outbound, mut queue) = mpsc::unbounded_channel();

        let request = JsonRpcRequest::new(5, "roots/list", None);
        refuse(&shared, &request, &outbound.downgrade());

        let frame = queue.try_recv().unwrap();
        let reply: JsonRpcResponse = serde_json::from_slice(&frame).unwrap();
        assert_eq!(reply.correlation_id(), Some(5));
        assert_eq!(reply.into_result().unwrap_err().code, error_codes::METHOD_NOT_FOUND);

        // The caller waiting on id 5 is still waiting
        assert_eq!(shared.pending.lock().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connection_lost_only_touches_its_generation() {
        let shared = shared();
        let (old_tx, old_rx) = oneshot::channel();
        let (new_tx, _new_rx) = oneshot::channel();
        shared.pending.lock().insert(1, Pending { generation: 1, reply: old_tx });
        shared.pending.lock().insert(2, Pending { generation: 2, reply: new_tx });
        shared.generation.store(2, Ordering::Release);

        shared.connection_lost(1, "eof");

        assert!(old_rx.await.unwrap().is_err());
        assert!(shared.pending.lock().contains_key(&2));
        // A stale reader must not degrade the current process
        assert_eq!(shared.state(), SessionState::Ready);

        shared.connection_lost(2, "eof");
        assert_eq!(shared.state(), SessionState::Degraded);
        assert!(shared.pending.lock().is_empty());
    }

    #[test]
    fn test_degrade_only_from_ready() {
        let shared = shared();
        shared.set_state(SessionState::Starting);
        assert!(!shared.degrade(1, "eof"));
        assert_eq!(shared.state(), SessionState::Starting);
    }

    #[test]
    fn test_pending_guard_removes_entry() {
        let shared = shared();
        let (tx, _rx) = oneshot::channel();
        shared.pending.lock().insert(5, Pending { generation: 1, reply: tx });
        {
            let _guard = PendingGuard { shared: &shared, id: 5 };
        }
        assert!(shared.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unstartable_command_terminates() {
        let session = RemoteToolSession::new(RemoteSessionConfig::new(
            "/nonexistent/tool-server-binary",
            Vec::<String>::new(),
        ));
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, RemoteError::Spawn { .. }));
        assert_eq!(session.state(), SessionState::Terminated);

        let err = session.call_tool("anything", Value::Null).await.unwrap_err();
        assert!(matches!(err, RemoteError::Terminated));
    }
}
