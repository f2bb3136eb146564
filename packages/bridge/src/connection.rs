//! Client-facing JSON-RPC connection and request dispatch.
//!
//! The editor speaks line-delimited JSON-RPC on stdio. Inbound traffic is
//! triaged by envelope shape (request / notification / response); outbound
//! requests are correlated through an arena-style pending map — entries are
//! inserted on send and removed on settle and on every abandonment path
//! (timeout, write failure, cancellation).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};

use acp_bridge_error::BridgeError;

use crate::acp::{
    jsonrpc_error_response, jsonrpc_notification, jsonrpc_request, jsonrpc_response,
    message_id_key, PermissionMode, PermissionRequest, RequestPermissionOutcome,
    SessionNotification,
};
use crate::agent_process::{AgentLaunchSpec, AgentProcess, ControlHandler};
use crate::cancel::CancelSignal;
use crate::client::ClientSink;
use crate::history::HistoryStore;
use crate::hooks::HookCallback;
use crate::permission::{PermissionDecision, PermissionNegotiator};
use crate::protocol::InboundControlRequest;
use crate::router::MessageRouter;
use crate::session::{now_ms, Session, SessionRegistry};
use crate::settings::{RuleDecision, SettingsStore};
use crate::notify::NotificationQueue;

/// Hard client-side timeout for permission prompts, independent of the
/// caller's cancellation signal.
const PERMISSION_REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub const SESSION_LIST_METHOD: &str = "_acpbridge/session/list";
pub const SESSION_GET_METHOD: &str = "_acpbridge/session/get";
pub const SESSION_DELETE_METHOD: &str = "_acpbridge/session/delete";

pub const PROTOCOL_VERSION: u64 = 1;

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct ConnectionInner {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Outbound requests awaiting a client response, by serialized id.
    /// Entries are removed by the response handler and by the guard below,
    /// so a request dropped mid-race cannot leak its slot.
    pending: StdMutex<HashMap<String, oneshot::Sender<Value>>>,
    next_id: AtomicU64,
}

/// Removes a pending-request entry when the owning future settles or is
/// dropped (cancellation path). Removal after the response handler already
/// took the entry is a no-op.
struct PendingEntryGuard {
    inner: Arc<ConnectionInner>,
    key: String,
}

impl Drop for PendingEntryGuard {
    fn drop(&mut self) {
        self.inner.pending.lock().expect("pending lock").remove(&self.key);
    }
}

#[derive(Clone)]
pub struct AcpConnection {
    inner: Arc<ConnectionInner>,
}

impl AcpConnection {
    pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                writer: Mutex::new(writer),
                pending: StdMutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn stdio() -> Self {
        Self::new(Box::new(tokio::io::stdout()))
    }

    async fn write_value(&self, value: &Value) -> Result<(), BridgeError> {
        let encoded = serde_json::to_vec(value).map_err(|err| BridgeError::StreamError {
            message: format!("failed to serialize client message: {err}"),
        })?;
        let mut writer = self.inner.writer.lock().await;
        writer
            .write_all(&encoded)
            .await
            .map_err(|err| BridgeError::StreamError {
                message: format!("failed to write to client: {err}"),
            })?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|err| BridgeError::StreamError {
                message: format!("failed to write line delimiter to client: {err}"),
            })?;
        writer
            .flush()
            .await
            .map_err(|err| BridgeError::StreamError {
                message: format!("failed to flush client writer: {err}"),
            })?;
        Ok(())
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), BridgeError> {
        self.write_value(&jsonrpc_notification(method, params)).await
    }

    pub async fn respond(&self, id: Value, result: Value) {
        if let Err(err) = self.write_value(&jsonrpc_response(id, result)).await {
            tracing::warn!(error = %err, "failed to write client response");
        }
    }

    pub async fn respond_error(&self, id: Value, error: &BridgeError) {
        if let Err(write_err) = self.write_value(&jsonrpc_error_response(id, error)).await {
            tracing::warn!(error = %write_err, "failed to write client error response");
        }
    }

    /// Send a request to the client and await its result.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let id_value = Value::from(id);
        let key = message_id_key(&id_value);

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending lock")
            .insert(key.clone(), tx);
        let _guard = PendingEntryGuard {
            inner: self.inner.clone(),
            key,
        };

        self.write_value(&jsonrpc_request(id_value, method, params))
            .await?;

        match rx.await {
            Ok(response) => Ok(response),
            Err(_) => Err(BridgeError::StreamError {
                message: "client connection closed before responding".to_string(),
            }),
        }
    }

    /// Resolve a pending outbound request from a client response envelope.
    pub async fn handle_response(&self, message: &Value) {
        let Some(id) = message.get("id") else {
            return;
        };
        let key = message_id_key(id);
        let sender = self.inner.pending.lock().expect("pending lock").remove(&key);
        match sender {
            Some(sender) => {
                let result = message.get("result").cloned().unwrap_or(Value::Null);
                let _ = sender.send(result);
            }
            None => {
                tracing::warn!(id = %key, "client response does not match any pending request");
            }
        }
    }

}

impl ClientSink for AcpConnection {
    fn session_update(
        &self,
        notification: SessionNotification,
    ) -> BoxFuture<'static, Result<(), BridgeError>> {
        let connection = self.clone();
        Box::pin(async move {
            let params =
                serde_json::to_value(&notification).map_err(|err| BridgeError::StreamError {
                    message: format!("failed to serialize session update: {err}"),
                })?;
            connection.notify("session/update", params).await
        })
    }

    fn request_permission(
        &self,
        request: PermissionRequest,
    ) -> BoxFuture<'static, Result<RequestPermissionOutcome, BridgeError>> {
        let connection = self.clone();
        Box::pin(async move {
            let params =
                serde_json::to_value(&request).map_err(|err| BridgeError::StreamError {
                    message: format!("failed to serialize permission request: {err}"),
                })?;
            let response = tokio::time::timeout(
                PERMISSION_REQUEST_TIMEOUT,
                connection.request("session/request_permission", params),
            )
            .await;
            match response {
                Ok(Ok(result)) => {
                    let outcome = result.get("outcome").cloned().unwrap_or(Value::Null);
                    serde_json::from_value(outcome).map_err(|err| BridgeError::InvalidRequest {
                        message: format!("malformed permission response: {err}"),
                    })
                }
                Ok(Err(err)) => Err(err),
                // Timed-out prompts resolve as cancelled so the pending
                // entry cannot leak indefinitely.
                Err(_) => Ok(RequestPermissionOutcome::Cancelled),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Bridge state and dispatch
// ---------------------------------------------------------------------------

pub struct Bridge {
    pub connection: AcpConnection,
    pub registry: Arc<SessionRegistry>,
    pub negotiator: Arc<PermissionNegotiator>,
    pub history: Arc<HistoryStore>,
    pub settings: Arc<SettingsStore>,
    launch: AgentLaunchSpec,
    next_session_id: AtomicU64,
}

impl Bridge {
    pub fn new(
        connection: AcpConnection,
        launch: AgentLaunchSpec,
        settings: Arc<SettingsStore>,
        history: Arc<HistoryStore>,
    ) -> Arc<Self> {
        let registry = SessionRegistry::new();
        let negotiator =
            PermissionNegotiator::new(registry.clone(), Arc::new(connection.clone()));
        Arc::new(Self {
            connection,
            registry,
            negotiator,
            history,
            settings,
            launch,
            next_session_id: AtomicU64::new(1),
        })
    }

    /// Read the client side of the connection until EOF.
    pub async fn run(self: &Arc<Self>, reader: impl AsyncBufRead + Unpin) -> Result<(), BridgeError> {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await.map_err(|err| BridgeError::StreamError {
            message: format!("failed to read from client: {err}"),
        })? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let message = match serde_json::from_str::<Value>(trimmed) {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(error = %err, "client sent invalid JSON line");
                    continue;
                }
            };

            let method = message.get("method").and_then(Value::as_str);
            let id = message.get("id");
            match (method, id) {
                (Some(method), Some(id)) => {
                    let bridge = self.clone();
                    let method = method.to_string();
                    let id = id.clone();
                    let params = message.get("params").cloned().unwrap_or(json!({}));
                    tokio::spawn(async move {
                        match bridge.handle_request(&method, params).await {
                            Ok(result) => bridge.connection.respond(id, result).await,
                            Err(err) => bridge.connection.respond_error(id, &err).await,
                        }
                    });
                }
                (Some(method), None) => {
                    let bridge = self.clone();
                    let method = method.to_string();
                    let params = message.get("params").cloned().unwrap_or(json!({}));
                    tokio::spawn(async move {
                        bridge.handle_notification(&method, params).await;
                    });
                }
                (None, Some(_)) => {
                    self.connection.handle_response(&message).await;
                }
                (None, None) => {
                    tracing::warn!("client message is neither request, notification nor response");
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    pub async fn run_stdio(self: &Arc<Self>) -> Result<(), BridgeError> {
        self.run(BufReader::new(tokio::io::stdin())).await
    }

    pub async fn shutdown(&self) {
        for session in self.registry.all().await {
            session.cancel_turn();
            session.process.kill().await;
        }
    }

    async fn handle_request(self: &Arc<Self>, method: &str, params: Value) -> Result<Value, BridgeError> {
        match method {
            "initialize" => Ok(self.initialize_response(&params)),
            "authenticate" => Ok(Value::Null),
            "session/new" => self.session_new(&params).await,
            "session/load" => self.session_load(&params).await,
            "session/prompt" => self.session_prompt(&params).await,
            "session/set_mode" => self.session_set_mode(&params).await,
            SESSION_LIST_METHOD => self.session_list(),
            SESSION_GET_METHOD => self.session_get(&params),
            SESSION_DELETE_METHOD => self.session_delete(&params).await,
            other => Err(BridgeError::MethodNotFound {
                method: other.to_string(),
            }),
        }
    }

    async fn handle_notification(self: &Arc<Self>, method: &str, params: Value) {
        match method {
            "session/cancel" => {
                let Some(session_id) = params.get("sessionId").and_then(Value::as_str) else {
                    tracing::warn!("session/cancel without sessionId");
                    return;
                };
                match self.registry.get(session_id).await {
                    Some(session) => {
                        session.cancel_turn();
                        if let Err(err) = session.process.interrupt().await {
                            tracing::warn!(error = %err, "failed to interrupt agent process");
                        }
                    }
                    None => {
                        tracing::warn!(session_id = %session_id, "cancel for unknown session");
                    }
                }
            }
            other => {
                tracing::debug!(method = %other, "unhandled client notification");
            }
        }
    }

    fn initialize_response(&self, params: &Value) -> Value {
        let requested = params
            .get("protocolVersion")
            .and_then(Value::as_u64)
            .unwrap_or(PROTOCOL_VERSION);
        json!({
            "protocolVersion": requested.min(PROTOCOL_VERSION),
            "agentCapabilities": {
                "loadSession": true,
                "promptCapabilities": {
                    "image": true,
                    "embeddedContext": true,
                }
            },
            "authMethods": [],
            "_meta": {
                "acp-bridge": {
                    "extensions": {
                        "sessionList": SESSION_LIST_METHOD,
                        "sessionGet": SESSION_GET_METHOD,
                        "sessionDelete": SESSION_DELETE_METHOD,
                    }
                }
            }
        })
    }

    async fn session_new(self: &Arc<Self>, params: &Value) -> Result<Value, BridgeError> {
        let cwd = params
            .get("cwd")
            .and_then(Value::as_str)
            .unwrap_or("/")
            .to_string();
        let session_id = format!(
            "sess_{}",
            self.next_session_id.fetch_add(1, Ordering::SeqCst)
        );
        // Transcript first so its meta line precedes any recorded update.
        self.history.create(&session_id, &cwd, now_ms())?;
        self.start_session(&session_id, &cwd).await?;
        Ok(json!({
            "sessionId": session_id,
            "modes": modes_payload(PermissionMode::Default),
        }))
    }

    async fn session_load(self: &Arc<Self>, params: &Value) -> Result<Value, BridgeError> {
        let session_id = required_str(params, "sessionId")?;
        let cwd = params
            .get("cwd")
            .and_then(Value::as_str)
            .unwrap_or("/")
            .to_string();

        // Replay recorded updates before answering so the client rebuilds
        // the transcript in order.
        let entries = self.history.read(&session_id)?;
        for entry in &entries {
            if entry.get("type").and_then(Value::as_str) != Some("update") {
                continue;
            }
            let Some(update) = entry.get("update") else {
                continue;
            };
            let params = json!({"sessionId": session_id, "update": update});
            if let Err(err) = self.connection.notify("session/update", params).await {
                tracing::warn!(error = %err, "failed to replay session update");
                break;
            }
        }

        let session = self.start_session(&session_id, &cwd).await?;
        Ok(json!({"modes": modes_payload(session.mode())}))
    }

    async fn session_prompt(self: &Arc<Self>, params: &Value) -> Result<Value, BridgeError> {
        let session_id = required_str(params, "sessionId")?;
        let session = self.registry.require(&session_id).await?;
        let prompt = params
            .get("prompt")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let content = prompt_to_agent_blocks(&prompt);
        let stop_reason = session.prompt(content).await?;
        Ok(json!({"stopReason": stop_reason}))
    }

    async fn session_set_mode(self: &Arc<Self>, params: &Value) -> Result<Value, BridgeError> {
        let session_id = required_str(params, "sessionId")?;
        let mode: PermissionMode = required_str(params, "modeId")?.parse()?;
        let session = self.registry.require(&session_id).await?;
        session.set_mode(mode);
        if let Err(err) = session.process.set_permission_mode(mode.as_str()).await {
            tracing::warn!(error = %err, "failed to forward permission mode to agent");
        }
        Ok(Value::Null)
    }

    fn session_list(&self) -> Result<Value, BridgeError> {
        let sessions = self.history.list()?;
        Ok(json!({"sessions": sessions}))
    }

    fn session_get(&self, params: &Value) -> Result<Value, BridgeError> {
        let session_id = required_str(params, "sessionId")?;
        let entries = self.history.read(&session_id)?;
        Ok(json!({"sessionId": session_id, "entries": entries}))
    }

    async fn session_delete(self: &Arc<Self>, params: &Value) -> Result<Value, BridgeError> {
        let session_id = required_str(params, "sessionId")?;
        if let Some(session) = self.registry.remove(&session_id).await {
            session.cancel_turn();
            session.process.kill().await;
        }
        self.history.delete(&session_id)?;
        Ok(Value::Null)
    }

    /// Spawn the subprocess and wire up the session pipeline.
    async fn start_session(
        self: &Arc<Self>,
        session_id: &str,
        cwd: &str,
    ) -> Result<Arc<Session>, BridgeError> {
        let mut launch = self.launch.clone();
        launch.cwd = Some(PathBuf::from(cwd));

        let handler = self.control_handler(session_id.to_string());
        let (process, source) = AgentProcess::spawn(&launch, handler)?;

        let handler_bridge = self.clone();
        let router = MessageRouter::spawn(
            source,
            Box::new(move |message| {
                let bridge = handler_bridge.clone();
                Box::pin(async move { bridge.handle_task_notification(message).await })
            }),
        );

        let queue = NotificationQueue::new(Arc::new(self.connection.clone()));
        let session = Session::new(
            session_id.to_string(),
            PathBuf::from(cwd),
            process,
            router,
            queue,
            self.history.clone(),
            PermissionMode::Default,
        );

        let pretool_id = register_pretool_hook(&session, self.settings.clone());
        self.registry.insert(session.clone()).await?;

        let hooks = json!({
            "PreToolUse": [{"matcher": "*", "hookCallbackIds": [pretool_id]}],
        });
        if let Err(err) = session.process.initialize(Some(hooks)).await {
            tracing::warn!(error = %err, "agent process initialize failed");
        }
        Ok(session)
    }

    /// Out-of-band system events: surfaced to the client outside any turn.
    async fn handle_task_notification(self: &Arc<Self>, message: Value) -> Result<(), BridgeError> {
        let session_id = message
            .get("session_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        tracing::info!(session_id = %session_id, "agent task notification");
        self.connection
            .notify(
                "_acpbridge/task_notification",
                json!({"sessionId": session_id, "notification": message}),
            )
            .await
    }

    /// Control-request handler for one session's subprocess.
    fn control_handler(self: &Arc<Self>, session_id: String) -> ControlHandler {
        let bridge = self.clone();
        Arc::new(move |request, signal| {
            let bridge = bridge.clone();
            let session_id = session_id.clone();
            Box::pin(async move {
                match request {
                    InboundControlRequest::CanUseTool(request) => {
                        let decision = bridge
                            .decide_tool_use(&session_id, request, signal)
                            .await?;
                        Ok(decision.to_wire().to_value())
                    }
                    InboundControlRequest::HookCallback(request) => {
                        let session = bridge.registry.require(&session_id).await?;
                        let callback = session.hooks.get(&request.callback_id).ok_or_else(|| {
                            BridgeError::InvalidRequest {
                                message: format!(
                                    "unknown hook callback: {}",
                                    request.callback_id
                                ),
                            }
                        })?;
                        callback(request.input).await
                    }
                    InboundControlRequest::Unknown { subtype } => Err(BridgeError::InvalidRequest {
                        message: format!("unsupported control request: {subtype}"),
                    }),
                }
            })
        })
    }

    /// Full tool-use decision path: settings rules first, negotiator for
    /// `ask`.
    pub async fn decide_tool_use(
        self: &Arc<Self>,
        session_id: &str,
        request: crate::protocol::CanUseToolRequest,
        signal: CancelSignal,
    ) -> Result<PermissionDecision, BridgeError> {
        // Pre-tool rule check in front of the negotiator: allow and deny
        // short-circuit, ask falls through.
        let check = self.settings.check_permission(&request.tool_name, &request.input);
        match check.decision {
            RuleDecision::Allow => Ok(PermissionDecision::Allow {
                updated_input: Some(request.input),
                updated_permissions: None,
            }),
            RuleDecision::Deny => Ok(PermissionDecision::Deny {
                message: match &check.rule {
                    Some(rule) => format!("Permission denied by settings rule {rule}"),
                    None => "Permission denied by settings".to_string(),
                },
                interrupt: true,
            }),
            RuleDecision::Ask => {
                // A session cancel must unwind this prompt too.
                let cancel = match self.registry.get(session_id).await {
                    Some(session) => CancelSignal::merged(&signal, &session.turn_signal()),
                    None => signal,
                };
                let suggestions = request
                    .permission_suggestions
                    .and_then(|value| serde_json::from_value(value).ok());
                self.negotiator
                    .can_use_tool(
                        session_id,
                        &request.tool_name,
                        request.input,
                        suggestions,
                        cancel,
                    )
                    .await
            }
        }
    }
}

fn register_pretool_hook(session: &Arc<Session>, settings: Arc<SettingsStore>) -> String {
    let callback_id = format!("pretool_{}", session.id);
    let callback: HookCallback = Arc::new(move |input| {
        let settings = settings.clone();
        Box::pin(async move {
            let tool_name = input.get("tool_name").and_then(Value::as_str).unwrap_or("");
            let tool_input = input.get("tool_input").cloned().unwrap_or(Value::Null);
            let check = settings.check_permission(tool_name, &tool_input);
            Ok(json!({
                "decision": check.decision.as_str(),
                "rule": check.rule,
            }))
        })
    });
    session.hooks.register(&callback_id, callback);
    callback_id
}

fn modes_payload(current: PermissionMode) -> Value {
    json!({
        "currentModeId": current.as_str(),
        "availableModes": PermissionMode::all()
            .iter()
            .map(|mode| json!({"id": mode.as_str(), "name": mode.label()}))
            .collect::<Vec<_>>(),
    })
}

fn required_str(params: &Value, key: &str) -> Result<String, BridgeError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| BridgeError::InvalidRequest {
            message: format!("missing required parameter: {key}"),
        })
}

/// ACP prompt content → subprocess user message content blocks.
fn prompt_to_agent_blocks(prompt: &[Value]) -> Vec<Value> {
    prompt
        .iter()
        .map(|block| {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => json!({
                    "type": "text",
                    "text": block.get("text").and_then(Value::as_str).unwrap_or(""),
                }),
                Some("image") => json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "data": block.get("data").and_then(Value::as_str).unwrap_or(""),
                        "media_type": block
                            .get("mimeType")
                            .and_then(Value::as_str)
                            .unwrap_or("image/png"),
                    }
                }),
                Some("resource") => {
                    let text = block
                        .pointer("/resource/text")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let uri = block
                        .pointer("/resource/uri")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    json!({"type": "text", "text": format!("{uri}:\n{text}")})
                }
                Some("resource_link") => json!({
                    "type": "text",
                    "text": block.get("uri").and_then(Value::as_str).unwrap_or(""),
                }),
                // Unknown content degrades to its JSON text.
                _ => json!({"type": "text", "text": block.to_string()}),
            }
        })
        .collect()
}
