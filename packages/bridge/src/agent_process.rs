//! Agent subprocess lifecycle and control-protocol plumbing.
//!
//! One `AgentProcess` per session. The stdout pump splits the wire into
//! control traffic (correlated here, never reaching the router) and stream
//! traffic (forwarded to the session message router's source channel).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

use acp_bridge_error::BridgeError;

use crate::cancel::CancelSignal;
use crate::protocol::{
    control_error_envelope, control_request_envelope, control_request_id,
    control_request_payload, control_response_id, control_success_envelope, message_type,
    InboundControlRequest, OutboundControlRequest, MESSAGE_TYPE_CONTROL_CANCEL,
    MESSAGE_TYPE_CONTROL_REQUEST, MESSAGE_TYPE_CONTROL_RESPONSE,
};
use crate::router::ChannelMessageSource;

const CONTROL_REQUEST_TIMEOUT: Duration = Duration::from_millis(120_000);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How to launch the agent subprocess for a session.
#[derive(Debug, Clone)]
pub struct AgentLaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

/// Handles inbound control requests (`can_use_tool`, `hook_callback`).
/// Returns the control response payload; the cancellation signal fires when
/// the subprocess cancels the request or the session's turn is cancelled.
pub type ControlHandler = Arc<
    dyn Fn(InboundControlRequest, CancelSignal) -> BoxFuture<'static, Result<Value, BridgeError>>
        + Send
        + Sync,
>;

#[derive(Debug)]
pub struct AgentProcess {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending_controls: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    /// Cancellation signals for in-flight inbound permission checks, by the
    /// subprocess's request id. Registered before the handler task starts
    /// so a cancel arriving on the very next line still finds its target;
    /// cancelling one must not touch the others.
    inflight_requests: StdMutex<HashMap<String, CancelSignal>>,
    next_request_id: AtomicU64,
    kill_requested: AtomicBool,
}

impl AgentProcess {
    /// Spawn the subprocess and start its pumps. Returns the process handle
    /// and the stream-message source for the session router.
    pub fn spawn(
        spec: &AgentLaunchSpec,
        handler: ControlHandler,
    ) -> Result<(Arc<Self>, ChannelMessageSource), BridgeError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        command.kill_on_drop(true);

        tracing::info!(program = ?spec.program, args = ?spec.args, "spawning agent process");

        let mut child = command.spawn().map_err(|err| BridgeError::StreamError {
            message: format!(
                "failed to start agent process {}: {err}",
                spec.program.display()
            ),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| BridgeError::StreamError {
            message: "failed to capture agent process stdin".to_string(),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::StreamError {
                message: "failed to capture agent process stdout".to_string(),
            })?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::StreamError {
                message: "failed to capture agent process stderr".to_string(),
            })?;

        let process = Arc::new(Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending_controls: Mutex::new(HashMap::new()),
            inflight_requests: StdMutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            kill_requested: AtomicBool::new(false),
        });

        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        process.spawn_stdout_pump(stdout, stream_tx.clone(), handler);
        process.spawn_stderr_pump(stderr);
        process.spawn_exit_watcher(stream_tx);

        Ok((process, ChannelMessageSource::new(stream_rx)))
    }

    fn spawn_stdout_pump(
        self: &Arc<Self>,
        stdout: tokio::process::ChildStdout,
        stream_tx: mpsc::UnboundedSender<Result<Value, BridgeError>>,
        handler: ControlHandler,
    ) {
        let process = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let message = match serde_json::from_str::<Value>(trimmed) {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::warn!(error = %err, "agent stdout: invalid JSON line");
                        continue;
                    }
                };

                match message_type(&message) {
                    Some(MESSAGE_TYPE_CONTROL_RESPONSE) => {
                        process.resolve_control_response(message).await;
                    }
                    Some(MESSAGE_TYPE_CONTROL_REQUEST) => {
                        process.dispatch_control_request(message, handler.clone());
                    }
                    Some(MESSAGE_TYPE_CONTROL_CANCEL) => {
                        if let Some(request_id) =
                            message.get("request_id").and_then(Value::as_str)
                        {
                            process.cancel_inflight_request(request_id);
                        }
                    }
                    _ => {
                        if stream_tx.send(Ok(message)).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_stderr_pump(self: &Arc<Self>, stderr: tokio::process::ChildStderr) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("agent stderr: {}", line);
            }
        });
    }

    fn spawn_exit_watcher(
        self: &Arc<Self>,
        stream_tx: mpsc::UnboundedSender<Result<Value, BridgeError>>,
    ) {
        let process = self.clone();
        tokio::spawn(async move {
            let status = loop {
                let probe = {
                    let mut child = process.child.lock().await;
                    child.try_wait()
                };
                match probe {
                    Ok(Some(status)) => break Some(status),
                    Ok(None) => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to poll agent process status");
                        break None;
                    }
                }
            };

            let exit_code = status.as_ref().and_then(|status| status.code());
            let clean = status.map(|status| status.success()).unwrap_or(false);
            let killed = process.kill_requested.load(Ordering::SeqCst);
            tracing::info!(exit_code = ?exit_code, killed = killed, "agent process exited");

            // Pending outbound control requests can never complete now.
            process.pending_controls.lock().await.clear();

            // Unwind in-flight permission checks.
            let inflight: Vec<CancelSignal> = process
                .inflight_requests
                .lock()
                .expect("inflight lock")
                .drain()
                .map(|(_, signal)| signal)
                .collect();
            for signal in inflight {
                signal.cancel();
            }

            if !clean && !killed {
                let _ = stream_tx.send(Err(BridgeError::AgentProcessExited {
                    exit_code,
                    message: None,
                }));
            }
            // Dropping the sender ends the stream for the router.
        });
    }

    async fn resolve_control_response(&self, message: Value) {
        let Some(request_id) = control_response_id(&message).map(ToOwned::to_owned) else {
            tracing::warn!("agent control_response without request_id");
            return;
        };
        let sender = self.pending_controls.lock().await.remove(&request_id);
        match sender {
            Some(sender) => {
                let _ = sender.send(message);
            }
            None => {
                tracing::warn!(request_id = %request_id, "orphan agent control_response");
            }
        }
    }

    fn dispatch_control_request(self: &Arc<Self>, message: Value, handler: ControlHandler) {
        let Some(request_id) = control_request_id(&message).map(ToOwned::to_owned) else {
            tracing::warn!("agent control_request without request_id");
            return;
        };
        let Some(request) =
            control_request_payload(&message).and_then(InboundControlRequest::from_value)
        else {
            let process = self.clone();
            tokio::spawn(async move {
                let envelope = control_error_envelope(&request_id, "malformed control request");
                let _ = process.write_message(&envelope).await;
            });
            return;
        };

        let signal = CancelSignal::new();
        self.inflight_requests
            .lock()
            .expect("inflight lock")
            .insert(request_id.clone(), signal.clone());

        let process = self.clone();
        tokio::spawn(async move {
            let outcome = handler(request, signal).await;

            process
                .inflight_requests
                .lock()
                .expect("inflight lock")
                .remove(&request_id);

            let envelope = match outcome {
                Ok(response) => control_success_envelope(&request_id, response),
                Err(err) => control_error_envelope(&request_id, &err.to_string()),
            };
            if let Err(err) = process.write_message(&envelope).await {
                tracing::warn!(error = %err, "failed to answer agent control request");
            }
        });
    }

    fn cancel_inflight_request(&self, request_id: &str) {
        // Fire the one signal; the handler task removes the entry on exit.
        if let Some(signal) = self
            .inflight_requests
            .lock()
            .expect("inflight lock")
            .get(request_id)
        {
            signal.cancel();
        }
    }

    /// Send one stream message (e.g. a user prompt) to the subprocess.
    pub async fn send_message(&self, message: &Value) -> Result<(), BridgeError> {
        self.write_message(message).await
    }

    /// Send a control request and await its response payload.
    pub async fn control_request(
        &self,
        request: OutboundControlRequest,
    ) -> Result<Value, BridgeError> {
        let request_id = format!(
            "req_{}",
            self.next_request_id.fetch_add(1, Ordering::SeqCst)
        );
        let envelope = control_request_envelope(&request_id, &request);

        let (tx, rx) = oneshot::channel();
        self.pending_controls
            .lock()
            .await
            .insert(request_id.clone(), tx);

        if let Err(err) = self.write_message(&envelope).await {
            self.pending_controls.lock().await.remove(&request_id);
            return Err(err);
        }

        let response = match tokio::time::timeout(CONTROL_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(BridgeError::StreamError {
                    message: "agent process closed before answering control request".to_string(),
                });
            }
            Err(_) => {
                self.pending_controls.lock().await.remove(&request_id);
                return Err(BridgeError::Timeout {
                    message: Some("timed out waiting for agent control response".to_string()),
                });
            }
        };

        let body = response.get("response").cloned().unwrap_or(Value::Null);
        if body.get("subtype").and_then(Value::as_str) == Some("error") {
            let detail = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("agent control request failed");
            return Err(BridgeError::StreamError {
                message: detail.to_string(),
            });
        }
        Ok(body.get("response").cloned().unwrap_or(Value::Null))
    }

    pub async fn initialize(&self, hooks: Option<Value>) -> Result<Value, BridgeError> {
        self.control_request(OutboundControlRequest::Initialize { hooks })
            .await
    }

    pub async fn interrupt(&self) -> Result<(), BridgeError> {
        self.control_request(OutboundControlRequest::Interrupt)
            .await
            .map(|_| ())
    }

    pub async fn set_permission_mode(&self, mode: &str) -> Result<(), BridgeError> {
        self.control_request(OutboundControlRequest::SetPermissionMode {
            mode: mode.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    pub async fn kill(&self) {
        self.kill_requested.store(true, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    }

    async fn write_message(&self, message: &Value) -> Result<(), BridgeError> {
        let encoded = serde_json::to_vec(message).map_err(|err| BridgeError::InvalidRequest {
            message: format!("failed to serialize agent message: {err}"),
        })?;
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(&encoded)
            .await
            .map_err(|err| BridgeError::StreamError {
                message: format!("failed to write to agent process stdin: {err}"),
            })?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|err| BridgeError::StreamError {
                message: format!("failed to write line delimiter to agent process stdin: {err}"),
            })?;
        stdin
            .flush()
            .await
            .map_err(|err| BridgeError::StreamError {
                message: format!("failed to flush agent process stdin: {err}"),
            })?;
        Ok(())
    }
}
