//! Session entity, registry, and the prompt turn loop.
//!
//! One logical pipeline per session: router background loop plus the turn
//! loop below. Only one thread of control touches a session's turn state at
//! a time; the suspension points are router reads, permission round-trips,
//! and queued sends.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};

use acp_bridge_error::BridgeError;

use crate::acp::{ContentBlock, PermissionMode, SessionNotification, SessionUpdate, StopReason,
    ToolCallStatus, ToolCallUpdate};
use crate::agent_process::AgentProcess;
use crate::cancel::CancelSignal;
use crate::history::HistoryStore;
use crate::hooks::{HookCallbackRegistry, DEFAULT_HOOK_TTL};
use crate::notify::NotificationQueue;
use crate::protocol::{
    block_type, message_content_blocks, message_subtype, message_type, user_prompt_message,
    ToolResultBlock, ToolUseBlock, MESSAGE_TYPE_ASSISTANT, MESSAGE_TYPE_RESULT,
    MESSAGE_TYPE_STREAM_EVENT, MESSAGE_TYPE_SYSTEM, MESSAGE_TYPE_USER,
};
use crate::router::MessageRouter;
use crate::tool_calls::{
    effective_tool_name, plan_entries_from_todo_write, tool_info_from_tool_use,
    tool_update_from_tool_result,
};

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct Session {
    pub id: String,
    pub cwd: PathBuf,
    pub process: Arc<AgentProcess>,
    pub queue: NotificationQueue,
    pub hooks: HookCallbackRegistry,
    router: Mutex<MessageRouter>,
    history: Arc<HistoryStore>,
    mode: StdMutex<PermissionMode>,
    turn_cancel: StdMutex<CancelSignal>,
    /// Originating tool uses by id, for correlating later results. Entries
    /// are removed when the result arrives.
    tool_uses: StdMutex<HashMap<String, ToolUseBlock>>,
    pub created_at: i64,
    updated_at: StdMutex<i64>,
    title: StdMutex<Option<String>>,
}

impl Session {
    pub fn new(
        id: String,
        cwd: PathBuf,
        process: Arc<AgentProcess>,
        router: MessageRouter,
        queue: NotificationQueue,
        history: Arc<HistoryStore>,
        mode: PermissionMode,
    ) -> Arc<Self> {
        let now = now_ms();
        Arc::new(Self {
            id,
            cwd,
            process,
            queue,
            hooks: HookCallbackRegistry::new(DEFAULT_HOOK_TTL),
            router: Mutex::new(router),
            history,
            mode: StdMutex::new(mode),
            turn_cancel: StdMutex::new(CancelSignal::new()),
            tool_uses: StdMutex::new(HashMap::new()),
            created_at: now,
            updated_at: StdMutex::new(now),
            title: StdMutex::new(None),
        })
    }

    pub fn mode(&self) -> PermissionMode {
        *self.mode.lock().expect("mode lock")
    }

    pub fn set_mode(&self, mode: PermissionMode) {
        *self.mode.lock().expect("mode lock") = mode;
    }

    pub fn title(&self) -> Option<String> {
        self.title.lock().expect("title lock").clone()
    }

    pub fn updated_at(&self) -> i64 {
        *self.updated_at.lock().expect("updated_at lock")
    }

    pub fn touch(&self) {
        *self.updated_at.lock().expect("updated_at lock") = now_ms();
    }

    /// Cancellation signal of the current turn.
    pub fn turn_signal(&self) -> CancelSignal {
        self.turn_cancel.lock().expect("turn lock").clone()
    }

    fn begin_turn(&self) -> CancelSignal {
        let fresh = CancelSignal::new();
        *self.turn_cancel.lock().expect("turn lock") = fresh.clone();
        fresh
    }

    /// Fired by `session/cancel`: unwinds pending permission prompts and
    /// interrupts the subprocess. The turn itself ends when the subprocess
    /// emits its result.
    pub fn cancel_turn(&self) {
        self.turn_cancel.lock().expect("turn lock").cancel();
    }

    pub fn record_tool_use(&self, tool_use: ToolUseBlock) {
        self.tool_uses
            .lock()
            .expect("tool_uses lock")
            .insert(tool_use.id.clone(), tool_use);
    }

    pub fn take_tool_use(&self, tool_use_id: &str) -> Option<ToolUseBlock> {
        self.tool_uses
            .lock()
            .expect("tool_uses lock")
            .remove(tool_use_id)
    }

    fn notify(&self, update: SessionUpdate) {
        self.record_update(&update);
        self.queue
            .enqueue(SessionNotification::new(self.id.clone(), update));
    }

    fn record_update(&self, update: &SessionUpdate) {
        let entry = json!({
            "type": "update",
            "at": now_ms(),
            "update": update,
        });
        if let Err(err) = self.history.append(&self.id, &entry) {
            tracing::debug!(error = %err, "failed to record session update");
        }
    }

    /// Run one prompt turn: forward the user message, then translate the
    /// routed stream into session updates until the turn's result arrives.
    pub async fn prompt(&self, content: Vec<Value>) -> Result<StopReason, BridgeError> {
        let turn = self.begin_turn();
        if let Err(err) = self.history.append(
            &self.id,
            &json!({"type": "prompt", "at": now_ms(), "content": content}),
        ) {
            tracing::debug!(error = %err, "failed to record prompt");
        }

        self.process
            .send_message(&user_prompt_message(&self.id, content))
            .await?;

        let mut router = self.router.lock().await;
        loop {
            let message = match router.next().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    return Err(BridgeError::AgentProcessExited {
                        exit_code: None,
                        message: Some("agent process ended mid-turn".to_string()),
                    });
                }
                Err(err) => return Err(err),
            };

            match message_type(&message) {
                Some(MESSAGE_TYPE_ASSISTANT) => self.handle_assistant_message(&message),
                Some(MESSAGE_TYPE_USER) => self.handle_user_message(&message),
                Some(MESSAGE_TYPE_STREAM_EVENT) => self.handle_stream_event(&message),
                Some(MESSAGE_TYPE_SYSTEM) => {
                    tracing::debug!(
                        subtype = ?message_subtype(&message),
                        "system message during turn"
                    );
                }
                Some(MESSAGE_TYPE_RESULT) => {
                    // The editor must never see "turn ended" before every
                    // streamed token: the reply happens after this flush.
                    self.queue.flush().await;
                    self.touch();
                    if let Err(err) = self.history.append(
                        &self.id,
                        &json!({"type": "result", "at": now_ms(), "result": message}),
                    ) {
                        tracing::debug!(error = %err, "failed to record result");
                    }
                    return turn_outcome(&message, turn.is_cancelled());
                }
                other => {
                    tracing::debug!(message_type = ?other, "unhandled stream message");
                }
            }
        }
    }

    fn handle_assistant_message(&self, message: &Value) {
        for block in message_content_blocks(message) {
            match block_type(&block) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        self.notify(SessionUpdate::AgentMessageChunk {
                            content: ContentBlock::text(text),
                        });
                    }
                }
                Some("thinking") => {
                    if let Some(thinking) = block.get("thinking").and_then(Value::as_str) {
                        self.notify(SessionUpdate::AgentThoughtChunk {
                            content: ContentBlock::text(thinking),
                        });
                    }
                }
                Some("image") => {
                    if let Some(content) = image_block_content(&block) {
                        self.notify(SessionUpdate::AgentMessageChunk { content });
                    }
                }
                Some("tool_use") | Some("server_tool_use") | Some("mcp_tool_use") => {
                    if let Some(tool_use) = ToolUseBlock::from_value(&block) {
                        self.handle_tool_use(tool_use);
                    }
                }
                Some("tool_result") => {
                    if let Some(result) = ToolResultBlock::from_value(&block) {
                        self.handle_tool_result(result);
                    }
                }
                other => {
                    tracing::debug!(block_type = ?other, "skipping assistant content block");
                }
            }
        }
    }

    fn handle_user_message(&self, message: &Value) {
        for block in message_content_blocks(message) {
            if let Some(result) = ToolResultBlock::from_value(&block) {
                self.handle_tool_result(result);
            }
        }
    }

    fn handle_tool_use(&self, tool_use: ToolUseBlock) {
        // Todo updates become a plan view instead of a tool call.
        if effective_tool_name(&tool_use.name) == "TodoWrite" {
            if let Some(entries) = plan_entries_from_todo_write(&tool_use.input) {
                self.record_tool_use(tool_use);
                self.notify(SessionUpdate::Plan { entries });
                return;
            }
        }

        let info = tool_info_from_tool_use(&tool_use.name, &tool_use.input);
        let call = crate::acp::ToolCall {
            tool_call_id: tool_use.id.clone(),
            title: info.title,
            kind: info.kind,
            status: ToolCallStatus::InProgress,
            content: info.content,
            locations: info.locations,
            raw_input: Some(tool_use.input.clone()),
        };
        self.record_tool_use(tool_use);
        self.notify(SessionUpdate::ToolCall(call));
    }

    fn handle_tool_result(&self, result: ToolResultBlock) {
        let tool_use = self.take_tool_use(&result.tool_use_id);
        if tool_use.is_none() {
            tracing::warn!(
                tool_use_id = %result.tool_use_id,
                "tool result without a recorded tool use"
            );
        }
        let is_error = result.is_error.unwrap_or(false);
        let patch = tool_update_from_tool_result(&result, tool_use.as_ref());
        let update = ToolCallUpdate {
            tool_call_id: result.tool_use_id.clone(),
            status: Some(if is_error {
                ToolCallStatus::Failed
            } else {
                ToolCallStatus::Completed
            }),
            title: patch.title,
            kind: None,
            content: patch.content,
            locations: patch.locations,
            raw_output: result.content.clone(),
        };
        self.notify(SessionUpdate::ToolCallUpdate(update));
    }

    fn handle_stream_event(&self, message: &Value) {
        let Some(event) = message.get("event") else {
            return;
        };
        if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
            return;
        }
        let Some(delta) = event.get("delta") else {
            return;
        };
        match delta.get("type").and_then(Value::as_str) {
            Some("text_delta") => {
                if let Some(text) = delta.get("text").and_then(Value::as_str) {
                    self.notify(SessionUpdate::AgentMessageChunk {
                        content: ContentBlock::text(text),
                    });
                }
            }
            Some("thinking_delta") => {
                if let Some(thinking) = delta.get("thinking").and_then(Value::as_str) {
                    self.notify(SessionUpdate::AgentThoughtChunk {
                        content: ContentBlock::text(thinking),
                    });
                }
            }
            _ => {}
        }
    }
}

fn image_block_content(block: &Value) -> Option<ContentBlock> {
    let source = block.get("source")?;
    match source.get("type").and_then(Value::as_str) {
        Some("base64") => Some(ContentBlock::Image {
            data: source.get("data").and_then(Value::as_str)?.to_string(),
            mime_type: source
                .get("media_type")
                .and_then(Value::as_str)
                .unwrap_or("image/png")
                .to_string(),
            uri: None,
        }),
        Some("url") => Some(ContentBlock::Image {
            data: String::new(),
            mime_type: String::new(),
            uri: source
                .get("url")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
        }),
        _ => None,
    }
}

fn turn_outcome(result: &Value, cancelled: bool) -> Result<StopReason, BridgeError> {
    if cancelled {
        return Ok(StopReason::Cancelled);
    }
    let subtype = message_subtype(result).unwrap_or("");
    let is_error = result
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if subtype == "success" && !is_error {
        return Ok(StopReason::EndTurn);
    }
    if subtype == "error_max_turns" {
        return Ok(StopReason::MaxTokens);
    }
    let detail = result
        .get("result")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| format!("agent turn failed: {subtype}"));
    Err(BridgeError::StreamError { message: detail })
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, session: Arc<Session>) -> Result<(), BridgeError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(BridgeError::SessionAlreadyExists {
                session_id: session.id.clone(),
            });
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn require(&self, session_id: &str) -> Result<Arc<Session>, BridgeError> {
        self.get(session_id)
            .await
            .ok_or_else(|| BridgeError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    pub async fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(session_id)
    }

    pub async fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_outcome_maps_result_shapes() {
        let success = json!({"type": "result", "subtype": "success"});
        assert!(matches!(
            turn_outcome(&success, false),
            Ok(StopReason::EndTurn)
        ));
        assert!(matches!(
            turn_outcome(&success, true),
            Ok(StopReason::Cancelled)
        ));

        let max_turns = json!({"type": "result", "subtype": "error_max_turns"});
        assert!(matches!(
            turn_outcome(&max_turns, false),
            Ok(StopReason::MaxTokens)
        ));

        let failed = json!({
            "type": "result",
            "subtype": "error_during_execution",
            "result": "model exploded",
        });
        match turn_outcome(&failed, false) {
            Err(BridgeError::StreamError { message }) => assert_eq!(message, "model exploded"),
            other => panic!("expected stream error, got {other:?}"),
        }
    }
}
