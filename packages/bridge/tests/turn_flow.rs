mod common;

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use common::*;
use serde_json::{json, Value};

use acp_bridge::acp::{
    ContentBlock, PermissionMode, SessionUpdate, StopReason, ToolCallStatus,
};
use acp_bridge::agent_process::{AgentLaunchSpec, AgentProcess};
use acp_bridge::history::HistoryStore;
use acp_bridge::notify::NotificationQueue;
use acp_bridge::router::MessageRouter;
use acp_bridge::session::Session;

/// Write a shell script that plays back a scripted agent stdout and stays
/// alive long enough for the turn to complete.
fn scripted_agent(dir: &tempfile::TempDir, lines: &[Value]) -> PathBuf {
    let path = dir.path().join("agent.sh");
    let mut file = std::fs::File::create(&path).expect("script file");
    writeln!(file, "#!/bin/sh").expect("write");
    for line in lines {
        writeln!(file, "printf '%s\\n' '{line}'").expect("write");
    }
    writeln!(file, "sleep 2").expect("write");
    path
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_turn_translates_stream_into_session_updates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = scripted_agent(
        &dir,
        &[
            json!({"type": "system", "subtype": "task_notification", "message": "background job finished"}),
            json!({"type": "system", "subtype": "init", "model": "test-model"}),
            json!({"type": "assistant", "message": {"content": [
                {"type": "text", "text": "Writing the file now."},
                {"type": "tool_use", "id": "toolu_1", "name": "Write",
                 "input": {"file_path": "/a.txt", "content": "hi"}},
            ]}}),
            json!({"type": "user", "message": {"content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "wrote /a.txt"},
            ]}}),
            json!({"type": "result", "subtype": "success"}),
        ],
    );

    let spec = AgentLaunchSpec {
        program: PathBuf::from("sh"),
        args: vec![script.to_string_lossy().into_owned()],
        env: Vec::new(),
        cwd: None,
    };
    let (process, source) = AgentProcess::spawn(&spec, noop_handler()).expect("spawn");

    let task_notifications = Arc::new(Mutex::new(Vec::new()));
    let recorded = task_notifications.clone();
    let router = MessageRouter::spawn(
        source,
        Box::new(move |message| {
            let recorded = recorded.clone();
            Box::pin(async move {
                recorded.lock().expect("lock").push(message);
                Ok(())
            })
        }),
    );

    let client = MockClient::new();
    let history = Arc::new(HistoryStore::new(dir.path().join("state")).expect("history"));
    history.create("sess_turn", "/tmp", 0).expect("create");
    let session = Session::new(
        "sess_turn".to_string(),
        PathBuf::from("/tmp"),
        process,
        router,
        NotificationQueue::new(client.clone()),
        history.clone(),
        PermissionMode::Default,
    );

    let stop_reason = session
        .prompt(vec![json!({"type": "text", "text": "write a file"})])
        .await
        .expect("turn completes");
    assert_eq!(stop_reason, StopReason::EndTurn);

    // Every streamed update was delivered before the turn returned.
    let updates = session_updates(&client.updates());
    assert_eq!(updates.len(), 3, "unexpected updates: {updates:?}");
    match &updates[0] {
        SessionUpdate::AgentMessageChunk {
            content: ContentBlock::Text { text },
        } => assert_eq!(text, "Writing the file now."),
        other => panic!("expected message chunk, got {other:?}"),
    }
    match &updates[1] {
        SessionUpdate::ToolCall(call) => {
            assert_eq!(call.tool_call_id, "toolu_1");
            assert_eq!(call.title, "Write /a.txt");
            assert_eq!(call.status, ToolCallStatus::InProgress);
        }
        other => panic!("expected tool call, got {other:?}"),
    }
    match &updates[2] {
        SessionUpdate::ToolCallUpdate(update) => {
            assert_eq!(update.tool_call_id, "toolu_1");
            assert_eq!(update.status, Some(ToolCallStatus::Completed));
            assert_eq!(
                update.content,
                Some(vec![acp_bridge::acp::ToolCallContent::text("wrote /a.txt")])
            );
        }
        other => panic!("expected tool call update, got {other:?}"),
    }

    // The out-of-band event reached the handler, not the turn loop.
    let notifications = task_notifications.lock().expect("lock");
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0]["message"], "background job finished");

    // The transcript recorded the prompt, the updates, and the result.
    let entries = history.read("sess_turn").expect("transcript");
    let kinds: Vec<&str> = entries
        .iter()
        .filter_map(|entry| entry.get("type").and_then(Value::as_str))
        .collect();
    assert_eq!(kinds, vec!["meta", "prompt", "update", "update", "update", "result"]);
}

fn session_updates(notifications: &[acp_bridge::acp::SessionNotification]) -> Vec<SessionUpdate> {
    notifications
        .iter()
        .map(|notification| {
            assert_eq!(notification.session_id, "sess_turn");
            notification.update.clone()
        })
        .collect()
}
