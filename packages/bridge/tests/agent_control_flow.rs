use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use acp_bridge::agent_process::{AgentLaunchSpec, AgentProcess, ControlHandler};
use acp_bridge::protocol::{InboundControlRequest, PermissionResultWire};

fn scripted_agent(dir: &tempfile::TempDir, lines: &[Value]) -> AgentLaunchSpec {
    let path = dir.path().join("agent.sh");
    let mut file = std::fs::File::create(&path).expect("script file");
    writeln!(file, "#!/bin/sh").expect("write");
    for line in lines {
        writeln!(file, "printf '%s\\n' '{line}'").expect("write");
    }
    writeln!(file, "sleep 2").expect("write");
    AgentLaunchSpec {
        program: PathBuf::from("sh"),
        args: vec![path.to_string_lossy().into_owned()],
        env: Vec::new(),
        cwd: None,
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn can_use_tool_request_reaches_the_handler() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = scripted_agent(
        &dir,
        &[json!({
            "type": "control_request",
            "request_id": "agent_req_1",
            "request": {
                "subtype": "can_use_tool",
                "tool_name": "Bash",
                "input": {"command": "ls"},
            }
        })],
    );

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = seen.clone();
    let handler: ControlHandler = Arc::new(move |request, _signal| {
        let recorded = recorded.clone();
        Box::pin(async move {
            if let InboundControlRequest::CanUseTool(request) = request {
                recorded.lock().expect("lock").push(request.tool_name);
            }
            Ok(PermissionResultWire::Allow {
                updated_input: None,
                updated_permissions: None,
            }
            .to_value())
        })
    });

    let (_process, _source) = AgentProcess::spawn(&spec, handler).expect("spawn");
    wait_until("handler invocation", || {
        !seen.lock().expect("lock").is_empty()
    })
    .await;
    assert_eq!(seen.lock().expect("lock").as_slice(), ["Bash"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn control_cancel_fires_only_the_matching_signal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = scripted_agent(
        &dir,
        &[
            json!({
                "type": "control_request",
                "request_id": "agent_req_1",
                "request": {
                    "subtype": "can_use_tool",
                    "tool_name": "Bash",
                    "input": {"command": "sleep forever"},
                }
            }),
            json!({
                "type": "control_request",
                "request_id": "agent_req_2",
                "request": {
                    "subtype": "can_use_tool",
                    "tool_name": "Read",
                    "input": {"file_path": "/a.txt"},
                }
            }),
            json!({
                "type": "control_cancel_request",
                "request_id": "agent_req_1",
            }),
        ],
    );

    // Handlers park until their signal fires; record which ones unwound.
    let cancelled: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = cancelled.clone();
    let handler: ControlHandler = Arc::new(move |request, signal| {
        let recorded = recorded.clone();
        Box::pin(async move {
            let InboundControlRequest::CanUseTool(request) = request else {
                return Ok(Value::Null);
            };
            tokio::select! {
                _ = signal.cancelled() => {
                    recorded.lock().expect("lock").push(request.tool_name);
                    Err(acp_bridge_error::BridgeError::Aborted)
                }
                _ = tokio::time::sleep(Duration::from_millis(600)) => {
                    Ok(PermissionResultWire::Allow {
                        updated_input: None,
                        updated_permissions: None,
                    }
                    .to_value())
                }
            }
        })
    });

    let (_process, _source) = AgentProcess::spawn(&spec, handler).expect("spawn");
    wait_until("cancelled handler", || {
        !cancelled.lock().expect("lock").is_empty()
    })
    .await;

    // Only the cancelled request unwound; the unrelated one ran to its
    // normal completion.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(cancelled.lock().expect("lock").as_slice(), ["Bash"]);
}
