#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use acp_bridge::acp::{
    PermissionMode, PermissionRequest, RequestPermissionOutcome, SessionNotification,
};
use acp_bridge::agent_process::{AgentLaunchSpec, AgentProcess, ControlHandler};
use acp_bridge::client::ClientSink;
use acp_bridge::history::HistoryStore;
use acp_bridge::notify::NotificationQueue;
use acp_bridge::permission::PermissionNegotiator;
use acp_bridge::router::{ChannelMessageSource, MessageRouter};
use acp_bridge::session::{Session, SessionRegistry};
use acp_bridge_error::BridgeError;

pub struct ScriptedReply {
    pub outcome: RequestPermissionOutcome,
    pub delay: Duration,
}

/// Client sink with scripted permission replies and recorded traffic.
pub struct MockClient {
    updates: Arc<Mutex<Vec<SessionNotification>>>,
    requests: Arc<Mutex<Vec<PermissionRequest>>>,
    replies: Arc<Mutex<VecDeque<ScriptedReply>>>,
}

impl MockClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            updates: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            replies: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    pub fn push_select(&self, option_id: &str) {
        self.push_reply(
            RequestPermissionOutcome::Selected {
                option_id: option_id.to_string(),
            },
            Duration::ZERO,
        );
    }

    pub fn push_cancelled(&self) {
        self.push_reply(RequestPermissionOutcome::Cancelled, Duration::ZERO);
    }

    pub fn push_reply(&self, outcome: RequestPermissionOutcome, delay: Duration) {
        self.replies
            .lock()
            .expect("replies lock")
            .push_back(ScriptedReply { outcome, delay });
    }

    pub fn updates(&self) -> Vec<SessionNotification> {
        self.updates.lock().expect("updates lock").clone()
    }

    pub fn permission_requests(&self) -> Vec<PermissionRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl ClientSink for MockClient {
    fn session_update(
        &self,
        notification: SessionNotification,
    ) -> BoxFuture<'static, Result<(), BridgeError>> {
        let updates = self.updates.clone();
        Box::pin(async move {
            updates.lock().expect("updates lock").push(notification);
            Ok(())
        })
    }

    fn request_permission(
        &self,
        request: PermissionRequest,
    ) -> BoxFuture<'static, Result<RequestPermissionOutcome, BridgeError>> {
        let requests = self.requests.clone();
        let replies = self.replies.clone();
        Box::pin(async move {
            requests.lock().expect("requests lock").push(request);
            let reply = replies.lock().expect("replies lock").pop_front();
            match reply {
                Some(reply) => {
                    if !reply.delay.is_zero() {
                        tokio::time::sleep(reply.delay).await;
                    }
                    Ok(reply.outcome)
                }
                None => Ok(RequestPermissionOutcome::Cancelled),
            }
        })
    }
}

pub fn noop_handler() -> ControlHandler {
    Arc::new(|_, _| Box::pin(async { Ok(Value::Null) }))
}

/// Inert subprocess that stays alive for the duration of a test.
pub fn stub_agent() -> Arc<AgentProcess> {
    let spec = AgentLaunchSpec {
        program: PathBuf::from("sleep"),
        args: vec!["300".to_string()],
        env: Vec::new(),
        cwd: None,
    };
    let (process, _source) = AgentProcess::spawn(&spec, noop_handler()).expect("spawn stub agent");
    process
}

pub struct TestHarness {
    pub client: Arc<MockClient>,
    pub registry: Arc<SessionRegistry>,
    pub negotiator: Arc<PermissionNegotiator>,
    pub session: Arc<Session>,
    state_dir: tempfile::TempDir,
    stream_tx: mpsc::UnboundedSender<Result<Value, BridgeError>>,
}

/// One registered session wired to a mock client, with an idle stream.
pub async fn harness_with_mode(mode: PermissionMode) -> TestHarness {
    let client = MockClient::new();
    let registry = SessionRegistry::new();
    let negotiator = PermissionNegotiator::new(registry.clone(), client.clone());

    let (stream_tx, stream_rx) = mpsc::unbounded_channel();
    let router = MessageRouter::spawn(
        ChannelMessageSource::new(stream_rx),
        Box::new(|_| Box::pin(async { Ok(()) })),
    );

    let state_dir = tempfile::tempdir().expect("tempdir");
    let history =
        Arc::new(HistoryStore::new(state_dir.path().to_path_buf()).expect("history store"));
    let queue = NotificationQueue::new(client.clone());

    let session = Session::new(
        "sess_test".to_string(),
        PathBuf::from("/tmp"),
        stub_agent(),
        router,
        queue,
        history,
        mode,
    );
    registry.insert(session.clone()).await.expect("insert");

    TestHarness {
        client,
        registry,
        negotiator,
        session,
        state_dir,
        stream_tx,
    }
}
