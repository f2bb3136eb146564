//! Notification queue between the turn loop and the client sink.
//!
//! `enqueue` returns immediately so streaming deltas never stall the turn
//! loop on transport round-trips; `flush` and `send` are the ordering
//! points. A single worker task performs the sends in enqueue order, so a
//! flush marker reaching the worker proves every earlier enqueue has
//! settled.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::acp::SessionNotification;
use crate::client::ClientSink;

enum QueueOp {
    Update(SessionNotification),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct NotificationQueue {
    client: Arc<dyn ClientSink>,
    tx: mpsc::UnboundedSender<QueueOp>,
}

impl NotificationQueue {
    pub fn new(client: Arc<dyn ClientSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(client.clone(), rx));
        Self { client, tx }
    }

    /// Fire the send and return. Failures are logged, never propagated: a
    /// dropped UI update is recoverable, a stalled turn loop is not.
    pub fn enqueue(&self, notification: SessionNotification) {
        if self.tx.send(QueueOp::Update(notification)).is_err() {
            tracing::warn!("notification queue worker is gone, dropping update");
        }
    }

    /// Resolves once every `enqueue` issued before this call has settled
    /// (success or failure). With nothing pending it resolves immediately.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(QueueOp::Flush(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Ordered send: delivered only after every previously enqueued update.
    /// Used for updates an editor must never observe ahead of streamed
    /// content (mode changes, turn-end bookkeeping).
    pub async fn send(&self, notification: SessionNotification) {
        self.flush().await;
        if let Err(err) = self.client.session_update(notification).await {
            tracing::warn!(error = %err, "failed to send session notification");
        }
    }
}

async fn run_worker(client: Arc<dyn ClientSink>, mut rx: mpsc::UnboundedReceiver<QueueOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            QueueOp::Update(notification) => {
                if let Err(err) = client.session_update(notification).await {
                    tracing::warn!(error = %err, "failed to deliver session notification");
                }
            }
            QueueOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acp::{ContentBlock, SessionUpdate};
    use crate::client::ClientSink;
    use acp_bridge_error::BridgeError;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::acp::{PermissionRequest, RequestPermissionOutcome};

    struct RecordingSink {
        delivered: Arc<Mutex<Vec<String>>>,
        in_flight_delay: Duration,
        failures: Arc<AtomicUsize>,
        fail_all: bool,
    }

    impl RecordingSink {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delivered: Arc::new(Mutex::new(Vec::new())),
                in_flight_delay: delay,
                failures: Arc::new(AtomicUsize::new(0)),
                fail_all: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                delivered: Arc::new(Mutex::new(Vec::new())),
                in_flight_delay: Duration::ZERO,
                failures: Arc::new(AtomicUsize::new(0)),
                fail_all: true,
            })
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().expect("lock").clone()
        }
    }

    impl ClientSink for RecordingSink {
        fn session_update(
            &self,
            notification: SessionNotification,
        ) -> BoxFuture<'static, Result<(), BridgeError>> {
            let text = match &notification.update {
                SessionUpdate::AgentMessageChunk {
                    content: ContentBlock::Text { text },
                } => text.clone(),
                other => format!("{other:?}"),
            };
            let delay = self.in_flight_delay;
            let fail = self.fail_all;
            let delivered = self.delivered.clone();
            let failures = self.failures.clone();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                if fail {
                    failures.fetch_add(1, Ordering::SeqCst);
                    return Err(BridgeError::StreamError {
                        message: "sink down".to_string(),
                    });
                }
                delivered.lock().expect("lock").push(text);
                Ok(())
            })
        }

        fn request_permission(
            &self,
            _request: PermissionRequest,
        ) -> BoxFuture<'static, Result<RequestPermissionOutcome, BridgeError>> {
            Box::pin(async { Ok(RequestPermissionOutcome::Cancelled) })
        }
    }

    fn chunk(text: &str) -> SessionNotification {
        SessionNotification::new(
            "sess_1",
            SessionUpdate::AgentMessageChunk {
                content: ContentBlock::text(text),
            },
        )
    }

    #[tokio::test]
    async fn flush_waits_for_all_prior_enqueues() {
        let sink = RecordingSink::new(Duration::from_millis(5));
        let queue = NotificationQueue::new(sink.clone());

        for i in 0..10 {
            queue.enqueue(chunk(&format!("m{i}")));
        }
        queue.flush().await;

        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 10);
        assert_eq!(delivered[0], "m0");
        assert_eq!(delivered[9], "m9");
    }

    #[tokio::test]
    async fn flush_with_nothing_pending_resolves_immediately() {
        let sink = RecordingSink::new(Duration::ZERO);
        let queue = NotificationQueue::new(sink.clone());
        tokio::time::timeout(Duration::from_secs(1), queue.flush())
            .await
            .expect("flush must not deadlock");
    }

    #[tokio::test]
    async fn send_is_ordered_after_enqueued_updates() {
        let sink = RecordingSink::new(Duration::from_millis(3));
        let queue = NotificationQueue::new(sink.clone());

        queue.enqueue(chunk("first"));
        queue.enqueue(chunk("second"));
        queue.send(chunk("last")).await;

        assert_eq!(sink.delivered(), vec!["first", "second", "last"]);
    }

    #[tokio::test]
    async fn enqueue_failures_are_swallowed() {
        let sink = RecordingSink::failing();
        let queue = NotificationQueue::new(sink.clone());

        queue.enqueue(chunk("doomed"));
        queue.flush().await;

        assert_eq!(sink.failures.load(Ordering::SeqCst), 1);
        assert!(sink.delivered().is_empty());
    }
}
