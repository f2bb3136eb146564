//! Session message router.
//!
//! One background task continuously pulls from the session's message source
//! and splits the stream: "system, subtype = task notification" messages go
//! to an injected handler which is awaited before the next read, so
//! out-of-band events are processed strictly in emission order; everything
//! else is buffered for the turn loop's `next()`.

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use acp_bridge_error::BridgeError;

use crate::protocol::is_task_notification;

/// Pull side of the subprocess message stream. `next` yields `Ok(None)` on
/// a clean end-of-stream and `Err` on transport failure.
pub trait MessageSource: Send + 'static {
    fn next(&mut self) -> BoxFuture<'_, Result<Option<Value>, BridgeError>>;
}

/// Handler for out-of-band system events. Runs on the router's read task;
/// failures are logged and swallowed so a misbehaving handler can never
/// stop the main stream.
pub type SystemEventHandler =
    Box<dyn Fn(Value) -> BoxFuture<'static, Result<(), BridgeError>> + Send + Sync>;

enum RouterEvent {
    Content(Value),
    Failed(BridgeError),
}

pub struct MessageRouter {
    rx: mpsc::UnboundedReceiver<RouterEvent>,
    finished: bool,
    terminal: Option<BridgeError>,
}

impl MessageRouter {
    pub fn spawn<S: MessageSource>(mut source: S, handler: SystemEventHandler) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                match source.next().await {
                    Ok(Some(message)) => {
                        if is_task_notification(&message) {
                            if let Err(err) = handler(message).await {
                                tracing::warn!(
                                    error = %err,
                                    "task notification handler failed, continuing stream"
                                );
                            }
                        } else if tx.send(RouterEvent::Content(message)).is_err() {
                            // Consumer dropped the router, stop reading.
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = tx.send(RouterEvent::Failed(err));
                        break;
                    }
                }
            }
        });

        Self {
            rx,
            finished: false,
            terminal: None,
        }
    }

    /// Next turn-content message: the oldest buffered one immediately, or
    /// suspends until a message arrives or the stream ends. `Ok(None)`
    /// marks a finished stream; a latched transport failure rethrows on
    /// every call instead of hanging.
    pub async fn next(&mut self) -> Result<Option<Value>, BridgeError> {
        if let Some(err) = &self.terminal {
            return Err(err.clone());
        }
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(RouterEvent::Content(message)) => Ok(Some(message)),
            Some(RouterEvent::Failed(err)) => {
                self.terminal = Some(err.clone());
                Err(err)
            }
            None => {
                self.finished = true;
                Ok(None)
            }
        }
    }
}

/// Message source backed by a channel fed from the subprocess stdout pump.
pub struct ChannelMessageSource {
    rx: mpsc::UnboundedReceiver<Result<Value, BridgeError>>,
}

impl ChannelMessageSource {
    pub fn new(rx: mpsc::UnboundedReceiver<Result<Value, BridgeError>>) -> Self {
        Self { rx }
    }
}

impl MessageSource for ChannelMessageSource {
    fn next(&mut self) -> BoxFuture<'_, Result<Option<Value>, BridgeError>> {
        Box::pin(async move {
            match self.rx.recv().await {
                Some(Ok(message)) => Ok(Some(message)),
                Some(Err(err)) => Err(err),
                None => Ok(None),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct ScriptedSource {
        items: VecDeque<Result<Option<Value>, BridgeError>>,
    }

    impl ScriptedSource {
        fn new(items: Vec<Result<Option<Value>, BridgeError>>) -> Self {
            Self {
                items: items.into(),
            }
        }
    }

    impl MessageSource for ScriptedSource {
        fn next(&mut self) -> BoxFuture<'_, Result<Option<Value>, BridgeError>> {
            let item = self.items.pop_front().unwrap_or(Ok(None));
            Box::pin(async move {
                // Yield so the consumer can interleave with the read loop.
                tokio::task::yield_now().await;
                item
            })
        }
    }

    fn system_event(index: usize) -> Value {
        json!({"type": "system", "subtype": "task_notification", "index": index})
    }

    fn content(index: usize) -> Value {
        json!({"type": "assistant", "index": index})
    }

    fn recording_handler(log: Arc<Mutex<Vec<Value>>>) -> SystemEventHandler {
        Box::new(move |message| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().expect("lock").push(message);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn splits_interleaved_stream_preserving_both_orders() {
        let items = vec![
            Ok(Some(content(0))),
            Ok(Some(system_event(1))),
            Ok(Some(content(2))),
            Ok(Some(system_event(3))),
            Ok(Some(system_event(4))),
            Ok(Some(content(5))),
            Ok(None),
        ];
        let handled = Arc::new(Mutex::new(Vec::new()));
        let mut router =
            MessageRouter::spawn(ScriptedSource::new(items), recording_handler(handled.clone()));

        let mut seen = Vec::new();
        while let Some(message) = router.next().await.expect("no failure") {
            seen.push(message["index"].as_u64().expect("index"));
        }
        assert_eq!(seen, vec![0, 2, 5]);

        let handled = handled.lock().expect("lock");
        let handled_indices: Vec<u64> = handled
            .iter()
            .map(|message| message["index"].as_u64().expect("index"))
            .collect();
        assert_eq!(handled_indices, vec![1, 3, 4]);
        for message in handled.iter() {
            assert!(is_task_notification(message), "only system events handled");
        }
    }

    #[tokio::test]
    async fn handler_failure_does_not_stop_the_stream() {
        let items = vec![
            Ok(Some(system_event(0))),
            Ok(Some(content(1))),
            Ok(None),
        ];
        let handler: SystemEventHandler = Box::new(|_| {
            Box::pin(async {
                Err(BridgeError::StreamError {
                    message: "handler blew up".to_string(),
                })
            })
        });
        let mut router = MessageRouter::spawn(ScriptedSource::new(items), handler);

        let message = router.next().await.expect("stream survives");
        assert_eq!(message.expect("content delivered")["index"], 1);
        assert!(router.next().await.expect("clean end").is_none());
    }

    #[tokio::test]
    async fn terminal_error_is_latched_and_rethrown() {
        let items = vec![
            Ok(Some(content(0))),
            Err(BridgeError::StreamError {
                message: "transport died".to_string(),
            }),
        ];
        let handled = Arc::new(Mutex::new(Vec::new()));
        let mut router =
            MessageRouter::spawn(ScriptedSource::new(items), recording_handler(handled));

        assert!(router.next().await.expect("first message").is_some());
        assert!(matches!(
            router.next().await,
            Err(BridgeError::StreamError { .. })
        ));
        // Repeated calls keep rethrowing instead of hanging.
        for _ in 0..3 {
            let result = tokio::time::timeout(Duration::from_millis(100), router.next())
                .await
                .expect("must not hang");
            assert!(matches!(result, Err(BridgeError::StreamError { .. })));
        }
    }

    #[tokio::test]
    async fn finished_stream_keeps_returning_done() {
        let handled = Arc::new(Mutex::new(Vec::new()));
        let mut router = MessageRouter::spawn(
            ScriptedSource::new(vec![Ok(None)]),
            recording_handler(handled),
        );
        for _ in 0..3 {
            assert!(router.next().await.expect("done").is_none());
        }
    }

    #[tokio::test]
    async fn waiting_consumer_receives_later_message() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handled = Arc::new(Mutex::new(Vec::new()));
        let mut router =
            MessageRouter::spawn(ChannelMessageSource::new(rx), recording_handler(handled));

        let waiter = tokio::spawn(async move {
            let message = router.next().await.expect("ok");
            (router, message)
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(Ok(content(7))).expect("send");

        let (_router, message) = waiter.await.expect("join");
        assert_eq!(message.expect("delivered")["index"], 7);
    }
}
