//! Cancellation signal shared between a session's turn, its pending
//! permission prompts, and the subprocess control layer.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal has fired. Latched: resolves immediately if
    /// it already fired.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // All senders gone without firing: never resolves.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Signal that fires when either input fires.
    pub fn merged(left: &CancelSignal, right: &CancelSignal) -> CancelSignal {
        let merged = CancelSignal::new();
        let out = merged.clone();
        let left = left.clone();
        let right = right.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = left.cancelled() => {}
                _ = right.cancelled() => {}
            }
            out.cancel();
        });
        merged
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fires_once_and_stays_latched() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        signal.cancel();
        assert!(signal.is_cancelled());
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("already fired");
    }

    #[tokio::test]
    async fn merged_fires_on_either_input() {
        let left = CancelSignal::new();
        let right = CancelSignal::new();
        let merged = CancelSignal::merged(&left, &right);
        right.cancel();
        tokio::time::timeout(Duration::from_millis(100), merged.cancelled())
            .await
            .expect("merged fires");
        assert!(!left.is_cancelled());
    }
}
