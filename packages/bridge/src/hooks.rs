//! Hook-callback registry.
//!
//! Callbacks the subprocess can invoke back over the control channel
//! (`hook_callback` requests), registered per agent instance and swept by a
//! background eviction task owned by this registry — dropped together with
//! the owning session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::task::JoinHandle;

use acp_bridge_error::BridgeError;

pub const DEFAULT_HOOK_TTL: Duration = Duration::from_secs(30 * 60);
const SWEEP_INTERVAL_DIVISOR: u32 = 4;

pub type HookCallback =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BridgeError>> + Send + Sync>;

struct HookEntry {
    callback: HookCallback,
    last_used: Instant,
}

#[derive(Default)]
struct RegistryInner {
    entries: Mutex<HashMap<String, HookEntry>>,
}

pub struct HookCallbackRegistry {
    inner: Arc<RegistryInner>,
    sweeper: JoinHandle<()>,
}

impl HookCallbackRegistry {
    pub fn new(ttl: Duration) -> Self {
        let inner = Arc::new(RegistryInner::default());
        let sweep_target = inner.clone();
        let interval = (ttl / SWEEP_INTERVAL_DIVISOR).max(Duration::from_millis(10));
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut entries = sweep_target.entries.lock().expect("entries lock");
                let before = entries.len();
                entries.retain(|_, entry| now.duration_since(entry.last_used) < ttl);
                let evicted = before - entries.len();
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted stale hook callbacks");
                }
            }
        });
        Self { inner, sweeper }
    }

    pub fn register(&self, callback_id: impl Into<String>, callback: HookCallback) {
        self.inner.entries.lock().expect("entries lock").insert(
            callback_id.into(),
            HookEntry {
                callback,
                last_used: Instant::now(),
            },
        );
    }

    /// Look up a callback, refreshing its eviction clock.
    pub fn get(&self, callback_id: &str) -> Option<HookCallback> {
        let mut entries = self.inner.entries.lock().expect("entries lock");
        let entry = entries.get_mut(callback_id)?;
        entry.last_used = Instant::now();
        Some(entry.callback.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().expect("entries lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for HookCallbackRegistry {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}
