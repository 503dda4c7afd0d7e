//! Memoization for expensive aggregate responses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use observability_deps::tracing::info;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long memoized responses live at most: everything is dropped on this
/// cadence, whatever its age.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// A small key → JSON response cache. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ResponseCache {
    entries: Arc<Mutex<HashMap<String, Value>>>,
}

impl ResponseCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    /// Stores `value` under `key`, replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.entries.lock().insert(key.into(), value);
    }

    /// Drops every entry.
    pub fn purge(&self) {
        self.entries.lock().clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts the background task clearing the cache every `every`, until
    /// `shutdown` is cancelled.
    pub fn spawn_purger(&self, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.purge();
                        info!("response cache purged");
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}
