//! The refreshable namespace → route cache.
//!
//! Reads are lock-cheap; a miss resolves synchronously (no lock held during
//! the registry I/O) and stores the answer. A background refresher
//! re-resolves every known namespace on a timer and serializes purge
//! requests with those ticks, so the write adapter can invalidate a single
//! namespace without ever touching the map itself: it only holds the send
//! half of the purge channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use data_types::Route;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::resolver::{Resolver, Result};

/// Floor for the refresh interval, however small the configured value is.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Capacity of the purge channel. When a refresh is in progress, purge
/// requests queue here until the refresher gets back to the select loop.
const PURGE_CHANNEL_CAPACITY: usize = 64;

/// Thread-safe namespace → backend map with scheduled refresh and targeted
/// purge. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RouteCache {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    routes: RwLock<HashMap<String, Vec<String>>>,
    resolver: Resolver,
    /// Prefix the bus topics carry in front of registry namespaces,
    /// including its trailing dot (e.g. `collect.`).
    topic_prefix: String,
    purge_tx: mpsc::Sender<String>,
}

impl RouteCache {
    /// Creates an empty cache.
    ///
    /// Also returns the receive half of the purge channel; hand it to
    /// [`RouteCache::run_refresher`] together with the refresh interval.
    pub fn new(
        resolver: Resolver,
        topic_prefix: impl Into<String>,
    ) -> (Self, mpsc::Receiver<String>) {
        let (purge_tx, purge_rx) = mpsc::channel(PURGE_CHANNEL_CAPACITY);
        (
            Self {
                inner: Arc::new(Inner {
                    routes: RwLock::new(HashMap::new()),
                    resolver,
                    topic_prefix: topic_prefix.into(),
                    purge_tx,
                }),
            },
            purge_rx,
        )
    }

    /// A send handle of the purge channel, for components that need to
    /// invalidate a route when a backend stops answering.
    pub fn purge_handle(&self) -> mpsc::Sender<String> {
        self.inner.purge_tx.clone()
    }

    /// Returns the route for `ns`, resolving and caching it on a miss.
    pub async fn get(&self, ns: &str) -> Result<Route> {
        if let Some(backends) = self.inner.routes.read().get(ns) {
            return Ok(Route::new(ns, backends.clone()));
        }

        let backends = self.inner.resolver.resolve(ns).await?;
        self.inner
            .routes
            .write()
            .insert(ns.to_string(), backends.clone());
        Ok(Route::new(ns, backends))
    }

    /// Number of currently cached routes.
    pub fn len(&self) -> usize {
        self.inner.routes.read().len()
    }

    /// True if nothing is cached yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the refresh loop until `shutdown` is cancelled: a full refresh
    /// every `refresh_interval` (floored at one minute), purge requests
    /// processed in between.
    pub async fn run_refresher(
        self,
        mut purge_rx: mpsc::Receiver<String>,
        refresh_interval: Duration,
        shutdown: CancellationToken,
    ) {
        let period = refresh_interval.max(MIN_REFRESH_INTERVAL);
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        info!(period_secs = period.as_secs(), "route refresher started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh_all().await,
                Some(ns) = purge_rx.recv() => self.purge(&ns),
                _ = shutdown.cancelled() => break,
            }
        }
        info!("route refresher stopped");
    }

    fn purge(&self, ns: &str) {
        let removed = self.inner.routes.write().remove(ns).is_some();
        info!(ns, removed, "purged route");
    }

    /// Re-resolves every namespace the registry knows. A failed resolution
    /// leaves the previous entry in place; readers only ever observe
    /// complete routes.
    async fn refresh_all(&self) {
        let namespaces = match self.inner.resolver.registry().list_namespaces("").await {
            Ok(namespaces) => namespaces,
            Err(e) => {
                warn!(error=%e, "listing namespaces for route refresh failed");
                return;
            }
        };

        for ns in namespaces {
            let full = format!("{}{ns}", self.inner.topic_prefix);
            match self.inner.resolver.resolve(&full).await {
                Ok(backends) => {
                    self.inner.routes.write().insert(full, backends);
                }
                Err(e) => warn!(ns=%full, error=%e, "route refresh failed, keeping old entry"),
            }
        }

        debug!(routes = self.len(), "route cache refreshed");
    }
}
