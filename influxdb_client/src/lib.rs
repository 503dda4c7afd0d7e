//! Client for the time series backends.
//!
//! The write path speaks two backend generations: the v1 HTTP API
//! (`/write`, `/query`) and the v2 HTTP API (`/api/v2/write`,
//! `/api/v2/buckets`, token authenticated). Databases start out as v1;
//! when a v1 write fails over to v2 and succeeds, the database is
//! remembered as v2 and later writes skip v1 entirely.
//!
//! Writes fan out to every backend of a route: replicas run as parallel
//! tasks, the primary runs inline and its outcome is the outcome of the
//! write. Every backend task first takes a slot from the [`WriteGate`], so
//! total in-flight writes stay bounded process-wide.
//!
//! A batch addressed at a database the backend does not know triggers lazy
//! provisioning (database + retention policy, or bucket) followed by a
//! retry signal to the caller.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use snafu::Snafu;
use tokio::sync::mpsc;

mod addr;
mod gate;
mod provision;
pub mod query;
mod write;

pub use addr::intranet_ip;
pub use gate::WriteGate;
pub use query::{QueryResult, ResultSet, Series};

/// Client timeout for all v2 API calls.
const V2_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised by backend operations.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("no backend configured for {}", database))]
    NoBackend { database: String },

    #[snafu(display("error talking to backend {}: {}", host, source))]
    Transport { host: String, source: reqwest::Error },

    #[snafu(display("backend {} returned status {}", host, status))]
    BackendStatus { host: String, status: u16 },

    #[snafu(display("could not decode backend response: {}", source))]
    Decode { source: serde_json::Error },

    #[snafu(display("provisioning {} on {} failed: {}", database, host, detail))]
    ProvisioningFailed {
        host: String,
        database: String,
        detail: String,
    },

    #[snafu(display("database {} was just provisioned, the batch must be retried", database))]
    RetryRequired { database: String },
}

/// Convenience alias for this crate's fallible operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Static backend connection parameters, straight from configuration.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    /// Port of the v1 HTTP API on every backend host.
    pub v1_port: u16,
    /// Port of the v2 HTTP API on every backend host.
    pub v2_port: u16,
    /// v2 organisation, used as both the `org` write parameter and the
    /// bucket `orgID`.
    pub org: String,
    /// v2 authentication token.
    pub token: String,
    /// A host that only speaks the v2 API; writes to it never try v1.
    pub v2_only_host: Option<String>,
}

/// The backend client. Cheap to share behind an [`Arc`]; the write fan-out
/// requires it.
#[derive(Debug)]
pub struct InfluxClient {
    http: reqwest::Client,
    http_v2: reqwest::Client,
    config: BackendConfig,
    gate: WriteGate,
    /// Databases whose last failover write succeeded via the v2 API.
    v2_databases: RwLock<HashSet<String>>,
    /// Send half of the route cache's purge channel.
    purge_tx: mpsc::Sender<String>,
    /// Batches dropped because of a backend status outside the handled set.
    abandoned_batches: AtomicU64,
}

impl InfluxClient {
    /// Creates a client.
    ///
    /// `gate` is the process-wide write gate; `purge_tx` is the send handle
    /// of the route cache's purge channel, used to invalidate a namespace's
    /// route when a backend stops answering.
    pub fn new(
        config: BackendConfig,
        gate: WriteGate,
        purge_tx: mpsc::Sender<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            http: reqwest::Client::new(),
            http_v2: reqwest::Client::builder()
                .timeout(V2_TIMEOUT)
                .build()
                .expect("building the v2 http client"),
            config,
            gate,
            v2_databases: RwLock::new(HashSet::new()),
            purge_tx,
            abandoned_batches: AtomicU64::new(0),
        })
    }

    /// True if writes for `database` currently go straight to the v2 API.
    pub fn knows_v2(&self, database: &str) -> bool {
        self.v2_databases.read().contains(database)
    }

    /// Number of batches abandoned on unexpected backend statuses since
    /// process start.
    pub fn abandoned_batches(&self) -> u64 {
        self.abandoned_batches.load(Ordering::Relaxed)
    }

    fn v1_url(&self, host: &str, path: &str) -> String {
        format!("http://{}:{}{}", intranet_ip(host), self.config.v1_port, path)
    }

    fn v2_url(&self, host: &str, path: &str) -> String {
        format!("http://{}:{}{}", intranet_ip(host), self.config.v2_port, path)
    }

    async fn request_purge(&self, database: &str) {
        use observability_deps::tracing::warn;
        if self.purge_tx.send(database.to_string()).await.is_err() {
            warn!(database, "route purge channel closed, purge request dropped");
        }
    }
}
