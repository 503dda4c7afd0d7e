//! The read side of the router: planning backend queries, shaping their
//! results and serving the HTTP API surface.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::sync::Arc;

use hyper::StatusCode;
use influxdb_client::InfluxClient;
use registry_client::Client as RegistryClient;
use router::RouteCache;

pub mod backend;
pub mod cache;
pub mod http;
pub mod linkstats;
pub mod planner;
pub mod response;

pub use cache::ResponseCache;
pub use http::HttpDelegate;

/// A data-center grouping of hosts, from the `[[idc]]` config sections.
#[derive(Debug, Clone, Default)]
pub struct IdcGroup {
    /// IDC name.
    pub name: String,
    /// Hosts belonging to this IDC.
    pub hosts: Vec<String>,
}

/// Static knobs of the API surface, from configuration.
#[derive(Debug, Clone, Default)]
pub struct ApiConfig {
    /// Bus topic prefix, including its trailing dot (e.g. `collect.`).
    /// Used to recognize namespaces inside raw queries.
    pub topic_prefix: String,
    /// Whether `/usage` is served at all.
    pub usage_enabled: bool,
    /// Namespaces `/linkstats` builds its graph over.
    pub linkstats_namespaces: Vec<String>,
    /// IDC definitions for `/linkstats`.
    pub idc_groups: Vec<IdcGroup>,
    /// Measurements ending in this suffix are hidden from `/series`.
    /// Empty disables the filter.
    pub hidden_metric_suffix: String,
    /// Namespace `/sa` computes availability over.
    pub default_api_namespace: String,
}

/// Everything a handler needs, constructed once at startup.
#[derive(Debug)]
pub struct ApiContext {
    /// The namespace route cache shared with the write path.
    pub routes: RouteCache,
    /// Backend client shared with the write path.
    pub influx: Arc<InfluxClient>,
    /// Registry client for allowlist lookups.
    pub registry: RegistryClient,
    /// Memoization for `/query2` and `/sa`.
    pub cache: ResponseCache,
    /// Static configuration.
    pub config: ApiConfig,
}

/// Handler failures, mapped onto HTTP statuses at the dispatch layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or malformed request parameters, or an unroutable
    /// namespace.
    #[error("{0}")]
    BadRequest(String),

    /// The query tried to destroy data through the proxy.
    #[error("don't support drop")]
    Refused,

    /// The endpoint is switched off in configuration.
    #[error("{0}")]
    Disabled(String),

    /// Backend or registry trouble.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// The HTTP status this error is reported with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Refused => StatusCode::BAD_REQUEST,
            Self::Disabled(_) => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
