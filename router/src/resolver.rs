//! Namespace to backend resolution.
//!
//! A namespace like `collect.api.myservice` does not name its storage
//! cluster directly. The second-to-last label (`api` here) selects a
//! database namespace under the configured root, with two fallbacks: the
//! label may be an alias recorded on a database namespace (aliases are
//! `||`-separated in its first label), and failing everything the default
//! cluster takes the data.

use observability_deps::tracing::warn;
use registry_client::Client as RegistryClient;

/// Resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The namespace has too few labels to carry a cluster label.
    #[error("namespace {ns} is too short to resolve")]
    MalformedNamespace {
        /// The offending namespace.
        ns: String,
    },

    /// The registry could not answer.
    #[error("registry lookup failed: {0}")]
    Registry(#[from] registry_client::Error),

    /// Every candidate cluster came back empty.
    #[error("{ns} has no influxdb route config")]
    Unresolvable {
        /// The namespace that could not be resolved.
        ns: String,
    },
}

/// Convenience alias for this module's fallible operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Resolves namespaces against the registry.
#[derive(Debug, Clone)]
pub struct Resolver {
    registry: RegistryClient,
    /// Root under which database namespaces live, e.g. `db.monitor.loda`.
    db_ns_root: String,
    /// Cluster label used when nothing else matches, e.g. `common`.
    default_cluster: String,
}

impl Resolver {
    /// Creates a resolver.
    pub fn new(
        registry: RegistryClient,
        db_ns_root: impl Into<String>,
        default_cluster: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            db_ns_root: db_ns_root.into(),
            default_cluster: default_cluster.into(),
        }
    }

    /// The registry client this resolver queries.
    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }

    /// Resolves `ns` to its backend hosts.
    ///
    /// Tried in order: the cluster named by the namespace's cluster label,
    /// then any database namespace carrying that label as an alias, then
    /// the default cluster. An empty answer from all three is
    /// [`Error::Unresolvable`].
    pub async fn resolve(&self, ns: &str) -> Result<Vec<String>> {
        let label = cluster_label(ns).ok_or_else(|| Error::MalformedNamespace {
            ns: ns.to_string(),
        })?;

        let hosts = self
            .registry
            .resolve_backends(&format!("{label}.{}", self.db_ns_root))
            .await?;
        if !hosts.is_empty() {
            return Ok(hosts);
        }

        // the label may be an alias on one of the known database namespaces
        match self.registry.list_namespaces(&self.db_ns_root).await {
            Ok(db_namespaces) => {
                if let Some(alias) = alias_for(label, &db_namespaces) {
                    let hosts = self
                        .registry
                        .resolve_backends(&format!("{alias}.{}", self.db_ns_root))
                        .await?;
                    if !hosts.is_empty() {
                        return Ok(hosts);
                    }
                }
            }
            Err(e) => warn!(ns, error=%e, "listing database namespaces failed"),
        }

        let hosts = self
            .registry
            .resolve_backends(&format!("{}.{}", self.default_cluster, self.db_ns_root))
            .await?;
        if !hosts.is_empty() {
            return Ok(hosts);
        }

        Err(Error::Unresolvable { ns: ns.to_string() })
    }
}

/// The second-to-last dotted label of `ns`, or `None` when there is no
/// such label.
fn cluster_label(ns: &str) -> Option<&str> {
    let labels: Vec<&str> = ns.split('.').collect();
    if labels.len() < 2 {
        return None;
    }
    Some(labels[labels.len() - 2])
}

/// Finds the database namespace whose first label carries `label` as one
/// of its `||`-separated aliases, returning that first label verbatim.
fn alias_for<'a>(label: &str, db_namespaces: &'a [String]) -> Option<&'a str> {
    for db_ns in db_namespaces {
        let first = db_ns.split('.').next().unwrap_or_default();
        if first.split("||").any(|alias| alias == label) {
            return Some(first);
        }
    }
    None
}
