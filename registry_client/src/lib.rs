//! Client for the resource registry's router REST API.
//!
//! The registry answers three questions for us: which machines host the
//! backends for a database namespace, which collect metrics are registered
//! under a namespace, and which namespaces exist below a given one. Every
//! answer arrives in a `{httpstatus, data}` envelope.
//!
//! This client is deliberately dumb: one GET per operation, no retries, no
//! caching. Policy lives in the layers above it.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

/// Errors talking to the registry.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("error while processing registry request: {}", source))]
    Transport { source: reqwest::Error },

    #[snafu(display("registry returned unexpected status {}", status))]
    BadStatus { status: u16 },

    #[snafu(display("could not decode registry response: {}", source))]
    Decode { source: serde_json::Error },
}

/// Convenience alias for this crate's fallible operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One collect metric registered for a namespace.
///
/// The registry carries more fields than we consume; only the ones the read
/// API needs are kept.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CollectMetric {
    /// Metric name prefix as registered.
    pub name: String,
    /// Collection interval, as the registry reports it.
    #[serde(default)]
    pub interval: String,
}

#[derive(Debug, Deserialize)]
struct MachineEnvelope {
    #[serde(rename = "httpstatus")]
    status: u16,
    #[serde(default)]
    data: Vec<Machine>,
}

#[derive(Debug, Deserialize)]
struct Machine {
    ip: String,
    #[serde(default)]
    #[allow(dead_code)]
    hostname: String,
}

#[derive(Debug, Deserialize)]
struct NamespaceEnvelope {
    #[serde(rename = "httpstatus")]
    status: u16,
    #[serde(default)]
    data: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CollectEnvelope {
    #[serde(rename = "httpstatus")]
    status: u16,
    #[serde(default)]
    data: Vec<CollectMetric>,
}

/// A stateless registry API client.
#[derive(Debug, Clone)]
pub struct Client {
    url: String,
    http: reqwest::Client,
}

impl Client {
    /// Creates a client for the registry at `url` (scheme and authority,
    /// e.g. `http://registry.example.com`).
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            url: url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Looks up the machines backing the database namespace `ns`.
    ///
    /// A registry answer that is anything other than a successful envelope
    /// yields an empty host list rather than an error: the resolution policy
    /// upstream treats "no machines here" as a signal to try the next
    /// candidate cluster.
    pub async fn resolve_backends(&self, ns: &str) -> Result<Vec<String>> {
        let response = self
            .http
            .get(format!("{}/api/v1/router/resource", self.url))
            .query(&[("ns", ns), ("type", "machine")])
            .send()
            .await
            .context(TransportSnafu)?;

        if !response.status().is_success() {
            return Ok(vec![]);
        }

        let body = response.bytes().await.context(TransportSnafu)?;
        let envelope: MachineEnvelope = serde_json::from_slice(&body).context(DecodeSnafu)?;
        if envelope.status != 200 {
            return Ok(vec![]);
        }
        Ok(envelope.data.into_iter().map(|m| m.ip).collect())
    }

    /// Lists the collect metrics registered for `ns`.
    ///
    /// The registry stores collect entries without the bus prefix, so a
    /// leading `collect.` is stripped from the queried namespace.
    pub async fn collect_allowlist(&self, ns: &str) -> Result<Vec<CollectMetric>> {
        let ns = ns.strip_prefix("collect.").unwrap_or(ns);
        let response = self
            .http
            .get(format!("{}/api/v1/router/resource", self.url))
            .query(&[("ns", ns), ("type", "collect")])
            .send()
            .await
            .context(TransportSnafu)?;

        let status = response.status();
        if !status.is_success() {
            return BadStatusSnafu {
                status: status.as_u16(),
            }
            .fail();
        }

        let body = response.bytes().await.context(TransportSnafu)?;
        let envelope: CollectEnvelope = serde_json::from_slice(&body).context(DecodeSnafu)?;
        if envelope.status != 200 {
            return BadStatusSnafu {
                status: envelope.status,
            }
            .fail();
        }
        Ok(envelope.data)
    }

    /// Lists the namespaces below `ns` (all namespaces when `ns` is empty).
    pub async fn list_namespaces(&self, ns: &str) -> Result<Vec<String>> {
        let response = self
            .http
            .get(format!("{}/api/v1/router/ns", self.url))
            .query(&[("ns", ns), ("format", "list")])
            .send()
            .await
            .context(TransportSnafu)?;

        let status = response.status();
        if !status.is_success() {
            return BadStatusSnafu {
                status: status.as_u16(),
            }
            .fail();
        }

        let body = response.bytes().await.context(TransportSnafu)?;
        let envelope: NamespaceEnvelope = serde_json::from_slice(&body).context(DecodeSnafu)?;
        if envelope.status != 200 {
            return BadStatusSnafu {
                status: envelope.status,
            }
            .fail();
        }
        Ok(envelope.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn machine_query(ns: &str) -> Matcher {
        Matcher::AllOf(vec![
            Matcher::UrlEncoded("ns".into(), ns.into()),
            Matcher::UrlEncoded("type".into(), "machine".into()),
        ])
    }

    #[tokio::test]
    async fn resolve_backends_collects_ips() {
        test_helpers::maybe_start_logging();

        let mock = mockito::mock("GET", "/api/v1/router/resource")
            .match_query(machine_query("api.db.monitor.loda"))
            .with_status(200)
            .with_body(
                r#"{"httpstatus": 200, "data": [
                    {"ip": "10.1.2.3", "hostname": "db-1"},
                    {"ip": "10.1.2.4", "hostname": "db-2"}
                ]}"#,
            )
            .create();

        let client = Client::new(mockito::server_url());
        let hosts = client.resolve_backends("api.db.monitor.loda").await.unwrap();
        assert_eq!(hosts, vec!["10.1.2.3".to_string(), "10.1.2.4".to_string()]);
        mock.assert();
    }

    #[tokio::test]
    async fn resolve_backends_maps_bad_status_to_empty() {
        let _mock = mockito::mock("GET", "/api/v1/router/resource")
            .match_query(machine_query("nope.db.monitor.loda"))
            .with_status(404)
            .create();

        let client = Client::new(mockito::server_url());
        let hosts = client
            .resolve_backends("nope.db.monitor.loda")
            .await
            .unwrap();
        assert!(hosts.is_empty());
    }

    #[tokio::test]
    async fn collect_allowlist_strips_bus_prefix() {
        let mock = mockito::mock("GET", "/api/v1/router/resource")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("ns".into(), "api.myservice".into()),
                Matcher::UrlEncoded("type".into(), "collect".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"httpstatus": 200, "data": [
                    {"name": "cpu.idle", "interval": "10"},
                    {"name": "PLUGIN.nginx", "interval": "60", "comment": "ignored"}
                ]}"#,
            )
            .create();

        let client = Client::new(mockito::server_url());
        let metrics = client.collect_allowlist("collect.api.myservice").await.unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].name, "cpu.idle");
        assert_eq!(metrics[1].name, "PLUGIN.nginx");
        mock.assert();
    }

    #[tokio::test]
    async fn list_namespaces_surfaces_bad_envelope_status() {
        let _mock = mockito::mock("GET", "/api/v1/router/ns")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("ns".into(), "db.monitor.loda".into()),
                Matcher::UrlEncoded("format".into(), "list".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"httpstatus": 500, "data": null}"#)
            .create();

        let client = Client::new(mockito::server_url());
        let err = client.list_namespaces("db.monitor.loda").await.unwrap_err();
        assert!(matches!(err, Error::BadStatus { status: 500 }));
    }
}
