//! Read side of the backend client: `/query` against the primary backend.

use std::collections::BTreeMap;

use bytes::Bytes;
use data_types::Scalar;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::{BackendStatusSnafu, DecodeSnafu, InfluxClient, NoBackendSnafu, Result, TransportSnafu};

/// Decoded `/query` response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    /// One entry per statement in the query.
    #[serde(default)]
    pub results: Vec<QueryResult>,
}

/// The outcome of a single statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Matched series, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub series: Vec<Series>,
    /// Statement-level error reported by the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One series of a statement result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// Measurement name.
    #[serde(default)]
    pub name: String,
    /// Group-by tags of this series.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Column names, `time` first.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Sample rows; cells are dynamically typed.
    #[serde(default)]
    pub values: Vec<Vec<Scalar>>,
}

impl InfluxClient {
    /// Runs a query against the primary backend of `hosts` and decodes the
    /// response body.
    pub async fn query(&self, hosts: &[String], params: &[(&str, &str)]) -> Result<ResultSet> {
        let (status, body, host) = self.query_bytes(hosts, params).await?;
        if status / 100 != 2 {
            return BackendStatusSnafu { host, status }.fail();
        }
        serde_json::from_slice(&body).context(DecodeSnafu)
    }

    /// Runs a query and returns the backend's status code and body
    /// verbatim, for handlers that proxy the backend response through.
    pub async fn query_raw(
        &self,
        hosts: &[String],
        params: &[(&str, &str)],
    ) -> Result<(u16, Bytes)> {
        let (status, body, _) = self.query_bytes(hosts, params).await?;
        Ok((status, body))
    }

    async fn query_bytes(
        &self,
        hosts: &[String],
        params: &[(&str, &str)],
    ) -> Result<(u16, Bytes, String)> {
        let host = hosts.first().ok_or_else(|| {
            let database = params
                .iter()
                .find(|(k, _)| *k == "db")
                .map(|(_, v)| v.to_string())
                .unwrap_or_default();
            NoBackendSnafu { database }.build()
        })?;

        let url = self.v1_url(host, "/query");
        let response = self
            .http
            .get(&url)
            .query(params)
            .send()
            .await
            .context(TransportSnafu { host })?;
        let status = response.status().as_u16();
        let body = response.bytes().await.context(TransportSnafu { host })?;
        Ok((status, body, host.clone()))
    }
}
