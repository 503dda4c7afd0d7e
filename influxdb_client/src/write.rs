//! Write side of the backend client: fan-out, version dispatch, failover.

use bytes::Bytes;
use data_types::{PointBatch, Route};
use observability_deps::tracing::{debug, info, warn};
use reqwest::header::AUTHORIZATION;
use snafu::ResultExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::{
    BackendStatusSnafu, Error, InfluxClient, NoBackendSnafu, Result, RetryRequiredSnafu,
    TransportSnafu,
};

impl InfluxClient {
    /// Writes `batch` to every backend of `route`.
    ///
    /// The batch is encoded once. Replicas (every backend after the primary)
    /// are written by parallel tasks whose failures are logged but do not
    /// fail the batch; the primary is written inline and its outcome is
    /// returned. Each backend task holds one gate slot for its duration.
    pub async fn write(self: &Arc<Self>, route: &Route, batch: &PointBatch) -> Result<()> {
        let database = batch.database.clone();
        let primary = match route.primary() {
            Some(primary) => primary.to_string(),
            None => return NoBackendSnafu { database }.fail(),
        };

        let data = Bytes::from(line_protocol::encode_batch_lenient(&batch.points));
        let point_count = batch.points.len();

        for replica in route.replicas() {
            let permit = self.gate.acquire().await;
            let this = Arc::clone(self);
            let replica = replica.clone();
            let database = database.clone();
            let data = data.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = this.write_one(&replica, &database, data, point_count).await {
                    warn!(replica=%replica, database=%database, error=%e, "replica write failed");
                }
            });
        }

        let _permit = self.gate.acquire().await;
        self.write_one(&primary, &database, data, point_count).await
    }

    /// Writes one encoded batch to one backend, dispatching on the backend
    /// generation known for `database`.
    ///
    /// An unknown database is tried via v1 first; when v1 is unreachable or
    /// answers with a server error, the write fails over to v2 and a
    /// success there promotes the database to v2 for good.
    async fn write_one(
        &self,
        host: &str,
        database: &str,
        data: Bytes,
        point_count: usize,
    ) -> Result<()> {
        if self.config.v2_only_host.as_deref() == Some(host) || self.knows_v2(database) {
            return self.write_v2(host, database, data, point_count, false).await;
        }

        match self.write_v1(host, database, data.clone(), point_count).await {
            Err(Error::Transport { .. }) => {
                // the route may have changed under us, drop it from the cache
                self.request_purge(database).await;
                self.write_v2(host, database, data, point_count, true).await
            }
            Err(Error::BackendStatus { status, .. }) if status >= 500 => {
                self.write_v2(host, database, data, point_count, true).await
            }
            other => other,
        }
    }

    async fn write_v1(
        &self,
        host: &str,
        database: &str,
        data: Bytes,
        point_count: usize,
    ) -> Result<()> {
        let url = self.v1_url(host, "/write");
        let response = self
            .http
            .post(&url)
            .query(&[("db", database), ("precision", "ns")])
            .body(data)
            .send()
            .await
            .context(TransportSnafu { host })?;

        let status = response.status().as_u16();
        match status {
            204 => {
                info!(status, host, point_count, "points written");
                Ok(())
            }
            500..=599 => BackendStatusSnafu { host, status }.fail(),
            200 | 404 => {
                let body = response.text().await.context(TransportSnafu { host })?;
                if body.contains("database not found") {
                    self.provision(host, database, false).await;
                    RetryRequiredSnafu { database }.fail()
                } else {
                    self.abandon(host, status, &body);
                    Ok(())
                }
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                self.abandon(host, status, &body);
                Ok(())
            }
        }
    }

    async fn write_v2(
        &self,
        host: &str,
        database: &str,
        data: Bytes,
        point_count: usize,
        record: bool,
    ) -> Result<()> {
        let url = self.v2_url(host, "/api/v2/write");
        let response = match self
            .http_v2
            .post(&url)
            .query(&[
                ("bucket", database),
                ("precision", "ns"),
                ("org", self.config.org.as_str()),
            ])
            .header(AUTHORIZATION, format!("Token {}", self.config.token))
            .body(data)
            .send()
            .await
        {
            Ok(response) => response,
            Err(source) => {
                // the route may have changed under us, and our belief that
                // this database speaks v2 may be stale too
                self.request_purge(database).await;
                self.v2_databases.write().remove(database);
                return Err(Error::Transport {
                    host: host.to_string(),
                    source,
                });
            }
        };

        let status = response.status().as_u16();
        match status {
            204 => {
                if record {
                    self.v2_databases.write().insert(database.to_string());
                    debug!(database, "database promoted to the v2 api");
                }
                info!(status, host, point_count, "points written");
                Ok(())
            }
            500..=599 => BackendStatusSnafu { host, status }.fail(),
            200 | 404 => {
                let body = response.text().await.context(TransportSnafu { host })?;
                if body.contains("not found") {
                    self.provision(host, database, true).await;
                    RetryRequiredSnafu { database }.fail()
                } else {
                    self.abandon(host, status, &body);
                    Ok(())
                }
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                self.abandon(host, status, &body);
                Ok(())
            }
        }
    }

    /// Provisions the missing database, logging rather than propagating a
    /// provisioning failure: either way the caller reports the batch as
    /// to-be-retried, and a failed provisioning will simply run again on
    /// the redelivery.
    async fn provision(&self, host: &str, database: &str, v2: bool) {
        let outcome = if v2 {
            self.provision_v2(host, database).await
        } else {
            self.provision_v1(host, database).await
        };
        if let Err(e) = outcome {
            warn!(host, database, error=%e, "provisioning failed");
        }
    }

    fn abandon(&self, host: &str, status: u16, body: &str) {
        self.abandoned_batches.fetch_add(1, Ordering::Relaxed);
        warn!(host, status, body, "abandoning batch, unexpected backend status");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use data_types::{FieldValue, Point};
    use mockito::Matcher;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{BackendConfig, WriteGate};

    /// A port nothing listens on, for provoking transport errors.
    const CLOSED_PORT: u16 = 1;

    fn batch(database: &str) -> PointBatch {
        PointBatch {
            precision: "s".into(),
            database: database.into(),
            retention_policy: String::new(),
            points: vec![Point {
                measurement: "cpu.idle".into(),
                timestamp: 1_700_000_000,
                tags: BTreeMap::from([("host".to_string(), "h1".to_string())]),
                fields: BTreeMap::from([("value".to_string(), FieldValue::Float(0.87))]),
            }],
        }
    }

    fn client_for(
        v1_port: u16,
        v2_port: u16,
    ) -> (Arc<InfluxClient>, mpsc::Receiver<String>) {
        let (purge_tx, purge_rx) = mpsc::channel(16);
        let client = InfluxClient::new(
            BackendConfig {
                v1_port,
                v2_port,
                org: "loda".into(),
                token: "secret".into(),
                v2_only_host: None,
            },
            WriteGate::new(16),
            purge_tx,
        );
        (client, purge_rx)
    }

    fn mockito_port() -> u16 {
        mockito::server_address().port()
    }

    #[tokio::test]
    async fn successful_v1_write_provisions_nothing() {
        test_helpers::maybe_start_logging();

        let write = mockito::mock("POST", "/write")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("db".into(), "collect.api.myservice".into()),
                Matcher::UrlEncoded("precision".into(), "ns".into()),
            ]))
            .with_status(204)
            .create();
        let provision = mockito::mock("GET", "/query")
            .match_query(Matcher::UrlEncoded(
                "q".into(),
                r#"create database "collect.api.myservice""#.into(),
            ))
            .expect(0)
            .create();

        let (client, _purge_rx) = client_for(mockito_port(), CLOSED_PORT);
        let route = Route::new("collect.api.myservice", vec!["127.0.0.1".into()]);
        client.write(&route, &batch("collect.api.myservice")).await.unwrap();

        write.assert();
        provision.assert();
    }

    #[tokio::test]
    async fn missing_database_is_provisioned_once_then_retried() {
        test_helpers::maybe_start_logging();

        let _write = mockito::mock("POST", "/write")
            .match_query(Matcher::UrlEncoded(
                "db".into(),
                "collect.a.api.loda".into(),
            ))
            .with_status(404)
            .with_body(r#"{"error":"database not found"}"#)
            .create();
        let create_db = mockito::mock("GET", "/query")
            .match_query(Matcher::UrlEncoded(
                "q".into(),
                r#"create database "collect.a.api.loda""#.into(),
            ))
            .with_status(200)
            .with_body(r#"{"results":[]}"#)
            .expect(1)
            .create();
        let create_rp = mockito::mock("GET", "/query")
            .match_query(Matcher::UrlEncoded(
                "q".into(),
                r#"CREATE RETENTION POLICY loda ON "collect.a.api.loda" DURATION 500d REPLICATION 1 DEFAULT"#
                    .into(),
            ))
            .with_status(200)
            .with_body(r#"{"results":[]}"#)
            .expect(1)
            .create();

        let (client, _purge_rx) = client_for(mockito_port(), CLOSED_PORT);
        let route = Route::new("collect.a.api.loda", vec!["127.0.0.1".into()]);
        let err = client
            .write(&route, &batch("collect.a.api.loda"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetryRequired { .. }), "got {err}");

        create_db.assert();
        create_rp.assert();
    }

    #[tokio::test]
    async fn v1_transport_failure_promotes_database_to_v2() {
        test_helpers::maybe_start_logging();

        let write_v2 = mockito::mock("POST", "/api/v2/write")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("bucket".into(), "collect.x.myservice".into()),
                Matcher::UrlEncoded("precision".into(), "ns".into()),
                Matcher::UrlEncoded("org".into(), "loda".into()),
            ]))
            .match_header("authorization", "Token secret")
            .with_status(204)
            .expect(2)
            .create();

        // v1 port is closed: the first write fails over to v2
        let (client, mut purge_rx) = client_for(CLOSED_PORT, mockito_port());
        let route = Route::new("collect.x.myservice", vec!["127.0.0.1".into()]);

        client.write(&route, &batch("collect.x.myservice")).await.unwrap();
        assert!(client.knows_v2("collect.x.myservice"));
        // the v1 transport failure purged the route
        assert_eq!(
            purge_rx.recv().await.as_deref(),
            Some("collect.x.myservice")
        );

        // the second write goes straight to v2: no further purge arrives
        client.write(&route, &batch("collect.x.myservice")).await.unwrap();
        assert!(purge_rx.try_recv().is_err());

        write_v2.assert();
    }

    #[tokio::test]
    async fn replicas_are_fanned_out() {
        test_helpers::maybe_start_logging();

        let write = mockito::mock("POST", "/write")
            .match_query(Matcher::UrlEncoded(
                "db".into(),
                "collect.rep.myservice".into(),
            ))
            .with_status(204)
            .expect(3)
            .create();

        let (client, _purge_rx) = client_for(mockito_port(), CLOSED_PORT);
        let route = Route::new(
            "collect.rep.myservice",
            vec!["127.0.0.1".into(), "127.0.0.1".into(), "127.0.0.1".into()],
        );
        client.write(&route, &batch("collect.rep.myservice")).await.unwrap();

        // replica writes run on spawned tasks; give them a moment to land
        tokio::time::sleep(Duration::from_millis(200)).await;
        write.assert();
    }

    #[tokio::test]
    async fn unexpected_status_abandons_batch() {
        test_helpers::maybe_start_logging();

        let _write = mockito::mock("POST", "/write")
            .match_query(Matcher::UrlEncoded(
                "db".into(),
                "collect.odd.myservice".into(),
            ))
            .with_status(200)
            .with_body("partial write: points beyond retention policy dropped")
            .create();

        let (client, _purge_rx) = client_for(mockito_port(), CLOSED_PORT);
        let route = Route::new("collect.odd.myservice", vec!["127.0.0.1".into()]);

        let before = client.abandoned_batches();
        client.write(&route, &batch("collect.odd.myservice")).await.unwrap();
        assert_eq!(client.abandoned_batches(), before + 1);
    }
}
