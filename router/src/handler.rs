//! The per-topic bus message handler: decode, route, write.

use std::sync::Arc;

use async_trait::async_trait;
use bus::{BusError, HandlerFactory, MessageHandler};
use data_types::PointBatch;
use influxdb_client::InfluxClient;
use observability_deps::tracing::{error, warn};

use crate::cache::RouteCache;

/// Handles the messages of one topic. The topic name is the namespace the
/// batch is routed by; the batch's own `database` field names the backend
/// database it is written to.
#[derive(Debug)]
pub struct PointsHandler {
    topic: String,
    routes: RouteCache,
    influx: Arc<InfluxClient>,
}

#[async_trait]
impl MessageHandler for PointsHandler {
    async fn handle(&self, body: &[u8]) -> Result<(), BusError> {
        let batch: PointBatch = match serde_json::from_slice(body) {
            Ok(batch) => batch,
            Err(e) => {
                // an undecodable message stays undecodable on redelivery
                warn!(topic=%self.topic, error=%e, "abandoning undecodable message");
                return Ok(());
            }
        };

        if batch.points.is_empty() {
            return Ok(());
        }

        let route = self.routes.get(&self.topic).await?;
        if route.is_empty() {
            warn!(topic=%self.topic, "route has no backends, ignoring points");
            return Ok(());
        }

        self.influx.write(&route, &batch).await.map_err(|e| {
            error!(
                topic=%self.topic,
                backends=?route.backends,
                error=%e,
                "writing points failed"
            );
            BusError::from(e)
        })?;
        Ok(())
    }
}

/// Creates a [`PointsHandler`] per discovered topic.
#[derive(Debug)]
pub struct PointsHandlerFactory {
    routes: RouteCache,
    influx: Arc<InfluxClient>,
}

impl PointsHandlerFactory {
    /// Creates a factory wiring every handler to the shared route cache and
    /// backend client.
    pub fn new(routes: RouteCache, influx: Arc<InfluxClient>) -> Self {
        Self { routes, influx }
    }
}

impl HandlerFactory for PointsHandlerFactory {
    fn handler(&self, topic: &str) -> Arc<dyn MessageHandler> {
        Arc::new(PointsHandler {
            topic: topic.to_string(),
            routes: self.routes.clone(),
            influx: Arc::clone(&self.influx),
        })
    }
}

#[cfg(test)]
mod tests {
    use influxdb_client::{BackendConfig, WriteGate};
    use mockito::Matcher;
    use registry_client::Client as RegistryClient;

    use super::*;
    use crate::resolver::Resolver;

    fn handler_for(topic: &str, db_ns_root: &str) -> Arc<dyn MessageHandler> {
        let resolver = Resolver::new(
            RegistryClient::new(mockito::server_url()),
            db_ns_root,
            "common",
        );
        let (routes, _purge_rx) = RouteCache::new(resolver, "collect.");
        let (purge_tx, _rx) = tokio::sync::mpsc::channel(8);
        let influx = InfluxClient::new(
            BackendConfig {
                v1_port: mockito::server_address().port(),
                v2_port: 1,
                org: "loda".into(),
                token: "secret".into(),
                v2_only_host: None,
            },
            WriteGate::new(8),
            purge_tx,
        );
        PointsHandlerFactory::new(routes, influx).handler(topic)
    }

    #[tokio::test]
    async fn undecodable_message_is_acknowledged() {
        test_helpers::maybe_start_logging();

        let handler = handler_for("collect.junk.svc", "db.h1.loda");
        handler.handle(b"this is not json").await.unwrap();
    }

    #[tokio::test]
    async fn empty_batch_is_acknowledged() {
        let handler = handler_for("collect.empty.svc", "db.h2.loda");
        handler
            .handle(br#"{"database": "collect.empty.svc", "points": []}"#)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unresolvable_route_is_a_retryable_error() {
        test_helpers::maybe_start_logging();

        let _direct = mockito::mock("GET", "/api/v1/router/resource")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("ns".into(), "lost.db.h3.loda".into()),
                Matcher::UrlEncoded("type".into(), "machine".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"httpstatus": 200, "data": []}"#)
            .create();
        let _aliases = mockito::mock("GET", "/api/v1/router/ns")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("ns".into(), "db.h3.loda".into()),
                Matcher::UrlEncoded("format".into(), "list".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"httpstatus": 200, "data": []}"#)
            .create();
        let _common = mockito::mock("GET", "/api/v1/router/resource")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("ns".into(), "common.db.h3.loda".into()),
                Matcher::UrlEncoded("type".into(), "machine".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"httpstatus": 200, "data": []}"#)
            .create();

        let handler = handler_for("collect.lost.svc", "db.h3.loda");
        let err = handler
            .handle(
                br#"{"database": "collect.lost.svc",
                     "points": [{"measurement": "cpu.idle", "timestamp": 1700000000,
                                 "fields": {"value": 1.5}}]}"#,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no influxdb route config"));
    }

    #[tokio::test]
    async fn decoded_batch_is_routed_and_written() {
        test_helpers::maybe_start_logging();

        let _machines = mockito::mock("GET", "/api/v1/router/resource")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("ns".into(), "good.db.h4.loda".into()),
                Matcher::UrlEncoded("type".into(), "machine".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"httpstatus": 200, "data": [{"ip": "127.0.0.1"}]}"#)
            .create();
        let write = mockito::mock("POST", "/write")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("db".into(), "collect.good.svc".into()),
                Matcher::UrlEncoded("precision".into(), "ns".into()),
            ]))
            .match_body("cpu.idle,host=h1 value=0.87 1700000000000000000")
            .with_status(204)
            .expect(1)
            .create();

        let handler = handler_for("collect.good.svc", "db.h4.loda");
        handler
            .handle(
                br#"{"database": "collect.good.svc",
                     "points": [{"measurement": "cpu.idle", "timestamp": 1700000000,
                                 "tags": {"host": "h1"},
                                 "fields": {"value": 0.87}}]}"#,
            )
            .await
            .unwrap();
        write.assert();
    }
}
