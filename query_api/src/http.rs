//! The HTTP surface of the read API.
//!
//! Routing is a plain match on (method, path); every answer wears the
//! `{httpstatus, msg, data}` envelope except the two endpoints that proxy
//! the backend response through verbatim. CORS headers and the access log
//! ride directly on the delegate rather than on a middleware stack.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use data_types::Scalar;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE, ORIGIN};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use observability_deps::tracing::info;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::backend::{self, internal};
use crate::planner::{self, DAY_MS};
use crate::response::{error_response, parse_results, set_precision, success_response};
use crate::{linkstats, ApiContext, ApiError};

/// Memoization key of the availability aggregate.
const SA_CACHE_KEY: &str = "service.availability";

/// Upper bound on tag keys `/query2` will group over.
const MAX_QUERY2_TAG_KEYS: usize = 10;

/// Routes inbound requests to the handlers.
#[derive(Debug)]
pub struct HttpDelegate {
    context: Arc<ApiContext>,
}

impl HttpDelegate {
    /// Creates a delegate over `context`.
    pub fn new(context: Arc<ApiContext>) -> Self {
        Self { context }
    }

    /// Handles one request: dispatch, error mapping, CORS, access log.
    pub async fn route(&self, req: Request<Body>) -> Response<Body> {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let origin = req.headers().get(ORIGIN).cloned();

        let mut response = if method == Method::OPTIONS {
            Response::builder()
                .status(StatusCode::OK)
                .body(Body::empty())
                .expect("valid response")
        } else {
            match self.dispatch(req).await {
                Ok(response) => response,
                Err(e) => error_response(e.status_code(), &e.to_string()),
            }
        };

        if let Some(origin) = origin {
            let headers = response.headers_mut();
            headers.insert("Access-Control-Allow-Origin", origin);
            headers.insert(
                "Access-Control-Allow-Methods",
                HeaderValue::from_static("DELETE, GET, OPTIONS, POST, PUT"),
            );
            headers.insert(
                "Access-Control-Allow-Headers",
                HeaderValue::from_static(
                    "Accept, Accept-Encoding, Authorization, Content-Length, Content-Type, \
                     X-CSRF-Token, X-HTTP-Method-Override, AuthToken, NS, Resource, \
                     X-Requested-With",
                ),
            );
        }

        info!(
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "access"
        );
        response
    }

    async fn dispatch(&self, req: Request<Body>) -> Result<Response<Body>, ApiError> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/ping") => Ok(success_response("OK", json!("pong"))),
            (&Method::GET, "/stats") => Ok(self.stats()),
            (&Method::GET, "/series") => self.series(req).await,
            (&Method::GET, "/tags") => self.tags(req).await,
            (&Method::DELETE, "/tags") => self.delete_tags(req).await,
            (&Method::DELETE, "/measurement") => self.delete_measurement(req).await,
            (&Method::GET | &Method::POST, "/query") => self.query(req).await,
            (&Method::GET | &Method::POST, "/query2") => self.query2(req).await,
            (&Method::GET, "/usage") => self.usage(req).await,
            (&Method::GET, "/linkstats") => self.linkstats().await,
            (&Method::GET, "/sa") => self.service_availability().await,
            (
                _,
                "/ping" | "/stats" | "/series" | "/tags" | "/measurement" | "/query" | "/query2"
                | "/usage" | "/linkstats" | "/sa",
            ) => Ok(error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed",
            )),
            _ => Ok(error_response(StatusCode::NOT_FOUND, "not found")),
        }
    }

    fn stats(&self) -> Response<Body> {
        success_response(
            "OK",
            json!({
                "abandonedBatches": self.context.influx.abandoned_batches(),
                "cachedRoutes": self.context.routes.len(),
                "cachedResponses": self.context.cache.len(),
            }),
        )
    }

    async fn series(&self, req: Request<Body>) -> Result<Response<Body>, ApiError> {
        let params = request_params(req).await?;
        let ns = required(&params, "ns")?;
        let groups = backend::series_groups(&self.context, ns).await?;
        Ok(success_response("OK", groups))
    }

    async fn tags(&self, req: Request<Body>) -> Result<Response<Body>, ApiError> {
        let params = request_params(req).await?;
        let ns = required(&params, "ns")?;
        let measurement = required(&params, "measurement")?;
        let map = backend::tag_map(&self.context, ns, measurement).await?;
        Ok(success_response("OK", map))
    }

    async fn delete_tags(&self, req: Request<Body>) -> Result<Response<Body>, ApiError> {
        let params = request_params(req).await?;
        let ns = required(&params, "ns")?;
        let _measurement = required(&params, "measurement")?;
        let tag = required(&params, "tag")?;
        let value = required(&params, "value")?;

        if tag != "host" {
            return Err(ApiError::BadRequest(
                "only the host tag can be deleted".into(),
            ));
        }

        backend::delete_tag_values(&self.context, ns, tag, value).await?;
        Ok(success_response("OK", json!(null)))
    }

    async fn delete_measurement(&self, req: Request<Body>) -> Result<Response<Body>, ApiError> {
        let params = request_params(req).await?;
        let ns = required(&params, "ns")?;
        let name = required(&params, "name")?;

        let q = if optional(&params, "regexp") == "true" {
            format!("DELETE FROM /^{name}/")
        } else {
            format!(r#"drop measurement "{name}""#)
        };

        let route = backend::route_for(&self.context, ns).await?;
        let (status, body) = self
            .context
            .influx
            .query_raw(&route.backends, &[("db", ns), ("q", &q)])
            .await
            .map_err(internal)?;
        Ok(proxy_response(status, body))
    }

    async fn query(&self, req: Request<Body>) -> Result<Response<Body>, ApiError> {
        let params = request_params(req).await?;
        let q = optional(&params, "q");

        let lowered = q.to_lowercase();
        if lowered.contains("drop ") || lowered.contains("delete ") {
            return Err(ApiError::Refused);
        }

        let ns = match params.get("db").filter(|db| !db.is_empty()) {
            Some(db) => db.clone(),
            None => extract_namespace(q, &self.context.config.topic_prefix)
                .ok_or_else(|| {
                    ApiError::BadRequest("db or a namespaced query required".into())
                })?
                .to_string(),
        };

        let route = backend::route_for(&self.context, &ns).await?;
        let pairs: Vec<(&str, &str)> = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let (status, body) = self
            .context
            .influx
            .query_raw(&route.backends, &pairs)
            .await
            .map_err(internal)?;
        Ok(proxy_response(status, body))
    }

    async fn query2(&self, req: Request<Body>) -> Result<Response<Body>, ApiError> {
        let params = request_params(req).await?;
        let ns = required(&params, "ns")?;
        let measurement = required(&params, "measurement")?;
        let start_ms = required_ms(&params, "starttime")?;
        let end_ms = required_ms(&params, "endtime")?;
        let where_clause = optional(&params, "where");
        let func = optional(&params, "fn");
        let fill = optional(&params, "fill");

        // known limitation: requests differing only in measurement, where,
        // fn or fill collide on this key
        let cache_key = format!(
            "{ns}{}{}",
            optional(&params, "starttime"),
            optional(&params, "endtime")
        );
        if let Some(cached) = self.context.cache.get(&cache_key) {
            return Ok(success_response("OK", cached));
        }

        let tags = backend::tag_map(&self.context, ns, measurement).await?;
        if tags.len() > MAX_QUERY2_TAG_KEYS {
            return Err(ApiError::BadRequest(format!(
                "{measurement} has {} tag keys, at most {MAX_QUERY2_TAG_KEYS} are supported",
                tags.len()
            )));
        }
        let tag_keys: Vec<String> = tags.keys().cloned().collect();

        let q = planner::range_query(
            measurement,
            start_ms,
            end_ms,
            &tag_keys,
            where_clause,
            func,
            fill,
        );

        let route = backend::route_for(&self.context, ns).await?;
        let rs = self
            .context
            .influx
            .query(
                &route.backends,
                &[("db", ns), ("q", &q), ("epoch", "s"), ("pretty", "true")],
            )
            .await
            .map_err(internal)?;

        let parsed = parse_results(rs);
        let value = serde_json::to_value(&parsed).map_err(internal)?;
        self.context.cache.set(cache_key, value.clone());
        Ok(success_response("OK", value))
    }

    async fn usage(&self, req: Request<Body>) -> Result<Response<Body>, ApiError> {
        if !self.context.config.usage_enabled {
            return Err(ApiError::Disabled("usage api disabled".into()));
        }

        let params = request_params(req).await?;
        let ns = required(&params, "ns")?;
        let measurement = required(&params, "measurement")?;
        let duration = required(&params, "duration")?;
        let start_ms = required_ms(&params, "starttime")?;
        let end_ms = required_ms(&params, "endtime")?;
        let period = optional(&params, "period");
        let func = match optional(&params, "fn") {
            "" => "mean",
            func => func,
        };
        let group_by: Vec<String> = optional(&params, "groupby")
            .split(',')
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect();

        if end_ms - start_ms > DAY_MS {
            return Err(ApiError::BadRequest(
                "time range must be within one day".into(),
            ));
        }

        let q = planner::usage_query(
            measurement,
            func,
            period,
            duration,
            start_ms,
            end_ms,
            &group_by,
        );

        let route = backend::route_for(&self.context, ns).await?;
        let rs = self
            .context
            .influx
            .query(&route.backends, &[("db", ns), ("q", &q), ("epoch", "s")])
            .await
            .map_err(internal)?;
        let parsed = parse_results(rs);
        let value = serde_json::to_value(&parsed).map_err(internal)?;
        Ok(success_response("OK", value))
    }

    async fn linkstats(&self) -> Result<Response<Body>, ApiError> {
        let graph = linkstats::collect(&self.context).await?;
        Ok(success_response("OK", graph))
    }

    /// Availability of the SDK heartbeat measurements over the last day:
    /// `100 · (1 − failed samples / total samples)`, memoized until the
    /// next cache purge.
    async fn service_availability(&self) -> Result<Response<Body>, ApiError> {
        if let Some(cached) = self.context.cache.get(SA_CACHE_KEY) {
            return Ok(success_response("OK", cached));
        }

        let ns = self.context.config.default_api_namespace.clone();
        if ns.is_empty() {
            return Err(ApiError::Disabled(
                "availability api disabled, no default namespace configured".into(),
            ));
        }

        let names = backend::measurements(&self.context, &ns).await?;
        let alive: Vec<String> = names
            .into_iter()
            .filter(|name| {
                name.ends_with(".alive") && backend::measurement_group(name) == "SDK"
            })
            .collect();

        let route = backend::route_for(&self.context, &ns).await?;
        let mut total = 0.0;
        let mut failed = 0.0;
        for name in &alive {
            total += self.count_samples(&route.backends, &ns, name, false).await?;
            failed += self.count_samples(&route.backends, &ns, name, true).await?;
        }

        let availability = if total == 0.0 {
            100.0
        } else {
            set_precision(100.0 * (1.0 - failed / total), 4)
        };

        let value = json!({
            "availability": availability,
            "measurements": alive,
        });
        self.context.cache.set(SA_CACHE_KEY, value.clone());
        Ok(success_response("OK", value))
    }

    async fn count_samples(
        &self,
        backends: &[String],
        ns: &str,
        measurement: &str,
        failed_only: bool,
    ) -> Result<f64, ApiError> {
        let q = if failed_only {
            format!(r#"SELECT count("value") FROM "{measurement}" WHERE "value" = 0 AND time > now() - 1d"#)
        } else {
            format!(r#"SELECT count("value") FROM "{measurement}" WHERE time > now() - 1d"#)
        };

        let rs = self
            .context
            .influx
            .query(backends, &[("db", ns), ("q", &q)])
            .await
            .map_err(internal)?;
        Ok(rs
            .results
            .first()
            .and_then(|result| result.series.first())
            .and_then(|series| series.values.first())
            .and_then(|row| row.get(1))
            .and_then(Scalar::as_f64)
            .unwrap_or(0.0))
    }
}

/// Serves `delegate` on `addr` until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    delegate: HttpDelegate,
    shutdown: CancellationToken,
) -> Result<(), hyper::Error> {
    let delegate = Arc::new(delegate);
    let make_svc = make_service_fn(move |_conn| {
        let delegate = Arc::clone(&delegate);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let delegate = Arc::clone(&delegate);
                async move { Ok::<_, Infallible>(delegate.route(req).await) }
            }))
        }
    });

    info!(%addr, "read api listening");
    Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

/// Merges query string and (for form POSTs) body parameters.
async fn request_params(req: Request<Body>) -> Result<HashMap<String, String>, ApiError> {
    let query = req.uri().query().unwrap_or("").to_string();
    let mut params = form_pairs(&query)?;

    let is_form = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if is_form {
        let body = hyper::body::to_bytes(req.into_body())
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let body = std::str::from_utf8(&body)
            .map_err(|e| ApiError::BadRequest(format!("request body is not utf-8: {e}")))?;
        params.extend(form_pairs(body)?);
    }

    Ok(params)
}

fn form_pairs(encoded: &str) -> Result<HashMap<String, String>, ApiError> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(encoded)
        .map(|pairs| pairs.into_iter().collect())
        .map_err(|e| ApiError::BadRequest(format!("malformed parameters: {e}")))
}

fn required<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ApiError> {
    match params.get(key).map(String::as_str) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ApiError::BadRequest(format!(
            "missing required param {key}"
        ))),
    }
}

fn required_ms(params: &HashMap<String, String>, key: &str) -> Result<i64, ApiError> {
    required(params, key)?.parse().map_err(|_| {
        ApiError::BadRequest(format!("{key} must be a millisecond timestamp"))
    })
}

fn optional<'a>(params: &'a HashMap<String, String>, key: &str) -> &'a str {
    params.get(key).map(String::as_str).unwrap_or("")
}

fn proxy_response(status: u16, body: Bytes) -> Response<Body> {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("valid response")
}

/// Pulls the first `"<prefix>…"`-quoted namespace out of a raw query.
fn extract_namespace<'a>(q: &'a str, topic_prefix: &str) -> Option<&'a str> {
    if topic_prefix.is_empty() {
        return None;
    }
    let needle = format!("\"{topic_prefix}");
    let start = q.find(&needle)? + 1;
    let rest = &q[start..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}
