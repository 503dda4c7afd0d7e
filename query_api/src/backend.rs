//! Backend lookups shared by several handlers: tag and measurement
//! enumeration, series grouping, targeted deletes.

use std::collections::BTreeMap;

use data_types::{Route, Scalar};
use influxdb_client::ResultSet;
use observability_deps::tracing::warn;
use registry_client::CollectMetric;
use router::resolver;

use crate::{ApiContext, ApiError};

/// Maps a measurement's first dotted label to its display group.
pub fn trans_key(label: &str) -> &'static str {
    match label.to_lowercase().as_str() {
        "cpu" => "CPU",
        "mem" => "Memory",
        "net" => "Network",
        "disk" => "Disk",
        "fs" => "FileSystem",
        "io" => "IO",
        "port" => "Port",
        "plugin" => "Plugin",
        "proc" => "Process",
        "run" => "SDK",
        _ => "Other",
    }
}

/// The group a measurement belongs to, from its first dotted label.
pub fn measurement_group(measurement: &str) -> &'static str {
    trans_key(measurement.split('.').next().unwrap_or_default())
}

pub(crate) fn internal(e: impl std::fmt::Display) -> ApiError {
    ApiError::Internal(e.to_string())
}

fn route_error(e: resolver::Error) -> ApiError {
    match &e {
        resolver::Error::Unresolvable { .. } | resolver::Error::MalformedNamespace { .. } => {
            ApiError::BadRequest(e.to_string())
        }
        resolver::Error::Registry(_) => ApiError::Internal(e.to_string()),
    }
}

/// Resolves `ns` through the route cache, rejecting empty routes.
pub async fn route_for(ctx: &ApiContext, ns: &str) -> Result<Route, ApiError> {
    let route = ctx.routes.get(ns).await.map_err(route_error)?;
    if route.is_empty() {
        return Err(ApiError::BadRequest(format!(
            "{ns} has no influxdb route config"
        )));
    }
    Ok(route)
}

/// The string cells of the first column of the first series, which is how
/// the backend answers `show measurements` and `show tag keys`.
fn first_column_strings(rs: &ResultSet) -> Vec<String> {
    let mut out = vec![];
    if let Some(series) = rs.results.first().and_then(|r| r.series.first()) {
        for row in &series.values {
            if let Some(Scalar::String(value)) = row.first() {
                out.push(value.clone());
            }
        }
    }
    out
}

/// Lists the measurements of `ns`.
pub async fn measurements(ctx: &ApiContext, ns: &str) -> Result<Vec<String>, ApiError> {
    let route = route_for(ctx, ns).await?;
    let rs = ctx
        .influx
        .query(&route.backends, &[("db", ns), ("q", "show measurements")])
        .await
        .map_err(internal)?;
    Ok(first_column_strings(&rs))
}

/// Collects `{tag key: [values...]}` for one measurement, via `show tag
/// keys` followed by `show tag values`.
pub async fn tag_map(
    ctx: &ApiContext,
    ns: &str,
    measurement: &str,
) -> Result<BTreeMap<String, Vec<String>>, ApiError> {
    let route = route_for(ctx, ns).await?;

    let rs = ctx
        .influx
        .query(
            &route.backends,
            &[
                ("db", ns),
                ("q", &format!(r#"show tag keys from "{measurement}""#)),
            ],
        )
        .await
        .map_err(internal)?;

    let keys: Vec<String> = first_column_strings(&rs)
        .into_iter()
        .map(|key| format!("\"{key}\""))
        .collect();
    if keys.is_empty() {
        return Ok(BTreeMap::new());
    }

    let rs = ctx
        .influx
        .query(
            &route.backends,
            &[
                ("db", ns),
                (
                    "q",
                    &format!(
                        r#"show tag values from "{measurement}" with key in ({})"#,
                        keys.join(",")
                    ),
                ),
            ],
        )
        .await
        .map_err(internal)?;

    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for result in &rs.results {
        for series in &result.series {
            for row in &series.values {
                if let (Some(Scalar::String(key)), Some(Scalar::String(value))) =
                    (row.first(), row.get(1))
                {
                    map.entry(key.clone()).or_default().push(value.clone());
                }
            }
        }
    }
    Ok(map)
}

/// Deletes every series of `ns` whose `tag` equals `value`, one delete per
/// measurement.
pub async fn delete_tag_values(
    ctx: &ApiContext,
    ns: &str,
    tag: &str,
    value: &str,
) -> Result<(), ApiError> {
    let route = route_for(ctx, ns).await?;
    let names = measurements(ctx, ns).await?;

    for name in names {
        ctx.influx
            .query(
                &route.backends,
                &[
                    ("db", ns),
                    (
                        "q",
                        &format!(r#"DELETE FROM "{name}" WHERE "{tag}"='{value}'"#),
                    ),
                ],
            )
            .await
            .map_err(internal)?;
    }
    Ok(())
}

/// True if `name` passes the collect allowlist: an empty allowlist passes
/// everything, `RUN.`-prefixed metrics always pass, everything else must
/// match a registered prefix.
fn allowed(name: &str, allowlist: &[CollectMetric]) -> bool {
    if allowlist.is_empty() || name.starts_with("RUN.") {
        return true;
    }
    allowlist.iter().any(|m| name.starts_with(&m.name))
}

/// Builds the `/series` answer: visible measurements of `ns` grouped by
/// their display group.
pub async fn series_groups(
    ctx: &ApiContext,
    ns: &str,
) -> Result<BTreeMap<&'static str, Vec<String>>, ApiError> {
    let names = measurements(ctx, ns).await?;

    // a registry hiccup must not blank the series listing; an empty
    // allowlist passes everything through
    let allowlist = match ctx.registry.collect_allowlist(ns).await {
        Ok(allowlist) => allowlist,
        Err(e) => {
            warn!(ns, error=%e, "collect allowlist lookup failed");
            vec![]
        }
    };

    let hidden = &ctx.config.hidden_metric_suffix;
    let mut groups: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
    for name in names {
        if name.starts_with('_') {
            continue;
        }
        if !hidden.is_empty() && name.ends_with(hidden.as_str()) {
            continue;
        }
        if !allowed(&name, &allowlist) {
            continue;
        }
        groups.entry(measurement_group(&name)).or_default().push(name);
    }

    // collect entries for plugins exist in the registry before the first
    // point arrives; surface them anyway
    for metric in &allowlist {
        if metric.name.starts_with("PLUGIN.") {
            let group = groups.entry(measurement_group(&metric.name)).or_default();
            if !group.contains(&metric.name) {
                group.push(metric.name.clone());
            }
        }
    }

    for names in groups.values_mut() {
        names.sort();
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trans_key_groups() {
        assert_eq!(trans_key("cpu"), "CPU");
        assert_eq!(trans_key("MEM"), "Memory");
        assert_eq!(trans_key("net"), "Network");
        assert_eq!(trans_key("disk"), "Disk");
        assert_eq!(trans_key("fs"), "FileSystem");
        assert_eq!(trans_key("io"), "IO");
        assert_eq!(trans_key("port"), "Port");
        assert_eq!(trans_key("plugin"), "Plugin");
        assert_eq!(trans_key("proc"), "Process");
        assert_eq!(trans_key("RUN"), "SDK");
        assert_eq!(trans_key("whatever"), "Other");
    }

    #[test]
    fn measurement_groups_use_first_label() {
        assert_eq!(measurement_group("cpu.idle"), "CPU");
        assert_eq!(measurement_group("RUN.ping.loss"), "SDK");
        assert_eq!(measurement_group("custom"), "Other");
    }

    #[test]
    fn allowlist_rules() {
        let allowlist = vec![
            CollectMetric {
                name: "cpu.".into(),
                interval: String::new(),
            },
            CollectMetric {
                name: "PLUGIN.nginx".into(),
                interval: String::new(),
            },
        ];

        assert!(allowed("cpu.idle", &allowlist));
        assert!(allowed("PLUGIN.nginx.requests", &allowlist));
        assert!(allowed("RUN.anything.alive", &allowlist));
        assert!(!allowed("mem.used", &allowlist));

        // empty allowlist passes everything
        assert!(allowed("mem.used", &[]));
    }
}
