//! The inter-IDC link graph served by `/linkstats`.
//!
//! Every monitored host pings its peers and reports the loss rate as the
//! `RUN.ping.loss` measurement, tagged with the pinging host (`from`) and
//! the pinged host (`host`). The graph keeps only edges that cross an IDC
//! boundary; traffic inside one data center is not interesting here.

use std::collections::{BTreeMap, HashMap};

use data_types::Scalar;
use observability_deps::tracing::warn;
use serde::Serialize;

use crate::backend::{internal, route_for};
use crate::{ApiContext, ApiError, IdcGroup};

/// One measured (source, target, loss) link sample.
pub type LinkSample = (String, String, f64);

/// The graph answer.
#[derive(Debug, Default, PartialEq, Serialize)]
pub struct Graph {
    /// Every host seen on either side of a link.
    pub nodes: Vec<Node>,
    /// Inter-IDC edges only.
    pub links: Vec<Link>,
}

/// A graph node.
#[derive(Debug, PartialEq, Serialize)]
pub struct Node {
    /// Host name or address.
    pub name: String,
    /// IDC the host is configured into, or `unknown`.
    pub idc: String,
}

/// A graph edge.
#[derive(Debug, PartialEq, Serialize)]
pub struct Link {
    /// Pinging host.
    pub source: String,
    /// Pinged host.
    pub target: String,
    /// Last observed loss rate.
    pub value: f64,
}

/// Collects the latest loss per (source, target) pair over the configured
/// namespaces and folds them into the graph.
pub async fn collect(ctx: &ApiContext) -> Result<Graph, ApiError> {
    let mut samples: Vec<LinkSample> = vec![];

    for ns in &ctx.config.linkstats_namespaces {
        let route = match route_for(ctx, ns).await {
            Ok(route) => route,
            Err(e) => {
                warn!(ns=%ns, error=%e, "skipping unroutable linkstats namespace");
                continue;
            }
        };

        let rs = ctx
            .influx
            .query(
                &route.backends,
                &[
                    ("db", ns.as_str()),
                    (
                        "q",
                        r#"SELECT LAST("value") FROM "RUN.ping.loss" GROUP BY "from","host""#,
                    ),
                ],
            )
            .await
            .map_err(internal)?;

        for result in &rs.results {
            for series in &result.series {
                let (Some(source), Some(target)) =
                    (series.tags.get("from"), series.tags.get("host"))
                else {
                    continue;
                };
                let Some(loss) = series
                    .values
                    .first()
                    .and_then(|row| row.get(1))
                    .and_then(Scalar::as_f64)
                else {
                    continue;
                };
                samples.push((source.clone(), target.clone(), loss));
            }
        }
    }

    Ok(build_graph(&samples, &ctx.config.idc_groups))
}

/// Builds the graph from raw link samples: hosts become nodes annotated
/// with their IDC, edges survive only when both ends are in known and
/// different IDCs.
pub fn build_graph(samples: &[LinkSample], idc_groups: &[IdcGroup]) -> Graph {
    let mut idc_of: HashMap<&str, &str> = HashMap::new();
    for group in idc_groups {
        for host in &group.hosts {
            idc_of.insert(host.as_str(), group.name.as_str());
        }
    }

    let mut nodes: BTreeMap<&str, &str> = BTreeMap::new();
    let mut links = vec![];
    for (source, target, loss) in samples {
        nodes.insert(
            source.as_str(),
            idc_of.get(source.as_str()).copied().unwrap_or("unknown"),
        );
        nodes.insert(
            target.as_str(),
            idc_of.get(target.as_str()).copied().unwrap_or("unknown"),
        );

        let (Some(source_idc), Some(target_idc)) = (
            idc_of.get(source.as_str()),
            idc_of.get(target.as_str()),
        ) else {
            continue;
        };
        if source_idc == target_idc {
            continue;
        }
        links.push(Link {
            source: source.clone(),
            target: target.clone(),
            value: *loss,
        });
    }

    Graph {
        nodes: nodes
            .into_iter()
            .map(|(name, idc)| Node {
                name: name.to_string(),
                idc: idc.to_string(),
            })
            .collect(),
        links,
    }
}
