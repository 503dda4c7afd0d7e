//! Lazy provisioning of missing databases and buckets.

use observability_deps::tracing::info;
use reqwest::header::AUTHORIZATION;
use serde::Serialize;

use crate::{Error, InfluxClient, Result};

/// Retention applied when no suffix override matches.
const DEFAULT_RETENTION_DAYS: u64 = 90;

/// Namespace suffixes that keep their data longer than the default.
const RETENTION_OVERRIDES: &[(&str, u64)] = &[
    (".api.loda", 500),
    (".switch.loda", 500),
    (".mail.it.loda", 500),
];

/// Retention for `database`, in days.
pub(crate) fn retention_days(database: &str) -> u64 {
    RETENTION_OVERRIDES
        .iter()
        .find(|(suffix, _)| database.ends_with(suffix))
        .map(|(_, days)| *days)
        .unwrap_or(DEFAULT_RETENTION_DAYS)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BucketSpec<'a> {
    name: &'a str,
    #[serde(rename = "orgID")]
    org_id: &'a str,
    retention_rules: Vec<RetentionRule>,
    rp: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetentionRule {
    every_seconds: u64,
    #[serde(rename = "type")]
    rule_type: &'static str,
}

impl InfluxClient {
    /// Creates the v1 database and its default retention policy.
    pub(crate) async fn provision_v1(&self, host: &str, database: &str) -> Result<()> {
        let statements = [
            format!(r#"create database "{database}""#),
            format!(
                r#"CREATE RETENTION POLICY loda ON "{database}" DURATION {}d REPLICATION 1 DEFAULT"#,
                retention_days(database)
            ),
        ];

        for statement in &statements {
            let url = self.v1_url(host, "/query");
            let response = self
                .http
                .get(&url)
                .query(&[("q", statement.as_str())])
                .send()
                .await
                .map_err(|e| Error::ProvisioningFailed {
                    host: host.to_string(),
                    database: database.to_string(),
                    detail: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::ProvisioningFailed {
                    host: host.to_string(),
                    database: database.to_string(),
                    detail: format!("status {status}: {body}"),
                });
            }
        }

        info!(host, database, "created database and retention policy");
        Ok(())
    }

    /// Creates the v2 bucket, with the retention rule attached up front.
    pub(crate) async fn provision_v2(&self, host: &str, database: &str) -> Result<()> {
        let bucket = BucketSpec {
            name: database,
            org_id: &self.config.org,
            retention_rules: vec![RetentionRule {
                every_seconds: retention_days(database) * 86_400,
                rule_type: "expire",
            }],
            rp: "loda",
        };

        let url = self.v2_url(host, "/api/v2/buckets");
        let response = self
            .http_v2
            .post(&url)
            .header(AUTHORIZATION, format!("Token {}", self.config.token))
            .json(&bucket)
            .send()
            .await
            .map_err(|e| Error::ProvisioningFailed {
                host: host.to_string(),
                database: database.to_string(),
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ProvisioningFailed {
                host: host.to_string(),
                database: database.to_string(),
                detail: format!("status {status}: {body}"),
            });
        }

        info!(host, database, "created bucket");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_defaults_to_ninety_days() {
        assert_eq!(retention_days("collect.x.myservice"), 90);
        assert_eq!(retention_days("collect.api.loda.not.really"), 90);
    }

    #[test]
    fn retention_suffixes_override() {
        assert_eq!(retention_days("collect.a.api.loda"), 500);
        assert_eq!(retention_days("collect.core.switch.loda"), 500);
        assert_eq!(retention_days("collect.mx.mail.it.loda"), 500);
    }

    #[test]
    fn v2_retention_is_in_seconds() {
        // 90 days
        assert_eq!(retention_days("collect.x.y") * 86_400, 7_776_000);
        // 500 days
        assert_eq!(retention_days("collect.a.api.loda") * 86_400, 43_200_000);
    }
}
