//! TOML configuration, plus the translation into per-component configs.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use bus::{ConsumerConfig, MasterConfig};
use influxdb_client::BackendConfig;
use query_api::{ApiConfig, IdcGroup};
use serde::Deserialize;

/// Configuration load failures. Both end the process with exit code 1.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("could not read config file {path}: {source}")]
    Read {
        /// Path as given on the command line.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("could not decode config file {path}: {source}")]
    Decode {
        /// Path as given on the command line.
        path: String,
        /// Underlying decode error.
        source: toml::de::Error,
    },

    /// The `listen` value is not a bindable address.
    #[error("invalid listen address {listen}: {source}")]
    Listen {
        /// The configured value.
        listen: String,
        /// Underlying parse error.
        source: std::net::AddrParseError,
    },
}

/// The whole config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// `[common]`
    pub common: CommonConfig,
    /// `[registry]`
    pub registry: RegistryConfig,
    /// `[usage]`
    pub usage: UsageConfig,
    /// `[linkstats]`
    pub linkstats: LinkStatsConfig,
    /// `[[idc]]`
    pub idc: Vec<IdcConfig>,
    /// `[nsq]`
    pub nsq: NsqConfig,
    /// `[tsdb]`
    pub tsdb: TsdbConfig,
    /// `[log]`
    pub log: LogConfig,
}

/// `[common]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommonConfig {
    /// Bind address of the read API, `host:port` or `:port`.
    pub listen: String,
    /// v1 HTTP port of every backend host.
    #[serde(rename = "influxdPort")]
    pub influxd_port: u16,
    /// Topic discovery period, in milliseconds.
    #[serde(rename = "topicsPollInterval")]
    pub topics_poll_interval: u64,
    /// Measurements with this suffix are hidden from `/series`.
    #[serde(rename = "hiddenMetricSuffix")]
    pub hidden_metric_suffix: String,
    /// Root of the database namespaces in the registry.
    #[serde(rename = "DBNS")]
    pub db_ns: String,
    /// Cluster label that takes data nothing else claims.
    #[serde(rename = "defaultDBCluster")]
    pub default_db_cluster: String,
    /// Namespace `/sa` computes availability over.
    #[serde(rename = "defaultAPINameSpace")]
    pub default_api_namespace: String,
    /// Process-wide cap on in-flight backend writes.
    #[serde(rename = "writeConcurrency")]
    pub write_concurrency: usize,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8002".into(),
            influxd_port: 8086,
            topics_poll_interval: 30_000,
            hidden_metric_suffix: String::new(),
            db_ns: "db.monitor.loda".into(),
            default_db_cluster: "common".into(),
            default_api_namespace: String::new(),
            write_concurrency: 10_000,
        }
    }
}

/// `[registry]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Base URL of the registry.
    pub link: String,
    /// Route refresh period, in seconds. Values under a minute are floored
    /// to a minute.
    #[serde(rename = "expireDur")]
    pub expire_dur: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            link: String::new(),
            expire_dur: 300,
        }
    }
}

/// `[usage]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UsageConfig {
    /// Whether `/usage` is served.
    pub enable: bool,
}

/// `[linkstats]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkStatsConfig {
    /// Namespaces `/linkstats` builds its graph over.
    pub ns: Vec<String>,
}

/// One `[[idc]]` entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdcConfig {
    /// IDC name.
    pub name: String,
    /// Hosts in this IDC.
    pub hosts: Vec<String>,
}

/// `[nsq]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NsqConfig {
    /// Whether the bus is consumed at all.
    pub enable: bool,
    /// Messages redelivered more often than this are dropped.
    #[serde(rename = "maxAttempts")]
    pub max_attempts: u16,
    /// Unacked message window per consumer.
    #[serde(rename = "maxInFlight")]
    pub max_in_flight: u32,
    /// Bus heartbeat period in milliseconds. Parsed for deployment
    /// compatibility; the bus client manages connection timing itself.
    #[serde(rename = "heartbeatInterval")]
    pub heartbeat_interval: u64,
    /// Bus read timeout in milliseconds. Parsed for deployment
    /// compatibility; the bus client manages connection timing itself.
    #[serde(rename = "readTimeout")]
    pub read_timeout: u64,
    /// How often consumers re-poll the lookup service, in milliseconds.
    #[serde(rename = "lookupdPollInterval")]
    pub lookupd_poll_interval: u64,
    /// Concurrent handler invocations per topic.
    #[serde(rename = "handlerCount")]
    pub handler_count: usize,
    /// Lookup service addresses.
    pub lookupds: Vec<String>,
    /// Channel name every consumer subscribes with.
    #[serde(rename = "chan")]
    pub channel: String,
    /// Topics must start with this to be consumed, including the trailing
    /// dot (e.g. `collect.`).
    #[serde(rename = "topicPrefix")]
    pub topic_prefix: String,
}

impl Default for NsqConfig {
    fn default() -> Self {
        Self {
            enable: false,
            max_attempts: 5,
            max_in_flight: 200,
            heartbeat_interval: 30_000,
            read_timeout: 60_000,
            lookupd_poll_interval: 60_000,
            handler_count: 4,
            lookupds: vec![],
            channel: "router".into(),
            topic_prefix: "collect.".into(),
        }
    }
}

/// `[tsdb]` section: the v2 side of the backends.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TsdbConfig {
    /// v2 HTTP port of every backend host.
    pub port: u16,
    /// Organisation for writes and bucket creation.
    pub org: String,
    /// Authentication token.
    pub token: String,
    /// A host that only speaks the v2 API, if any.
    pub host: Option<String>,
}

impl Default for TsdbConfig {
    fn default() -> Self {
        Self {
            port: 9999,
            org: String::new(),
            token: String::new(),
            host: None,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// False logs to stderr, true logs to rolling files under `path`.
    pub enable: bool,
    /// Directory the log files land in.
    pub path: String,
    /// Log level or full filter directive.
    pub level: String,
    /// Number of rotated files to keep. Parsed for deployment
    /// compatibility; files roll daily.
    pub file_num: u32,
    /// Size per rotated file, in MB. Parsed for deployment compatibility;
    /// files roll daily.
    pub file_size: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enable: false,
            path: "./log".into(),
            level: "info".into(),
            file_num: 5,
            file_size: 100,
        }
    }
}

impl Config {
    /// Reads and decodes the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Decode {
            path: path.display().to_string(),
            source,
        })
    }

    /// The socket address of the read API. A bare `:port` binds all
    /// interfaces.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let listen = &self.common.listen;
        let normalized = if listen.starts_with(':') {
            format!("0.0.0.0{listen}")
        } else {
            listen.clone()
        };
        normalized.parse().map_err(|source| ConfigError::Listen {
            listen: listen.clone(),
            source,
        })
    }

    /// Backend connection parameters.
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            v1_port: self.common.influxd_port,
            v2_port: self.tsdb.port,
            org: self.tsdb.org.clone(),
            token: self.tsdb.token.clone(),
            v2_only_host: self.tsdb.host.clone(),
        }
    }

    /// Topic master parameters.
    pub fn master_config(&self) -> MasterConfig {
        MasterConfig {
            lookupds: self.nsq.lookupds.clone(),
            topic_prefix: self.nsq.topic_prefix.clone(),
            poll_interval: Duration::from_millis(self.common.topics_poll_interval.max(1_000)),
            consumer: ConsumerConfig {
                channel: self.nsq.channel.clone(),
                lookupds: self.nsq.lookupds.clone(),
                max_attempts: self.nsq.max_attempts,
                max_in_flight: self.nsq.max_in_flight,
                handler_count: self.nsq.handler_count.max(1),
                lookupd_poll_interval: Duration::from_millis(
                    self.nsq.lookupd_poll_interval.max(1_000),
                ),
            },
        }
    }

    /// Read API parameters.
    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            topic_prefix: self.nsq.topic_prefix.clone(),
            usage_enabled: self.usage.enable,
            linkstats_namespaces: self.linkstats.ns.clone(),
            idc_groups: self
                .idc
                .iter()
                .map(|idc| IdcGroup {
                    name: idc.name.clone(),
                    hosts: idc.hosts.clone(),
                })
                .collect(),
            hidden_metric_suffix: self.common.hidden_metric_suffix.clone(),
            default_api_namespace: self.common.default_api_namespace.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[common]
listen = ":8002"
influxdPort = 8086
topicsPollInterval = 30000
hiddenMetricSuffix = ".hidden"
DBNS = "db.monitor.loda"
defaultDBCluster = "common"
defaultAPINameSpace = "collect.api.loda"
writeConcurrency = 2000

[registry]
link = "http://registry.example.com"
expireDur = 300

[usage]
enable = true

[linkstats]
ns = ["collect.api.loda"]

[[idc]]
name = "idc1"
hosts = ["h1", "h2"]

[[idc]]
name = "idc2"
hosts = ["h3"]

[nsq]
enable = true
maxAttempts = 5
maxInFlight = 200
heartbeatInterval = 30000
readTimeout = 60000
lookupdPollInterval = 60000
handlerCount = 4
lookupds = ["10.0.0.1:4161", "10.0.0.2:4161"]
chan = "router"
topicPrefix = "collect."

[tsdb]
port = 9999
org = "loda"
token = "secret"

[log]
enable = true
path = "/var/log/router"
level = "info"
file_num = 5
file_size = 100
"#;

    #[test]
    fn parses_full_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.common.influxd_port, 8086);
        assert_eq!(config.common.db_ns, "db.monitor.loda");
        assert_eq!(config.common.write_concurrency, 2000);
        assert_eq!(config.registry.link, "http://registry.example.com");
        assert!(config.usage.enable);
        assert_eq!(config.idc.len(), 2);
        assert_eq!(config.nsq.lookupds.len(), 2);
        assert_eq!(config.nsq.channel, "router");
        assert_eq!(config.tsdb.org, "loda");
        assert!(config.log.enable);
    }

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config: Config = toml::from_str("[common]\nlisten = \":9000\"\n").unwrap();
        assert_eq!(config.common.influxd_port, 8086);
        assert_eq!(config.common.write_concurrency, 10_000);
        assert!(!config.nsq.enable);
        assert_eq!(config.nsq.topic_prefix, "collect.");
        assert_eq!(config.registry.expire_dur, 300);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = toml::from_str::<Config>("[common]\nnope = 1\n").unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn listen_addr_accepts_bare_ports() {
        let config: Config = toml::from_str("[common]\nlisten = \":8002\"\n").unwrap();
        assert_eq!(
            config.listen_addr().unwrap(),
            "0.0.0.0:8002".parse::<SocketAddr>().unwrap()
        );

        let config: Config = toml::from_str("[common]\nlisten = \"127.0.0.1:8002\"\n").unwrap();
        assert_eq!(
            config.listen_addr().unwrap(),
            "127.0.0.1:8002".parse::<SocketAddr>().unwrap()
        );

        let config: Config = toml::from_str("[common]\nlisten = \"bogus\"\n").unwrap();
        assert!(config.listen_addr().is_err());
    }

    #[test]
    fn component_configs_are_derived() {
        let config: Config = toml::from_str(SAMPLE).unwrap();

        let backend = config.backend_config();
        assert_eq!(backend.v1_port, 8086);
        assert_eq!(backend.v2_port, 9999);
        assert_eq!(backend.org, "loda");

        let master = config.master_config();
        assert_eq!(master.topic_prefix, "collect.");
        assert_eq!(master.poll_interval, Duration::from_secs(30));
        assert_eq!(master.consumer.handler_count, 4);

        let api = config.api_config();
        assert!(api.usage_enabled);
        assert_eq!(api.idc_groups.len(), 2);
        assert_eq!(api.hidden_metric_suffix, ".hidden");
    }
}
