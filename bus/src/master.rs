//! Topic discovery and consumer lifecycle.
//!
//! The master polls every configured lookup service for the topic list,
//! filters it by the configured prefix and makes sure exactly one consumer
//! exists per matching topic. Topics are assumed to be monotonically added
//! within a process lifetime: consumers are never torn down when a topic
//! disappears from the lookup answer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use observability_deps::tracing::{debug, info, warn};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::consumer::{self, ConsumerConfig, ConsumerHandle};
use crate::HandlerFactory;

/// Master configuration, straight from the `[nsq]` and `[common]` config
/// sections.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Lookup service addresses.
    pub lookupds: Vec<String>,
    /// Only topics starting with this prefix belong to this router.
    pub topic_prefix: String,
    /// How often the topic list is re-fetched.
    pub poll_interval: Duration,
    /// Settings applied to every spawned consumer.
    pub consumer: ConsumerConfig,
}

/// Errors during topic discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The lookup service could not be reached.
    #[error("error talking to lookupd: {0}")]
    Transport(#[from] reqwest::Error),

    /// The lookup service answered with a failure status.
    #[error("lookupd returned status {status}")]
    BadStatus {
        /// Status carried in the lookupd envelope.
        status: u16,
    },

    /// The topic list could not be decoded.
    #[error("could not decode lookupd response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct TopicsEnvelope {
    status_code: u16,
    #[allow(dead_code)]
    #[serde(default)]
    status_txt: String,
    data: TopicList,
}

#[derive(Debug, Deserialize)]
struct TopicList {
    #[serde(default)]
    topics: Vec<String>,
}

/// Handle for requesting an out-of-band topic sweep.
#[derive(Debug, Clone)]
pub struct ReloadHandle(mpsc::Sender<()>);

impl ReloadHandle {
    /// Asks the master to re-fetch the topic list now.
    pub async fn reload(&self) {
        let _ = self.0.send(()).await;
    }
}

/// Maintains one consumer per discovered topic.
pub struct TopicMaster {
    config: MasterConfig,
    factory: Arc<dyn HandlerFactory>,
    topics: RwLock<HashMap<String, ConsumerHandle>>,
    http: reqwest::Client,
    reload_rx: mpsc::Receiver<()>,
}

impl std::fmt::Debug for TopicMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicMaster")
            .field("topic_prefix", &self.config.topic_prefix)
            .field("topics", &self.topics.read().len())
            .finish()
    }
}

impl TopicMaster {
    /// Creates a master. Nothing runs until [`TopicMaster::run`] is awaited.
    pub fn new(config: MasterConfig, factory: Arc<dyn HandlerFactory>) -> (Self, ReloadHandle) {
        let (reload_tx, reload_rx) = mpsc::channel(1);
        (
            Self {
                config,
                factory,
                topics: RwLock::new(HashMap::new()),
                http: reqwest::Client::new(),
                reload_rx,
            },
            ReloadHandle(reload_tx),
        )
    }

    /// Runs the discovery loop until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("topic master started");
        self.sweep().await;

        let period = self.config.poll_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                Some(()) = self.reload_rx.recv() => self.sweep().await,
                _ = shutdown.cancelled() => break,
            }
        }
        info!("topic master stopped");
    }

    /// Topics with a live consumer.
    pub fn known_topics(&self) -> Vec<String> {
        self.topics.read().keys().cloned().collect()
    }

    async fn sweep(&self) {
        debug!("loading topics");
        for lookupd in &self.config.lookupds {
            let topics = match self.fetch_topics(lookupd).await {
                Ok(topics) => topics,
                Err(e) => {
                    warn!(lookupd=%lookupd, error=%e, "topic discovery failed");
                    continue;
                }
            };
            for topic in topics {
                if topic.starts_with(&self.config.topic_prefix) {
                    self.up_consumer(&topic);
                }
            }
        }
    }

    async fn fetch_topics(&self, lookupd: &str) -> Result<Vec<String>, DiscoveryError> {
        let url = if lookupd.starts_with("http://") || lookupd.starts_with("https://") {
            format!("{lookupd}/topics")
        } else {
            format!("http://{lookupd}/topics")
        };

        let body = self.http.get(&url).send().await?.bytes().await?;
        let envelope: TopicsEnvelope = serde_json::from_slice(&body)?;
        if envelope.status_code != 200 {
            return Err(DiscoveryError::BadStatus {
                status: envelope.status_code,
            });
        }
        Ok(envelope.data.topics)
    }

    fn up_consumer(&self, topic: &str) {
        if self.topics.read().contains_key(topic) {
            return;
        }

        let handler = self.factory.handler(topic);
        match consumer::spawn(topic, &self.config.consumer, handler) {
            Ok(handle) => {
                info!(topic, "consumer started");
                self.topics.write().insert(topic.to_string(), handle);
            }
            Err(e) => warn!(topic, error=%e, "starting consumer failed"),
        }
    }
}
