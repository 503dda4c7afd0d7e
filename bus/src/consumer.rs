//! One long-lived consumer per topic.
//!
//! The bus client library owns the connection management (lookupd polling,
//! reconnects, heartbeats); this module owns the handler concurrency and
//! the ack/requeue decision.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use observability_deps::tracing::{debug, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_nsq::{
    NSQChannel, NSQConsumerConfig, NSQConsumerConfigSources, NSQConsumerLookupConfig, NSQMessage,
    NSQRequeueDelay, NSQTopic,
};

use crate::MessageHandler;

/// Per-consumer tuning, shared by every topic of a master.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Channel name every consumer subscribes with.
    pub channel: String,
    /// Lookup service addresses (`host:port` or full URLs).
    pub lookupds: Vec<String>,
    /// Messages redelivered more often than this are dropped. Zero
    /// disables the limit.
    pub max_attempts: u16,
    /// Upper bound on unacked messages the bus hands this consumer.
    pub max_in_flight: u32,
    /// Number of concurrently running handler invocations per topic.
    pub handler_count: usize,
    /// How often the client re-polls the lookup service for producers.
    pub lookupd_poll_interval: Duration,
}

/// Errors creating a consumer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The topic name is not valid on the bus.
    #[error("invalid topic name {topic:?}")]
    InvalidTopic {
        /// The offending name.
        topic: String,
    },

    /// The channel name is not valid on the bus.
    #[error("invalid channel name {channel:?}")]
    InvalidChannel {
        /// The offending name.
        channel: String,
    },
}

/// A running consumer. Dropping the handle does not stop it; consumers
/// live for the process lifetime.
#[derive(Debug)]
pub struct ConsumerHandle {
    topic: String,
    #[allow(dead_code)]
    pump: JoinHandle<()>,
}

impl ConsumerHandle {
    /// The topic this consumer is bound to.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Starts a consumer for `topic` feeding `handler`.
///
/// The returned handle is informational; the consumer keeps running on its
/// own tasks.
pub fn spawn(
    topic: &str,
    config: &ConsumerConfig,
    handler: Arc<dyn MessageHandler>,
) -> Result<ConsumerHandle, Error> {
    let nsq_topic = NSQTopic::new(topic.to_string()).ok_or_else(|| Error::InvalidTopic {
        topic: topic.to_string(),
    })?;
    let nsq_channel =
        NSQChannel::new(config.channel.clone()).ok_or_else(|| Error::InvalidChannel {
            channel: config.channel.clone(),
        })?;

    let addresses: HashSet<String> = config
        .lookupds
        .iter()
        .map(|l| lookupd_url(l))
        .collect();

    let mut consumer = NSQConsumerConfig::new(nsq_topic, nsq_channel)
        .set_max_in_flight(config.max_in_flight)
        .set_sources(NSQConsumerConfigSources::Lookup(
            NSQConsumerLookupConfig::new()
                .set_poll_interval(config.lookupd_poll_interval)
                .set_addresses(addresses),
        ))
        .build();

    let handler_slots = Arc::new(Semaphore::new(config.handler_count.max(1)));
    let max_attempts = config.max_attempts;
    let topic_name = topic.to_string();

    let pump = tokio::spawn(async move {
        loop {
            // taking the slot before pulling the next message is what
            // propagates handler backpressure into the bus pull rate
            let permit = Arc::clone(&handler_slots)
                .acquire_owned()
                .await
                .expect("handler semaphore closed");

            match consumer.consume_filtered().await {
                Some(message) => {
                    let handler = Arc::clone(&handler);
                    let topic_name = topic_name.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        process(&topic_name, message, handler.as_ref(), max_attempts).await;
                    });
                }
                None => {
                    warn!(topic=%topic_name, "bus consumer stream ended");
                    break;
                }
            }
        }
    });

    Ok(ConsumerHandle {
        topic: topic.to_string(),
        pump,
    })
}

async fn process(
    topic: &str,
    message: NSQMessage,
    handler: &dyn MessageHandler,
    max_attempts: u16,
) {
    if max_attempts > 0 && message.attempt > max_attempts {
        warn!(
            topic,
            attempt = message.attempt,
            max_attempts,
            "dropping message over the attempt limit"
        );
        message.finish().await;
        return;
    }

    match handler.handle(&message.body).await {
        Ok(()) => {
            debug!(topic, "message handled");
            message.finish().await;
        }
        Err(e) => {
            warn!(topic, error=%e, "message handling failed, requeueing");
            message.requeue(NSQRequeueDelay::DefaultDelay).await;
        }
    }
}

fn lookupd_url(lookupd: &str) -> String {
    if lookupd.starts_with("http://") || lookupd.starts_with("https://") {
        lookupd.to_string()
    } else {
        format!("http://{lookupd}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookupd_urls_gain_a_scheme() {
        assert_eq!(lookupd_url("10.0.0.1:4161"), "http://10.0.0.1:4161");
        assert_eq!(
            lookupd_url("http://10.0.0.1:4161"),
            "http://10.0.0.1:4161"
        );
    }
}
