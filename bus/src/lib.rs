//! Subscription layer over the message bus.
//!
//! The [`master::TopicMaster`] discovers topics on the lookup service and
//! keeps one consumer alive per topic matching the configured prefix. What
//! happens to a message is decided by a [`MessageHandler`], so the routing
//! logic lives with the routing crates and this crate only knows about
//! bytes, acks and requeues.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::sync::Arc;

use async_trait::async_trait;

pub mod consumer;
pub mod master;

pub use consumer::{ConsumerConfig, ConsumerHandle};
pub use master::{MasterConfig, ReloadHandle, TopicMaster};

/// Errors a handler may surface. Boxed so handlers of any crate can flow
/// their own error types through unchanged.
pub type BusError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one bus message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handles one message body.
    ///
    /// `Ok` acknowledges the message; `Err` requeues it so the bus
    /// redelivers (up to the configured attempt limit).
    async fn handle(&self, body: &[u8]) -> Result<(), BusError>;
}

/// Creates the handler for a newly discovered topic.
pub trait HandlerFactory: Send + Sync + 'static {
    /// Returns the handler every consumer of `topic` will use.
    fn handler(&self, topic: &str) -> Arc<dyn MessageHandler>;
}
