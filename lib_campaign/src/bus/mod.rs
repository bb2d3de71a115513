//! # Message Bus Layer
//!
//! Everything between the alerting engine and live subscribers:
//!
//! - **`events`**: the typed event payloads and their JSON wire shape.
//! - **`publisher`**: serializes events onto the bus with bounded,
//!   exponential-backoff retries.
//! - **`bridge`**: consumes the bus and fans events out to per-project
//!   subscribers over bounded channels.
//! - **`memory`**: the in-process [`EventBus`] used by default and in tests.
//!
//! The Redis transport lives in `crate::connections::redis_bus`, behind the
//! `connections` feature.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

/// Fan-out of bus events to live, per-project subscribers.
pub mod bridge;
/// Typed campaign events and their JSON shape.
pub mod events;
/// In-process broadcast bus.
pub mod memory;
/// Retrying event publisher.
pub mod publisher;

pub use bridge::{BridgeStats, Subscription, SubscriptionBridge};
pub use events::{CampaignEvent, EventKind};
pub use memory::InMemoryBus;
pub use publisher::{EventPublisher, PublisherStats};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus disconnected: {0}")]
    Disconnected(String),
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("bus closed")]
    Closed,
}

/// One raw message as carried by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

pub type BusStream = Pin<Box<dyn Stream<Item = BusMessage> + Send>>;

/// # Event Bus
///
/// The transport seam. Implementations only move bytes; typing, sequencing
/// and retries live above this trait.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Short transport name for health reports.
    fn name(&self) -> &'static str;

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Opens a stream of every message whose subject matches `pattern`
    /// (a glob with a trailing `*`, as in Redis `PSUBSCRIBE`). The stream
    /// ends when the underlying connection is lost.
    async fn subscribe(&self, pattern: &str) -> Result<BusStream, BusError>;

    async fn ping(&self) -> Result<(), BusError>;
}

/// Glob match supporting a single trailing `*`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => subject.starts_with(prefix),
        None => pattern == subject,
    }
}

/// Subscription pattern covering every campaign event under `prefix`.
pub fn campaign_pattern(prefix: &str) -> String {
    format!("{}.events.campaign.*", prefix)
}
