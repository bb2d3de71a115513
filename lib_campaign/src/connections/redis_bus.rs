//! # Redis Bus Implementation
//!
//! Provides an [`EventBus`] on top of Redis pub/sub. Publishing goes through a
//! lazily created `ConnectionManager` (which reconnects on its own); every
//! subscription opens a dedicated pub/sub connection whose message stream ends
//! when the connection drops, which is what drives the bridge reconnect loop.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::Mutex;

use crate::bus::{BusError, BusMessage, BusStream, EventBus};

impl From<RedisError> for BusError {
    fn from(value: RedisError) -> Self {
        if value.is_connection_dropped() || value.is_connection_refusal() || value.is_io_error() {
            BusError::Disconnected(value.to_string())
        } else {
            BusError::Transport(value.to_string())
        }
    }
}

/// A handler for Redis pub/sub interactions.
pub struct RedisBus {
    /// The internal Redis client instance.
    client: Client,
    /// Shared publishing connection, created on first use.
    publisher: Mutex<Option<ConnectionManager>>,
}

impl RedisBus {
    /// Creates a new RedisBus from a connection string.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    pub fn new(url: &str) -> Result<Self, BusError> {
        // Only parses the URL; no connection is made until first use.
        let client = Client::open(url)?;
        Ok(Self {
            client,
            publisher: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, BusError> {
        let mut guard = self.publisher.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = ConnectionManager::new(self.client.clone()).await?;
        tracing::info!("connected to redis bus");
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl EventBus for RedisBus {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        let _: () = conn.publish(subject, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<BusStream, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        tracing::info!(pattern = %pattern, "redis pattern subscription opened");

        let messages = pubsub.into_on_message().map(|msg| BusMessage {
            subject: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        });
        Ok(Box::pin(messages))
    }

    async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_urls() {
        assert!(RedisBus::new("not a redis url").is_err());
    }

    #[test]
    fn accepts_well_formed_urls_without_connecting() {
        let bus = RedisBus::new("redis://127.0.0.1:6399/").unwrap();
        assert_eq!(bus.name(), "redis");
    }
}
