//! # In-Process Bus
//!
//! A `tokio::sync::broadcast` backed [`EventBus`]. Used when no external bus
//! is configured and throughout the tests. The connection can be toggled to
//! exercise the publisher retry path and the bridge reconnect loop.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::{broadcast, watch};

use super::{subject_matches, BusError, BusMessage, BusStream, EventBus};

pub struct InMemoryBus {
    tx: broadcast::Sender<BusMessage>,
    /// Connection state; open streams watch it and end on disconnect.
    connected: watch::Sender<bool>,
    /// Number of upcoming publishes that fail with a transport error.
    failures_to_inject: AtomicU32,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let (connected, _) = watch::channel(true);
        Self {
            tx,
            connected,
            failures_to_inject: AtomicU32::new(0),
        }
    }

    /// Simulates losing or regaining the broker. Disconnecting ends every
    /// open subscription stream.
    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Makes the next `count` publishes fail with a transient error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.failures_to_inject.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Disconnected("in-memory bus is offline".to_string()));
        }
        if self.take_injected_failure() {
            return Err(BusError::Transport("injected publish failure".to_string()));
        }
        // No receivers is not an error: nobody is listening yet.
        let _ = self.tx.send(BusMessage {
            subject: subject.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<BusStream, BusError> {
        if !self.is_connected() {
            return Err(BusError::Disconnected("in-memory bus is offline".to_string()));
        }
        let rx = self.tx.subscribe();
        let state = self.connected.subscribe();
        let pattern = pattern.to_string();

        let messages = stream::unfold((rx, state, pattern), |(mut rx, mut state, pattern)| async move {
            loop {
                if !*state.borrow_and_update() {
                    return None;
                }
                tokio::select! {
                    changed = state.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                    received = rx.recv() => match received {
                        Ok(msg) if subject_matches(&pattern, &msg.subject) => {
                            return Some((msg, (rx, state, pattern)));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "in-memory bus subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(Box::pin(messages))
    }

    async fn ping(&self) -> Result<(), BusError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BusError::Disconnected("in-memory bus is offline".to_string()))
        }
    }
}
