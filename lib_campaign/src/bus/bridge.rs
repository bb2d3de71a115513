//! # Subscription Bridge
//!
//! Turns the campaign bus topic into live, per-project event streams.
//!
//! ## Core Design Principles:
//!
//! 1.  **Zero-Copy Fan-out**: each decoded event is wrapped in an `Arc` once and
//!     every matching subscriber receives a clone of the pointer.
//!
//! 2.  **Backpressure Isolation**: every subscriber owns a bounded channel. A
//!     subscriber whose queue is full is dropped and logged on the spot; the
//!     bridge never waits on a slow consumer.
//!
//! 3.  **Ordering**: one task reads the bus and pushes to subscribers in bus
//!     order. Since the publisher emits a campaign's events sequentially, a
//!     subscriber sees one campaign's events in sequence order. Nothing is
//!     promised across campaigns.
//!
//! 4.  **Reconnect**: when the bus stream ends the bridge backs off and
//!     resubscribes. Attached subscribers stay registered and simply receive
//!     nothing until the bus is back.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{BusStream, CampaignEvent, EventBus, EventKind};
use crate::configs::ReconnectSettings;

/// An internal representation of one attached subscriber.
struct SubscriberHandle {
    id: u64,
    /// `None` means every event kind.
    kinds: Option<HashSet<EventKind>>,
    sender: mpsc::Sender<Arc<CampaignEvent>>,
}

impl SubscriberHandle {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().map_or(true, |kinds| kinds.contains(&kind))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStats {
    pub subscribers: usize,
    pub delivered: u64,
    pub dropped_subscribers: u64,
    pub undecodable: u64,
    pub reconnects: u64,
}

pub struct SubscriptionBridge {
    /// Subscribers grouped by the project they listen to.
    subscribers: Mutex<HashMap<String, Vec<SubscriberHandle>>>,
    next_id: AtomicU64,
    queue_depth: usize,
    connected: AtomicBool,
    delivered: AtomicU64,
    dropped_subscribers: AtomicU64,
    undecodable: AtomicU64,
    reconnects: AtomicU64,
}

impl SubscriptionBridge {
    pub fn new(queue_depth: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
            connected: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            dropped_subscribers: AtomicU64::new(0),
            undecodable: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<SubscriberHandle>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Subscribe
    ///
    /// Registers interest in `project_id`. `kinds` narrows the stream to the
    /// given event kinds; `None` receives everything. Dropping or cancelling
    /// the returned [`Subscription`] deregisters it immediately.
    pub fn subscribe(self: &Arc<Self>, project_id: &str, kinds: Option<HashSet<EventKind>>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.lock()
            .entry(project_id.to_string())
            .or_default()
            .push(SubscriberHandle { id, kinds, sender: tx });
        tracing::info!(subscriber_id = id, project_id = %project_id, "subscriber attached");

        Subscription {
            id,
            project_id: project_id.to_string(),
            receiver: rx,
            bridge: Arc::downgrade(self),
        }
    }

    fn remove(&self, project_id: &str, id: u64) {
        let mut subscribers = self.lock();
        if let Some(handles) = subscribers.get_mut(project_id) {
            handles.retain(|handle| handle.id != id);
            if handles.is_empty() {
                subscribers.remove(project_id);
            }
        }
        tracing::info!(subscriber_id = id, project_id = %project_id, "subscriber detached");
    }

    /// Drops every subscriber so their streams end.
    fn close_all(&self) {
        let closed: usize = self.lock().drain().map(|(_, handles)| handles.len()).sum();
        tracing::info!(closed, "subscription bridge shutting down");
    }

    /// # Deliver
    ///
    /// Pushes one event to every subscriber of its project without waiting.
    /// Subscribers with a full queue are dropped (their stream ends), and
    /// subscribers whose receiver is gone are cleaned up.
    pub fn deliver(&self, event: CampaignEvent) {
        let kind = event.kind();
        let frame = Arc::new(event);
        let mut subscribers = self.lock();

        let Some(handles) = subscribers.get_mut(frame.project_id()) else {
            return;
        };

        handles.retain(|handle| {
            if !handle.wants(kind) {
                return true;
            }
            match handle.sender.try_send(Arc::clone(&frame)) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped_subscribers.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        subscriber_id = handle.id,
                        project_id = %frame.project_id(),
                        queue_depth = self.queue_depth,
                        "subscriber too slow, dropping it"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(subscriber_id = handle.id, "subscriber receiver gone, removing");
                    false
                }
            }
        });

        if handles.is_empty() {
            let project_id = frame.project_id().to_string();
            subscribers.remove(&project_id);
        }
    }

    /// Decodes a raw bus payload and delivers it.
    pub fn deliver_raw(&self, subject: &str, payload: &[u8]) {
        match CampaignEvent::from_json(payload) {
            Ok(event) => self.deliver(event),
            Err(error) => {
                self.undecodable.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(subject = %subject, error = %error, "dropping undecodable bus message");
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            subscribers: self.subscriber_count(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_subscribers: self.dropped_subscribers.load(Ordering::Relaxed),
            undecodable: self.undecodable.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    /// # Run
    ///
    /// Consumes the bus until `shutdown` fires. `initial` is an already-open
    /// stream (so callers can guarantee the bridge is attached before they
    /// publish); without one the loop subscribes itself.
    pub async fn run(
        self: Arc<Self>,
        bus: Arc<dyn EventBus>,
        pattern: String,
        initial: Option<BusStream>,
        reconnect: ReconnectSettings,
        shutdown: CancellationToken,
    ) {
        let mut pending = initial;
        let mut attempt: u32 = 0;

        loop {
            let stream = match pending.take() {
                Some(stream) => Some(stream),
                None => match bus.subscribe(&pattern).await {
                    Ok(stream) => {
                        if attempt > 0 {
                            self.reconnects.fetch_add(1, Ordering::Relaxed);
                            tracing::info!(bus = bus.name(), attempt, "bus subscription restored");
                        }
                        Some(stream)
                    }
                    Err(error) => {
                        tracing::warn!(bus = bus.name(), error = %error, "bus subscribe failed");
                        None
                    }
                },
            };

            if let Some(mut stream) = stream {
                self.connected.store(true, Ordering::SeqCst);
                attempt = 0;
                tracing::info!(bus = bus.name(), pattern = %pattern, "bridge attached to bus");

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            self.connected.store(false, Ordering::SeqCst);
                            self.close_all();
                            return;
                        }
                        next = stream.next() => match next {
                            Some(msg) => self.deliver_raw(&msg.subject, &msg.payload),
                            None => break,
                        }
                    }
                }

                self.connected.store(false, Ordering::SeqCst);
                tracing::warn!(bus = bus.name(), "bus stream ended, bridge disconnected");
            }

            let delay = reconnect.delay_for(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.close_all();
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// # Subscription
///
/// The receiving end of one live stream. Dropping it deregisters the
/// subscriber and releases its queue.
pub struct Subscription {
    id: u64,
    project_id: String,
    receiver: mpsc::Receiver<Arc<CampaignEvent>>,
    bridge: Weak<SubscriptionBridge>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Next event, or `None` once the bridge dropped this subscriber or shut
    /// down.
    pub async fn recv(&mut self) -> Option<Arc<CampaignEvent>> {
        self.receiver.recv().await
    }

    /// Like [`Subscription::recv`] but returns `None` as soon as `cancel`
    /// fires, deregistering the subscriber.
    pub async fn recv_until(&mut self, cancel: &CancellationToken) -> Option<Arc<CampaignEvent>> {
        tokio::select! {
            _ = cancel.cancelled() => {
                self.detach();
                None
            }
            event = self.receiver.recv() => event,
        }
    }

    fn detach(&mut self) {
        self.receiver.close();
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.remove(&self.project_id, self.id);
        }
        self.bridge = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::events::MetricsUpdated;
    use crate::bus::InMemoryBus;
    use crate::models::{CampaignMetrics, Platform};
    use chrono::Utc;

    fn metrics_event(project: &str, campaign: &str, sequence: u64) -> CampaignEvent {
        let now = Utc::now();
        CampaignEvent::MetricsUpdated(MetricsUpdated {
            project_id: project.into(),
            campaign_id: campaign.into(),
            sequence,
            metrics: CampaignMetrics {
                campaign_id: campaign.into(),
                campaign_name: String::new(),
                platform: Platform::Meta,
                impressions: 0,
                clicks: 0,
                spend: 0.0,
                conversions: 0,
                revenue: 0.0,
                ctr: 0.0,
                cpc: 0.0,
                cpm: 0.0,
                roas: 0.0,
                timestamp: now,
                date: now.format("%Y-%m-%d").to_string(),
            },
            timestamp: now,
        })
    }

    #[tokio::test]
    async fn demultiplexes_by_project() {
        let bridge = SubscriptionBridge::new(8);
        let mut p1 = bridge.subscribe("P1", None);
        let mut p2 = bridge.subscribe("P2", None);

        bridge.deliver(metrics_event("P1", "C1", 1));
        bridge.deliver(metrics_event("P2", "C2", 1));

        assert_eq!(p1.recv().await.unwrap().campaign_id(), "C1");
        assert_eq!(p2.recv().await.unwrap().campaign_id(), "C2");
        assert!(p1.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn kind_filter_skips_unwanted_events() {
        let bridge = SubscriptionBridge::new(8);
        let kinds = HashSet::from([EventKind::BudgetExceeded]);
        let mut only_budget = bridge.subscribe("P1", Some(kinds));

        bridge.deliver(metrics_event("P1", "C1", 1));
        assert!(only_budget.receiver.try_recv().is_err());
        assert_eq!(bridge.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_without_blocking_others() {
        let bridge = SubscriptionBridge::new(2);
        let mut slow = bridge.subscribe("P1", None);
        let mut fast = bridge.subscribe("P1", None);

        for sequence in 1..=3 {
            bridge.deliver(metrics_event("P1", "C1", sequence));
            // The fast subscriber keeps its queue drained.
            assert_eq!(fast.recv().await.unwrap().sequence(), sequence);
        }

        assert_eq!(bridge.subscriber_count(), 1);
        assert_eq!(bridge.stats().dropped_subscribers, 1);
        // The slow one still gets what was queued, then its stream ends.
        assert_eq!(slow.recv().await.unwrap().sequence(), 1);
        assert_eq!(slow.recv().await.unwrap().sequence(), 2);
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_or_cancelling_deregisters() {
        let bridge = SubscriptionBridge::new(4);
        let first = bridge.subscribe("P1", None);
        let mut second = bridge.subscribe("P1", None);
        assert_eq!(bridge.subscriber_count(), 2);

        drop(first);
        assert_eq!(bridge.subscriber_count(), 1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(second.recv_until(&cancel).await.is_none());
        assert_eq!(bridge.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn undecodable_payloads_are_counted_not_fatal() {
        let bridge = SubscriptionBridge::new(4);
        bridge.deliver_raw("zamc.events.campaign.metrics_updated", b"not json");
        assert_eq!(bridge.stats().undecodable, 1);
    }

    #[tokio::test]
    async fn reattaches_after_bus_outage_and_keeps_subscribers() {
        let bus = Arc::new(InMemoryBus::default());
        let bridge = SubscriptionBridge::new(8);
        let mut sub = bridge.subscribe("P1", None);
        let shutdown = CancellationToken::new();
        let reconnect = ReconnectSettings {
            base_delay_ms: 5,
            max_delay_ms: 20,
        };

        let initial = bus.subscribe("zamc.events.campaign.*").await.unwrap();
        let task = tokio::spawn(Arc::clone(&bridge).run(
            bus.clone(),
            "zamc.events.campaign.*".to_string(),
            Some(initial),
            reconnect,
            shutdown.clone(),
        ));

        bus.set_connected(false);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(!bridge.is_connected());

        bus.set_connected(true);
        let mut waited = 0;
        while !bridge.is_connected() && waited < 100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            waited += 1;
        }
        assert!(bridge.is_connected());
        assert_eq!(bridge.subscriber_count(), 1);

        let event = metrics_event("P1", "C1", 7);
        bus.publish(&event.subject("zamc"), event.to_json().unwrap())
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().sequence(), 7);

        shutdown.cancel();
        task.await.unwrap();
        assert!(sub.recv().await.is_none());
        assert_eq!(bridge.subscriber_count(), 0);
    }
}
