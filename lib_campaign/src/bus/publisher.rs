//! # Event Publisher
//!
//! Turns typed [`CampaignEvent`]s into bus messages. Transient bus failures
//! are retried with bounded exponential backoff; when the retries (or the
//! caller's deadline) run out the publish resolves to `PublishFailed`.
//! Callers treat that as a warning: the metric state behind the event has
//! already been committed, so delivery is best-effort, at-least-once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time::Instant;

use super::{CampaignEvent, EventBus};
use crate::configs::RetrySettings;
use crate::errors::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherStats {
    pub published: u64,
    pub retries: u64,
    pub failed: u64,
}

pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
    subject_prefix: String,
    retry: RetrySettings,
    published: AtomicU64,
    retries: AtomicU64,
    failed: AtomicU64,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus>, subject_prefix: impl Into<String>, retry: RetrySettings) -> Self {
        Self {
            bus,
            subject_prefix: subject_prefix.into(),
            retry,
            published: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn subject_prefix(&self) -> &str {
        &self.subject_prefix
    }

    /// # Publish
    ///
    /// Serializes `event` and hands it to the bus, retrying transient errors
    /// up to `max_retries` times. The effective deadline is the earlier of the
    /// caller's `deadline` and the configured publish timeout; reaching it
    /// aborts the remaining retries.
    pub async fn publish(&self, event: &CampaignEvent, deadline: Option<Instant>) -> PipelineResult<()> {
        let subject = event.subject(&self.subject_prefix);
        let payload = event.to_json()?;
        let deadline = self.effective_deadline(deadline);

        let mut attempt: u32 = 0;
        loop {
            let outcome = match deadline {
                Some(at) => match tokio::time::timeout_at(at, self.bus.publish(&subject, payload.clone())).await {
                    Ok(result) => result,
                    Err(_) => return Err(self.give_up(&subject, event, "deadline exceeded")),
                },
                None => self.bus.publish(&subject, payload.clone()).await,
            };

            let error = match outcome {
                Ok(()) => {
                    self.published.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        subject = %subject,
                        campaign_id = %event.campaign_id(),
                        sequence = event.sequence(),
                        "published event"
                    );
                    return Ok(());
                }
                Err(error) => error,
            };

            if attempt >= self.retry.max_retries {
                return Err(self.give_up(&subject, event, &error.to_string()));
            }

            let delay = self.retry.delay_for(attempt);
            if let Some(at) = deadline {
                if Instant::now() + delay >= at {
                    return Err(self.give_up(&subject, event, "deadline exceeded"));
                }
            }

            attempt += 1;
            self.retries.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                subject = %subject,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "publish failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.published.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn effective_deadline(&self, caller: Option<Instant>) -> Option<Instant> {
        let configured = self.retry.timeout().map(|timeout| Instant::now() + timeout);
        match (caller, configured) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn give_up(&self, subject: &str, event: &CampaignEvent, reason: &str) -> PipelineError {
        self.failed.fetch_add(1, Ordering::Relaxed);
        PipelineError::PublishFailed(format!(
            "{} (campaign '{}', sequence {}): {}",
            subject,
            event.campaign_id(),
            event.sequence(),
            reason
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::events::BudgetExceeded;
    use crate::bus::InMemoryBus;
    use chrono::Utc;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn event() -> CampaignEvent {
        CampaignEvent::BudgetExceeded(BudgetExceeded {
            project_id: "P1".into(),
            campaign_id: "C1".into(),
            sequence: 1,
            budget_limit: 100.0,
            current_spend: 150.0,
            percentage_exceeded: 50.0,
            timestamp: Utc::now(),
        })
    }

    fn fast_retry(max_retries: u32) -> RetrySettings {
        RetrySettings {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 5,
            timeout_ms: 0,
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_then_delivers() {
        let bus = Arc::new(InMemoryBus::default());
        let mut stream = bus.subscribe("zamc.events.campaign.*").await.unwrap();
        bus.fail_next_publishes(2);

        let publisher = EventPublisher::new(bus.clone(), "zamc", fast_retry(3));
        publisher.publish(&event(), None).await.unwrap();

        let msg = stream.next().await.unwrap();
        assert_eq!(msg.subject, "zamc.events.campaign.budget_exceeded");
        let stats = publisher.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_retries() {
        let bus = Arc::new(InMemoryBus::default());
        bus.fail_next_publishes(10);

        let publisher = EventPublisher::new(bus, "zamc", fast_retry(2));
        let err = publisher.publish(&event(), None).await.unwrap_err();

        assert!(matches!(err, PipelineError::PublishFailed(_)));
        assert_eq!(publisher.stats().retries, 2);
        assert_eq!(publisher.stats().failed, 1);
    }

    #[tokio::test]
    async fn deadline_aborts_retries() {
        let bus = Arc::new(InMemoryBus::default());
        bus.set_connected(false);

        let retry = RetrySettings {
            max_retries: 50,
            base_delay_ms: 20,
            max_delay_ms: 20,
            timeout_ms: 0,
        };
        let publisher = EventPublisher::new(bus, "zamc", retry);
        let started = Instant::now();
        let err = publisher
            .publish(&event(), Some(Instant::now() + Duration::from_millis(50)))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("deadline exceeded"));
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
