//! # Processing Lanes
//!
//! A fixed pool of worker tasks, each owning a bounded job queue. A campaign
//! id is hashed onto exactly one lane, so every registration and metrics
//! update for that campaign runs on the same task in arrival order while
//! different campaigns proceed in parallel on other lanes.
//!
//! ## Core Design Principles
//!
//! 1.  **Structural Ordering**: Per-campaign ordering follows from routing,
//!     not from a global lock. The lane also owns the campaign's
//!     [`AlertEngine`] state and its event sequence counter, so neither needs
//!     synchronisation.
//!
//! 2.  **Commit Before Publish**: The computed metrics are written to the
//!     registry before any event is published. A publish failure is reported
//!     back as a warning in [`UpdateOutcome`] and never rolls state back.
//!
//! 3.  **Alerts Lead**: Within one update the lane publishes each fired
//!     rule's `PerformanceAlert` followed by its projection, then the
//!     `MetricsUpdated` event.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::alerting::{AlertEngine, AlertFiring, AlertKind};
use super::calculator;
use super::registry::MetricsRegistry;
use crate::bus::events::{BudgetExceeded, MetricsUpdated, PerformanceAlertRaised, PerformanceThreshold};
use crate::bus::{CampaignEvent, EventPublisher};
use crate::configs::SeverityPolicy;
use crate::errors::{PipelineError, PipelineResult};
use crate::models::{CampaignMetrics, CampaignRegistration, MetricsSample, NewCampaign, PerformanceAlert, RawCounters};

/// # Update Outcome
///
/// What one lane job committed and how its events fared on the bus.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    pub metrics: CampaignMetrics,
    /// Alerts raised by this update (informational crossings excluded).
    pub alerts: Vec<PerformanceAlert>,
    pub events_published: usize,
    /// `PublishFailed` descriptions; the update itself still succeeded.
    pub publish_warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registered {
    pub registration: CampaignRegistration,
    #[serde(flatten)]
    pub outcome: UpdateOutcome,
}

pub(crate) enum LaneJob {
    Register {
        campaign: NewCampaign,
        deadline: Option<Instant>,
        reply: oneshot::Sender<PipelineResult<Registered>>,
    },
    Update {
        campaign_id: String,
        sample: MetricsSample,
        deadline: Option<Instant>,
        reply: oneshot::Sender<PipelineResult<UpdateOutcome>>,
    },
}

/// State owned by one lane task.
struct Lane {
    index: usize,
    registry: Arc<MetricsRegistry>,
    publisher: Arc<EventPublisher>,
    engine: AlertEngine,
    sequences: HashMap<String, u64>,
}

impl Lane {
    fn next_sequence(&mut self, campaign_id: &str) -> u64 {
        let sequence = self.sequences.entry(campaign_id.to_string()).or_insert(0);
        *sequence += 1;
        *sequence
    }

    async fn handle(&mut self, job: LaneJob) {
        match job {
            LaneJob::Register {
                campaign,
                deadline,
                reply,
            } => {
                let result = self.register(campaign, deadline).await;
                let _ = reply.send(result);
            }
            LaneJob::Update {
                campaign_id,
                sample,
                deadline,
                reply,
            } => {
                let result = self.update(&campaign_id, sample, deadline).await;
                if reply.send(result).is_err() {
                    tracing::debug!(lane = self.index, campaign_id = %campaign_id, "update caller went away");
                }
            }
        }
    }

    async fn register(&mut self, campaign: NewCampaign, deadline: Option<Instant>) -> PipelineResult<Registered> {
        let now = Utc::now();
        let registration = self.registry.register(campaign, now)?;
        let metrics = calculator::compute(&registration, &RawCounters::default(), now)?;
        self.registry.store_metrics(metrics.clone())?;

        let outcome = self.publish_update(&registration, metrics, Vec::new(), deadline).await;
        Ok(Registered { registration, outcome })
    }

    async fn update(
        &mut self,
        campaign_id: &str,
        sample: MetricsSample,
        deadline: Option<Instant>,
    ) -> PipelineResult<UpdateOutcome> {
        let registration = self.registry.lookup(campaign_id).map_err(|_| {
            PipelineError::InvalidInput(format!("campaign '{}' is not registered", campaign_id))
        })?;
        let base = self
            .registry
            .metrics(campaign_id)
            .map(|metrics| metrics.raw())
            .unwrap_or_default();

        let raw = sample.merge_onto(&base);
        let metrics = calculator::compute(&registration, &raw, Utc::now())?;
        self.registry.store_metrics(metrics.clone())?;

        let fired = self.engine.evaluate(&registration, &metrics);
        Ok(self.publish_update(&registration, metrics, fired, deadline).await)
    }

    /// Publishes alert events then the metrics event, in that order.
    async fn publish_update(
        &mut self,
        registration: &CampaignRegistration,
        metrics: CampaignMetrics,
        fired: Vec<AlertFiring>,
        deadline: Option<Instant>,
    ) -> UpdateOutcome {
        let mut events = Vec::with_capacity(fired.len() * 2 + 1);
        let mut alerts = Vec::new();

        for firing in fired {
            if let Some(alert) = firing.alert {
                let sequence = self.next_sequence(&registration.campaign_id);
                events.push(CampaignEvent::PerformanceAlert(PerformanceAlertRaised {
                    project_id: registration.project_id.clone(),
                    campaign_id: registration.campaign_id.clone(),
                    sequence,
                    timestamp: alert.timestamp,
                    alert: alert.clone(),
                }));
                alerts.push(alert);
            }

            let sequence = self.next_sequence(&registration.campaign_id);
            events.push(projection(registration, sequence, firing.kind, metrics.timestamp));
        }

        let sequence = self.next_sequence(&registration.campaign_id);
        events.push(CampaignEvent::MetricsUpdated(MetricsUpdated {
            project_id: registration.project_id.clone(),
            campaign_id: registration.campaign_id.clone(),
            sequence,
            timestamp: metrics.timestamp,
            metrics: metrics.clone(),
        }));

        let mut events_published = 0;
        let mut publish_warnings = Vec::new();
        for event in &events {
            match self.publisher.publish(event, deadline).await {
                Ok(()) => events_published += 1,
                Err(error) => {
                    tracing::warn!(
                        lane = self.index,
                        campaign_id = %registration.campaign_id,
                        event = event.kind().as_str(),
                        error = %error,
                        "event not delivered, metrics already committed"
                    );
                    publish_warnings.push(error.to_string());
                }
            }
        }

        UpdateOutcome {
            metrics,
            alerts,
            events_published,
            publish_warnings,
        }
    }
}

fn projection(
    registration: &CampaignRegistration,
    sequence: u64,
    kind: AlertKind,
    timestamp: chrono::DateTime<Utc>,
) -> CampaignEvent {
    match kind {
        AlertKind::BudgetExceeded {
            budget_limit,
            current_spend,
            percentage_exceeded,
        } => CampaignEvent::BudgetExceeded(BudgetExceeded {
            project_id: registration.project_id.clone(),
            campaign_id: registration.campaign_id.clone(),
            sequence,
            budget_limit,
            current_spend,
            percentage_exceeded,
            timestamp,
        }),
        AlertKind::Threshold {
            metric_name,
            direction,
            threshold_value,
            current_value,
        } => CampaignEvent::PerformanceThreshold(PerformanceThreshold {
            project_id: registration.project_id.clone(),
            campaign_id: registration.campaign_id.clone(),
            sequence,
            metric_name: metric_name.to_string(),
            threshold_type: direction,
            threshold_value,
            current_value,
            timestamp,
        }),
    }
}

/// # Lane Pool
///
/// Owns the lane senders and task handles.
pub(crate) struct LanePool {
    senders: Vec<mpsc::Sender<LaneJob>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LanePool {
    pub(crate) fn start(
        lane_count: usize,
        queue_depth: usize,
        registry: Arc<MetricsRegistry>,
        publisher: Arc<EventPublisher>,
        severity: SeverityPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        let lane_count = lane_count.max(1);
        let mut senders = Vec::with_capacity(lane_count);
        let mut handles = Vec::with_capacity(lane_count);

        for index in 0..lane_count {
            let (tx, rx) = mpsc::channel(queue_depth.max(1));
            let lane = Lane {
                index,
                registry: Arc::clone(&registry),
                publisher: Arc::clone(&publisher),
                engine: AlertEngine::new(severity.clone()),
                sequences: HashMap::new(),
            };
            handles.push(tokio::spawn(run_lane(lane, rx, shutdown.clone())));
            senders.push(tx);
        }
        tracing::info!(lanes = lane_count, queue_depth, "processing lanes started");

        Self {
            senders,
            handles: Mutex::new(handles),
        }
    }

    pub(crate) fn lane_for(&self, campaign_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        campaign_id.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    pub(crate) async fn submit(&self, campaign_id: &str, job: LaneJob) -> PipelineResult<()> {
        let lane = self.lane_for(campaign_id);
        self.senders[lane]
            .send(job)
            .await
            .map_err(|_| PipelineError::Internal(format!("processing lane {} is not running", lane)))
    }

    pub(crate) fn total(&self) -> usize {
        self.senders.len()
    }

    pub(crate) fn alive(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Waits for every lane task to exit. The shutdown token must already be
    /// cancelled.
    pub(crate) async fn join(&self) {
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(error) = handle.await {
                tracing::error!(error = %error, "processing lane panicked");
            }
        }
    }
}

async fn run_lane(mut lane: Lane, mut rx: mpsc::Receiver<LaneJob>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => lane.handle(job).await,
                None => break,
            }
        }
    }
    tracing::debug!(lane = lane.index, "processing lane stopped");
}
