//! # Campaign Pipeline
//!
//! The façade the query layer talks to. It wires the registry, the processing
//! lanes, the event publisher and the subscription bridge together and owns
//! their background tasks.
//!
//! Data flow for one metrics update:
//!
//! ```text
//!   update_metrics ──► lane(campaign) ──► registry.lookup ──► calculator
//!                                          │
//!                          registry.store ◄┘──► alert engine ──► publisher ──► bus
//!                                                                              │
//!                   live subscribers ◄── subscription bridge ◄─────────────────┘
//! ```

pub mod alerting;
pub mod calculator;
pub mod lanes;
pub mod registry;
pub mod simulator;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bus::{campaign_pattern, EventBus, EventKind, EventPublisher, PublisherStats, Subscription, SubscriptionBridge};
use crate::configs::PipelineSettings;
use crate::errors::{PipelineError, PipelineResult};
use crate::models::{CampaignMetrics, CampaignRegistration, MetricsSample, NewCampaign, RegistrationUpdate};

pub use alerting::{AlertEngine, AlertFiring, AlertKind, AlertRule, RuleState};
pub use lanes::{Registered, UpdateOutcome};
pub use registry::MetricsRegistry;

use lanes::{LaneJob, LanePool};

const PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// # Health Report
///
/// Bus connectivity plus liveness of the background evaluation machinery.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub bus: String,
    pub bus_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus_error: Option<String>,
    pub bridge_connected: bool,
    pub lanes_alive: usize,
    pub lanes_total: usize,
    pub monitoring_active: bool,
    pub active_campaigns: usize,
    pub live_subscribers: usize,
    pub publisher: PublisherStats,
}

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub(crate) struct PipelineInner {
    settings: PipelineSettings,
    registry: Arc<MetricsRegistry>,
    publisher: Arc<EventPublisher>,
    bridge: Arc<SubscriptionBridge>,
    lanes: LanePool,
    shutdown: CancellationToken,
    bridge_task: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<MonitorHandle>>,
}

/// # Campaign Pipeline
///
/// Cheap to clone; every clone drives the same pipeline.
#[derive(Clone)]
pub struct CampaignPipeline {
    inner: Arc<PipelineInner>,
}

impl CampaignPipeline {
    /// # Start
    ///
    /// Spawns the processing lanes and the subscription bridge. The bridge's
    /// first bus subscription is opened before this returns, so nothing
    /// published afterwards can slip past it. If the bus is unreachable the
    /// pipeline still starts; the bridge keeps retrying in the background.
    pub async fn start(settings: PipelineSettings, bus: Arc<dyn EventBus>) -> Self {
        let shutdown = CancellationToken::new();
        let registry = Arc::new(MetricsRegistry::new(settings.default_thresholds));
        let publisher = Arc::new(EventPublisher::new(
            Arc::clone(&bus),
            settings.subject_prefix.clone(),
            settings.publish.clone(),
        ));
        let bridge = SubscriptionBridge::new(settings.subscriber_queue_depth);

        let pattern = campaign_pattern(&settings.subject_prefix);
        let initial = match bus.subscribe(&pattern).await {
            Ok(stream) => Some(stream),
            Err(error) => {
                tracing::warn!(bus = bus.name(), error = %error, "bus unavailable at start-up, bridge will retry");
                None
            }
        };
        let bridge_task = tokio::spawn(Arc::clone(&bridge).run(
            Arc::clone(&bus),
            pattern,
            initial,
            settings.reconnect.clone(),
            shutdown.child_token(),
        ));

        let lanes = LanePool::start(
            settings.lane_count,
            settings.lane_queue_depth,
            Arc::clone(&registry),
            Arc::clone(&publisher),
            settings.severity.clone(),
            shutdown.child_token(),
        );

        let simulate = settings.simulator.enabled;
        let pipeline = Self {
            inner: Arc::new(PipelineInner {
                settings,
                registry,
                publisher,
                bridge,
                lanes,
                shutdown,
                bridge_task: Mutex::new(Some(bridge_task)),
                monitor: Mutex::new(None),
            }),
        };
        tracing::info!(bus = bus.name(), "campaign pipeline started");

        if simulate {
            pipeline.start_monitoring();
        }
        pipeline
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.inner.registry
    }

    pub(crate) fn downgrade(&self) -> Weak<PipelineInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<PipelineInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Registers a campaign with zeroed counters and publishes its first
    /// `MetricsUpdated` event.
    pub async fn register(&self, campaign: NewCampaign) -> PipelineResult<Registered> {
        let campaign_id = campaign.campaign_id.clone();
        let deadline = self.default_deadline();
        let (reply, rx) = oneshot::channel();
        self.inner
            .lanes
            .submit(&campaign_id, LaneJob::Register { campaign, deadline, reply })
            .await?;
        await_reply(rx).await
    }

    pub fn update_registration(
        &self,
        campaign_id: &str,
        update: RegistrationUpdate,
    ) -> PipelineResult<CampaignRegistration> {
        self.inner.registry.update_registration(campaign_id, update)
    }

    pub fn lookup(&self, campaign_id: &str) -> PipelineResult<CampaignRegistration> {
        self.inner.registry.lookup(campaign_id)
    }

    /// # Update Metrics
    ///
    /// Routes the sample onto the campaign's lane and waits for it to be
    /// committed. Undelivered events show up in
    /// [`UpdateOutcome::publish_warnings`], not as an error.
    pub async fn update_metrics(&self, campaign_id: &str, sample: MetricsSample) -> PipelineResult<UpdateOutcome> {
        self.submit_update(campaign_id, sample, self.default_deadline()).await
    }

    /// Same as [`Self::update_metrics`], with a deadline covering the publish
    /// retries of this update.
    pub async fn update_metrics_with_deadline(
        &self,
        campaign_id: &str,
        sample: MetricsSample,
        timeout: Duration,
    ) -> PipelineResult<UpdateOutcome> {
        self.submit_update(campaign_id, sample, Some(Instant::now() + timeout)).await
    }

    async fn submit_update(
        &self,
        campaign_id: &str,
        sample: MetricsSample,
        deadline: Option<Instant>,
    ) -> PipelineResult<UpdateOutcome> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .lanes
            .submit(
                campaign_id,
                LaneJob::Update {
                    campaign_id: campaign_id.to_string(),
                    sample,
                    deadline,
                    reply,
                },
            )
            .await?;
        await_reply(rx).await
    }

    pub fn get_metrics(&self, campaign_id: &str) -> PipelineResult<CampaignMetrics> {
        self.inner.registry.metrics(campaign_id)
    }

    pub fn get_project_campaigns(&self, project_id: &str) -> Vec<CampaignMetrics> {
        self.inner.registry.project_campaigns(project_id)
    }

    /// Live stream of `project_id`'s events, optionally restricted to `kinds`.
    pub fn subscribe(&self, project_id: &str, kinds: Option<HashSet<EventKind>>) -> Subscription {
        self.inner.bridge.subscribe(project_id, kinds)
    }

    pub fn bridge(&self) -> &Arc<SubscriptionBridge> {
        &self.inner.bridge
    }

    pub fn publisher_stats(&self) -> PublisherStats {
        self.inner.publisher.stats()
    }

    /// # Health Check
    pub async fn health_check(&self) -> HealthReport {
        let bus = self.inner.publisher.bus();
        let ping = match tokio::time::timeout(PING_TIMEOUT, bus.ping()).await {
            Ok(result) => result.map_err(|error| error.to_string()),
            Err(_) => Err("ping timed out".to_string()),
        };
        let lanes_alive = self.inner.lanes.alive();
        let lanes_total = self.inner.lanes.total();
        let bridge_connected = self.inner.bridge.is_connected();

        let status = match (&ping, lanes_alive) {
            (Err(_), _) | (_, 0) => HealthStatus::Unhealthy,
            (Ok(()), alive) if alive < lanes_total || !bridge_connected => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        };

        HealthReport {
            status,
            bus: bus.name().to_string(),
            bus_connected: ping.is_ok(),
            bus_error: ping.err(),
            bridge_connected,
            lanes_alive,
            lanes_total,
            monitoring_active: self.is_monitoring(),
            active_campaigns: self.inner.registry.len(),
            live_subscribers: self.inner.bridge.subscriber_count(),
            publisher: self.inner.publisher.stats(),
        }
    }

    /// Starts the simulated-metrics loop. Returns `false` when it is already
    /// running.
    pub fn start_monitoring(&self) -> bool {
        let mut monitor = self.inner.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.as_ref().is_some_and(|handle| !handle.task.is_finished()) {
            return false;
        }
        let cancel = self.inner.shutdown.child_token();
        let task = tokio::spawn(simulator::run(
            self.downgrade(),
            self.inner.settings.simulator.clone(),
            cancel.clone(),
        ));
        *monitor = Some(MonitorHandle { cancel, task });
        tracing::info!("campaign monitoring started");
        true
    }

    /// Stops the simulated-metrics loop. Returns `false` when it was not
    /// running.
    pub async fn stop_monitoring(&self) -> bool {
        let handle = self.inner.monitor.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(handle) = handle else {
            return false;
        };
        handle.cancel.cancel();
        if let Err(error) = handle.task.await {
            tracing::error!(error = %error, "monitoring task panicked");
        }
        tracing::info!("campaign monitoring stopped");
        true
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished())
    }

    /// Stops every background task and waits for them to exit.
    pub async fn shutdown(&self) {
        self.stop_monitoring().await;
        self.inner.shutdown.cancel();
        self.inner.lanes.join().await;
        let bridge_task = self.inner.bridge_task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = bridge_task {
            if let Err(error) = task.await {
                tracing::error!(error = %error, "subscription bridge panicked");
            }
        }
        tracing::info!("campaign pipeline stopped");
    }

    fn default_deadline(&self) -> Option<Instant> {
        self.inner.settings.publish.timeout().map(|timeout| Instant::now() + timeout)
    }
}

async fn await_reply<T>(rx: oneshot::Receiver<PipelineResult<T>>) -> PipelineResult<T> {
    rx.await
        .map_err(|_| PipelineError::Internal("processing lane dropped the request".to_string()))?
}
