use crate::campaign_logic::state::AppState;
use lib_campaign::HealthStatus;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{info, warn};

/// Logs the pipeline health every `period` and says so when it changes.
pub async fn run(period: Duration, app_state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let mut check_interval = interval(period);
    let mut last_status: Option<HealthStatus> = None;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("Monitor service received shutdown signal.");
                break;
            }
            _ = check_interval.tick() => {
                let report = app_state.pipeline.health_check().await;
                let resolver = app_state.resolver.stats();

                if last_status.is_some_and(|previous| previous != report.status) {
                    warn!(from = ?last_status, to = ?report.status, "pipeline health changed");
                }
                last_status = Some(report.status);

                match report.status {
                    HealthStatus::Healthy => info!(
                        campaigns = report.active_campaigns,
                        subscribers = report.live_subscribers,
                        published = report.publisher.published,
                        cache_hits = resolver.cache.hits,
                        cache_misses = resolver.cache.misses,
                        "pipeline healthy"
                    ),
                    _ => warn!(
                        status = ?report.status,
                        bus_connected = report.bus_connected,
                        bus_error = report.bus_error.as_deref().unwrap_or(""),
                        bridge_connected = report.bridge_connected,
                        lanes_alive = report.lanes_alive,
                        lanes_total = report.lanes_total,
                        "pipeline not healthy"
                    ),
                }
            }
        }
    }
}
