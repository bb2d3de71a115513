//! # Simulated Metrics
//!
//! Demo traffic for environments without live ad-platform connectors. Each
//! tick grows every demo campaign's counters by a random, plausible amount
//! and feeds the result through the regular update path, so alerts and bus
//! events behave exactly as they would for real samples.

use std::sync::Weak;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::{CampaignPipeline, PipelineInner};
use crate::configs::SimulatorSettings;
use crate::errors::{PipelineError, PipelineResult};
use crate::models::{MetricsSample, NewCampaign, Platform, RawCounters};

struct DemoCampaign {
    campaign_id: &'static str,
    campaign_name: &'static str,
    platform: Platform,
    budget_limit: f64,
}

const DEMO_CAMPAIGNS: [DemoCampaign; 3] = [
    DemoCampaign {
        campaign_id: "demo_summer_sale_2024",
        campaign_name: "Summer Sale 2024",
        platform: Platform::GoogleAds,
        budget_limit: 1000.0,
    },
    DemoCampaign {
        campaign_id: "demo_brand_awareness_q4",
        campaign_name: "Brand Awareness Q4",
        platform: Platform::Meta,
        budget_limit: 1500.0,
    },
    DemoCampaign {
        campaign_id: "demo_product_launch",
        campaign_name: "Product Launch Campaign",
        platform: Platform::Linkedin,
        budget_limit: 800.0,
    },
];

/// One tick of growth on top of `base`: 1k-5k impressions at 2-8% CTR,
/// 50-200 spend, 5-15% conversion at 25-100 revenue per conversion.
pub fn grow<R: Rng + ?Sized>(base: &RawCounters, rng: &mut R) -> RawCounters {
    let impressions: u64 = rng.random_range(1_000..=5_000);
    let clicks = (impressions as f64 * rng.random_range(0.02..0.08)) as u64;
    let spend: f64 = rng.random_range(50.0..200.0);
    let conversions = (clicks as f64 * rng.random_range(0.05..0.15)) as u64;
    let revenue = conversions as f64 * rng.random_range(25.0..100.0);

    RawCounters {
        impressions: base.impressions + impressions,
        clicks: base.clicks + clicks,
        spend: base.spend + spend,
        conversions: base.conversions + conversions,
        revenue: base.revenue + revenue,
    }
}

async fn ensure_demo_campaigns(pipeline: &CampaignPipeline, project_id: &str) -> PipelineResult<()> {
    if !pipeline.registry().campaign_ids(project_id).is_empty() {
        return Ok(());
    }
    for demo in &DEMO_CAMPAIGNS {
        let campaign = NewCampaign {
            campaign_id: demo.campaign_id.to_string(),
            project_id: project_id.to_string(),
            campaign_name: demo.campaign_name.to_string(),
            platform: demo.platform,
            budget_limit: demo.budget_limit,
            thresholds: None,
        };
        match pipeline.register(campaign).await {
            Ok(_) | Err(PipelineError::AlreadyRegistered(_)) => {}
            Err(error) => return Err(error),
        }
    }
    tracing::info!(project_id = %project_id, campaigns = DEMO_CAMPAIGNS.len(), "demo campaigns registered");
    Ok(())
}

/// Registers the demo campaigns if the project has none, then pushes one
/// simulated sample per campaign. Returns the number of updates applied.
pub async fn tick(pipeline: &CampaignPipeline, project_id: &str) -> PipelineResult<usize> {
    ensure_demo_campaigns(pipeline, project_id).await?;

    let campaign_ids = pipeline.registry().campaign_ids(project_id);
    let samples: Vec<(String, MetricsSample)> = {
        let mut rng = rand::rng();
        campaign_ids
            .into_iter()
            .map(|campaign_id| {
                let base = pipeline
                    .get_metrics(&campaign_id)
                    .map(|metrics| metrics.raw())
                    .unwrap_or_default();
                let sample = MetricsSample::from(grow(&base, &mut rng));
                (campaign_id, sample)
            })
            .collect()
    };

    let mut applied = 0;
    for (campaign_id, sample) in samples {
        let outcome = pipeline.update_metrics(&campaign_id, sample).await?;
        if !outcome.alerts.is_empty() {
            tracing::info!(
                campaign_id = %campaign_id,
                alerts = outcome.alerts.len(),
                "simulated sample raised alerts"
            );
        }
        applied += 1;
    }
    Ok(applied)
}

/// The monitoring loop. Holds only a weak handle so a forgotten loop never
/// keeps a dropped pipeline alive.
pub(crate) async fn run(pipeline: Weak<PipelineInner>, settings: SimulatorSettings, cancel: CancellationToken) {
    let interval = Duration::from_secs(settings.interval_seconds.max(1));
    let backoff = Duration::from_secs(settings.error_backoff_seconds.max(1));

    loop {
        let Some(handle) = CampaignPipeline::upgrade(&pipeline) else {
            break;
        };
        let delay = match tick(&handle, &settings.project_id).await {
            Ok(updated) => {
                tracing::debug!(updated, "simulated metrics tick");
                interval
            }
            Err(error) => {
                tracing::error!(error = %error, "simulated metrics tick failed");
                backoff
            }
        };
        drop(handle);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::debug!("monitoring loop exited");
}
