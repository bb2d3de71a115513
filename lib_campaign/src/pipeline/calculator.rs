//! # Derived Metrics Calculator
//!
//! Pure functions from raw counters to CTR, CPC, CPM and ROAS. A zero
//! denominator resolves to `0.0`, never NaN or infinity, so downstream
//! consumers never see a non-finite value.

use chrono::{DateTime, Utc};

use crate::errors::{PipelineError, PipelineResult};
use crate::models::{CampaignMetrics, CampaignRegistration, RawCounters};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DerivedMetrics {
    /// Percent.
    pub ctr: f64,
    pub cpc: f64,
    pub cpm: f64,
    pub roas: f64,
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

fn check_money(name: &str, value: f64) -> PipelineResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(PipelineError::InvalidInput(format!(
            "{} must be a finite, non-negative amount (got {})",
            name, value
        )));
    }
    Ok(())
}

/// Rejects negative or non-finite monetary counters.
pub fn validate(raw: &RawCounters) -> PipelineResult<()> {
    check_money("spend", raw.spend)?;
    check_money("revenue", raw.revenue)
}

fn check_derived(name: &str, value: f64) -> PipelineResult<()> {
    if !value.is_finite() {
        return Err(PipelineError::InvalidInput(format!(
            "{} is out of range for the supplied counters",
            name
        )));
    }
    Ok(())
}

/// Derived ratios for `raw`. Counters whose ratios overflow `f64` are
/// rejected instead of producing an infinite metric.
pub fn derive(raw: &RawCounters) -> PipelineResult<DerivedMetrics> {
    validate(raw)?;
    let impressions = raw.impressions as f64;
    let clicks = raw.clicks as f64;

    let derived = DerivedMetrics {
        ctr: ratio(clicks, impressions) * 100.0,
        cpc: ratio(raw.spend, clicks),
        cpm: ratio(raw.spend, impressions) * 1000.0,
        roas: ratio(raw.revenue, raw.spend),
    };
    check_derived("ctr", derived.ctr)?;
    check_derived("cpc", derived.cpc)?;
    check_derived("cpm", derived.cpm)?;
    check_derived("roas", derived.roas)?;
    Ok(derived)
}

/// Full metrics record for a registered campaign, stamped at `at`.
pub fn compute(
    registration: &CampaignRegistration,
    raw: &RawCounters,
    at: DateTime<Utc>,
) -> PipelineResult<CampaignMetrics> {
    let derived = derive(raw)?;
    Ok(CampaignMetrics {
        campaign_id: registration.campaign_id.clone(),
        campaign_name: registration.campaign_name.clone(),
        platform: registration.platform,
        impressions: raw.impressions,
        clicks: raw.clicks,
        spend: raw.spend,
        conversions: raw.conversions,
        revenue: raw.revenue,
        ctr: derived.ctr,
        cpc: derived.cpc,
        cpm: derived.cpm,
        roas: derived.roas,
        timestamp: at,
        date: at.format("%Y-%m-%d").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Platform, Thresholds};
    use chrono::TimeZone;

    fn raw(impressions: u64, clicks: u64, spend: f64, conversions: u64, revenue: f64) -> RawCounters {
        RawCounters {
            impressions,
            clicks,
            spend,
            conversions,
            revenue,
        }
    }

    #[test]
    fn reference_scenario_is_exact() {
        let derived = derive(&raw(10_000, 500, 250.0, 25, 1250.0)).unwrap();
        assert_eq!(derived.ctr, 5.0);
        assert_eq!(derived.cpc, 0.5);
        assert_eq!(derived.cpm, 25.0);
        assert_eq!(derived.roas, 5.0);
    }

    #[test]
    fn zero_denominators_resolve_to_zero() {
        let derived = derive(&raw(0, 0, 0.0, 0, 100.0)).unwrap();
        assert_eq!(derived, DerivedMetrics::default());

        let no_clicks = derive(&raw(1_000, 0, 50.0, 0, 0.0)).unwrap();
        assert_eq!(no_clicks.cpc, 0.0);
        assert_eq!(no_clicks.ctr, 0.0);
        assert_eq!(no_clicks.cpm, 50.0);
        assert!(no_clicks.roas == 0.0);
    }

    #[test]
    fn never_produces_non_finite_values() {
        for impressions in [0, 1, 7, 1_000_000] {
            for clicks in [0, 1, 3, 999] {
                for spend in [0.0, 0.01, 17.5, 1e9] {
                    let d = derive(&raw(impressions, clicks, spend, 1, 3.3)).unwrap();
                    assert!(d.ctr.is_finite() && d.cpc.is_finite() && d.cpm.is_finite() && d.roas.is_finite());
                }
            }
        }
    }

    #[test]
    fn rejects_negative_and_non_finite_money() {
        assert!(matches!(derive(&raw(1, 1, -1.0, 0, 0.0)), Err(PipelineError::InvalidInput(_))));
        assert!(matches!(derive(&raw(1, 1, 1.0, 0, f64::NAN)), Err(PipelineError::InvalidInput(_))));
        assert!(matches!(derive(&raw(1, 1, f64::INFINITY, 0, 0.0)), Err(PipelineError::InvalidInput(_))));
    }

    #[test]
    fn rejects_counters_whose_ratios_overflow() {
        let huge_spend = derive(&raw(1, 1, 1e306, 0, 1e300));
        assert!(matches!(huge_spend, Err(PipelineError::InvalidInput(ref msg)) if msg.starts_with("cpm")));

        let tiny_spend = derive(&raw(1, 1, 1e-10, 0, 1e300));
        assert!(matches!(tiny_spend, Err(PipelineError::InvalidInput(ref msg)) if msg.starts_with("roas")));
    }

    #[test]
    fn compute_is_deterministic_and_stamps_the_day_bucket() {
        let registration = CampaignRegistration {
            campaign_id: "C1".into(),
            project_id: "P1".into(),
            campaign_name: "Summer".into(),
            platform: Platform::GoogleAds,
            budget_limit: 1000.0,
            thresholds: Thresholds::default(),
            registered_at: Utc::now(),
        };
        let at = Utc.with_ymd_and_hms(2024, 6, 30, 23, 59, 59).unwrap();
        let counters = raw(10_000, 500, 250.0, 25, 1250.0);

        let first = compute(&registration, &counters, at).unwrap();
        let second = compute(&registration, &counters, at).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.date, "2024-06-30");
        assert_eq!(first.raw(), counters);
        assert_eq!(first.platform, Platform::GoogleAds);
    }
}
