//! # Campaign Domain Model
//!
//! The types that flow through the pipeline: registrations, raw counter
//! samples, computed metrics and the alerts raised from them. Every type here
//! serializes to the JSON shape consumed by the query layer and by bus
//! subscribers (`camelCase` field names, `snake_case` enum values).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Advertising platform a campaign runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    GoogleAds,
    Meta,
    Linkedin,
    Twitter,
}

/// # Raw Counters
///
/// The only independently stored campaign numbers. Everything else in
/// [`CampaignMetrics`] is derived from these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCounters {
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    pub conversions: u64,
    pub revenue: f64,
}

/// # Metrics Sample
///
/// A partial counter update as it arrives from a platform connector. Absent
/// counters keep the value already stored for the campaign.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    #[serde(default)]
    pub impressions: Option<u64>,
    #[serde(default)]
    pub clicks: Option<u64>,
    #[serde(default)]
    pub spend: Option<f64>,
    #[serde(default)]
    pub conversions: Option<u64>,
    #[serde(default)]
    pub revenue: Option<f64>,
}

impl MetricsSample {
    /// Overlays the present counters onto `base`.
    pub fn merge_onto(&self, base: &RawCounters) -> RawCounters {
        RawCounters {
            impressions: self.impressions.unwrap_or(base.impressions),
            clicks: self.clicks.unwrap_or(base.clicks),
            spend: self.spend.unwrap_or(base.spend),
            conversions: self.conversions.unwrap_or(base.conversions),
            revenue: self.revenue.unwrap_or(base.revenue),
        }
    }
}

impl From<RawCounters> for MetricsSample {
    fn from(raw: RawCounters) -> Self {
        Self {
            impressions: Some(raw.impressions),
            clicks: Some(raw.clicks),
            spend: Some(raw.spend),
            conversions: Some(raw.conversions),
            revenue: Some(raw.revenue),
        }
    }
}

/// # Campaign Metrics
///
/// Raw counters plus the derived ratios, stamped with the event time. The
/// derived fields are only ever produced by
/// [`crate::pipeline::calculator::compute`]; nothing mutates them afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignMetrics {
    pub campaign_id: String,
    pub campaign_name: String,
    pub platform: Platform,
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    pub conversions: u64,
    pub revenue: f64,
    /// Click-through rate, in percent.
    pub ctr: f64,
    pub cpc: f64,
    pub cpm: f64,
    pub roas: f64,
    pub timestamp: DateTime<Utc>,
    /// UTC day bucket, `YYYY-MM-DD`.
    pub date: String,
}

impl CampaignMetrics {
    pub fn raw(&self) -> RawCounters {
        RawCounters {
            impressions: self.impressions,
            clicks: self.clicks,
            spend: self.spend,
            conversions: self.conversions,
            revenue: self.revenue,
        }
    }
}

/// # Alert Thresholds
///
/// Per-campaign threshold policy. `None` disables the corresponding rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Thresholds {
    pub roas_low: Option<f64>,
    pub roas_high: Option<f64>,
    /// Percent, same unit as [`CampaignMetrics::ctr`].
    pub ctr_low: Option<f64>,
    pub ctr_high: Option<f64>,
    pub cpc_high: Option<f64>,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            roas_low: Some(2.0),
            roas_high: Some(5.0),
            ctr_low: Some(1.0),
            ctr_high: Some(5.0),
            cpc_high: Some(2.0),
        }
    }
}

/// Registration request for a new campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCampaign {
    pub campaign_id: String,
    pub project_id: String,
    #[serde(default)]
    pub campaign_name: String,
    pub platform: Platform,
    pub budget_limit: f64,
    #[serde(default)]
    pub thresholds: Option<Thresholds>,
}

/// Changes applied by an explicit registration update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationUpdate {
    #[serde(default)]
    pub budget_limit: Option<f64>,
    #[serde(default)]
    pub thresholds: Option<Thresholds>,
}

/// # Campaign Registration
///
/// Created once through an explicit register call; a metrics update never
/// creates one implicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignRegistration {
    pub campaign_id: String,
    pub project_id: String,
    pub campaign_name: String,
    pub platform: Platform,
    pub budget_limit: f64,
    pub thresholds: Thresholds,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    BudgetExceeded,
    LowPerformance,
    HighCpc,
    LowCtr,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::BudgetExceeded => "budget_exceeded",
            AlertType::LowPerformance => "low_performance",
            AlertType::HighCpc => "high_cpc",
            AlertType::LowCtr => "low_ctr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Which side of a threshold a value crossed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdDirection {
    Below,
    Above,
}

/// # Performance Alert
///
/// One firing of an alert rule. `alert_id` is unique per firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceAlert {
    pub alert_id: Uuid,
    pub campaign_id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub threshold: f64,
    pub current_value: f64,
    pub timestamp: DateTime<Utc>,
}
