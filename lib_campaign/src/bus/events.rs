//! # Campaign Events
//!
//! The four event payloads published on the bus, modeled as one tagged enum
//! so consumers have to handle every kind. The `eventType` tag and the field
//! names are the wire contract shared with the query layer; note that the
//! budget and threshold payloads keep their `snake_case` field names.
//!
//! Every event carries `sequence`, monotonic per campaign and starting at 1.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{CampaignMetrics, PerformanceAlert, ThresholdDirection};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsUpdated {
    pub project_id: String,
    pub campaign_id: String,
    pub sequence: u64,
    pub metrics: CampaignMetrics,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceAlertRaised {
    pub project_id: String,
    pub campaign_id: String,
    pub sequence: u64,
    pub alert: PerformanceAlert,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetExceeded {
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(rename = "campaignId")]
    pub campaign_id: String,
    pub sequence: u64,
    pub budget_limit: f64,
    pub current_spend: f64,
    pub percentage_exceeded: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceThreshold {
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(rename = "campaignId")]
    pub campaign_id: String,
    pub sequence: u64,
    pub metric_name: String,
    pub threshold_type: ThresholdDirection,
    pub threshold_value: f64,
    pub current_value: f64,
    pub timestamp: DateTime<Utc>,
}

/// # Campaign Event
///
/// Internally tagged on `eventType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum CampaignEvent {
    #[serde(rename = "campaign.metrics_updated")]
    MetricsUpdated(MetricsUpdated),
    #[serde(rename = "campaign.performance_alert")]
    PerformanceAlert(PerformanceAlertRaised),
    #[serde(rename = "campaign.budget_exceeded")]
    BudgetExceeded(BudgetExceeded),
    #[serde(rename = "campaign.performance_threshold")]
    PerformanceThreshold(PerformanceThreshold),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MetricsUpdated,
    PerformanceAlert,
    BudgetExceeded,
    PerformanceThreshold,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MetricsUpdated => "metrics_updated",
            EventKind::PerformanceAlert => "performance_alert",
            EventKind::BudgetExceeded => "budget_exceeded",
            EventKind::PerformanceThreshold => "performance_threshold",
        }
    }
}

impl CampaignEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CampaignEvent::MetricsUpdated(_) => EventKind::MetricsUpdated,
            CampaignEvent::PerformanceAlert(_) => EventKind::PerformanceAlert,
            CampaignEvent::BudgetExceeded(_) => EventKind::BudgetExceeded,
            CampaignEvent::PerformanceThreshold(_) => EventKind::PerformanceThreshold,
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            CampaignEvent::MetricsUpdated(e) => &e.project_id,
            CampaignEvent::PerformanceAlert(e) => &e.project_id,
            CampaignEvent::BudgetExceeded(e) => &e.project_id,
            CampaignEvent::PerformanceThreshold(e) => &e.project_id,
        }
    }

    pub fn campaign_id(&self) -> &str {
        match self {
            CampaignEvent::MetricsUpdated(e) => &e.campaign_id,
            CampaignEvent::PerformanceAlert(e) => &e.campaign_id,
            CampaignEvent::BudgetExceeded(e) => &e.campaign_id,
            CampaignEvent::PerformanceThreshold(e) => &e.campaign_id,
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            CampaignEvent::MetricsUpdated(e) => e.sequence,
            CampaignEvent::PerformanceAlert(e) => e.sequence,
            CampaignEvent::BudgetExceeded(e) => e.sequence,
            CampaignEvent::PerformanceThreshold(e) => e.sequence,
        }
    }

    /// Bus subject for this event, e.g. `zamc.events.campaign.budget_exceeded`.
    pub fn subject(&self, prefix: &str) -> String {
        format!("{}.events.campaign.{}", prefix, self.kind().as_str())
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
