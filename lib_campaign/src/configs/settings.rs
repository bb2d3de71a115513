//! # Pipeline Settings
//!
//! Plain, serde-friendly settings with defaults matching the production
//! deployment. Every struct deserializes from a partial JSON document; missing
//! fields fall back to [`Default`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{Severity, Thresholds};

/// # Severity Band
///
/// Values whose overshoot (percent past the threshold) is strictly below
/// `below_percent` get `severity`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeverityBand {
    pub below_percent: f64,
    pub severity: Severity,
}

/// # Severity Policy
///
/// Ordered band table. Overshoots past the last band map to `ceiling`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeverityPolicy {
    pub bands: Vec<SeverityBand>,
    pub ceiling: Severity,
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self {
            bands: vec![
                SeverityBand { below_percent: 10.0, severity: Severity::Medium },
                SeverityBand { below_percent: 25.0, severity: Severity::High },
            ],
            ceiling: Severity::Critical,
        }
    }
}

impl SeverityPolicy {
    /// Maps a relative overshoot in percent onto a severity.
    pub fn classify(&self, overshoot_percent: f64) -> Severity {
        self.bands
            .iter()
            .find(|band| overshoot_percent < band.below_percent)
            .map(|band| band.severity)
            .unwrap_or(self.ceiling)
    }
}

/// Bounded exponential backoff for bus publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Deadline for one publish including its retries. `0` means none.
    pub timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            timeout_ms: 5_000,
        }
    }
}

impl RetrySettings {
    /// Delay before retry number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

/// Backoff used by the subscription bridge when the bus stream drops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl ReconnectSettings {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(16));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    pub ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
    /// Resolver operations slower than this are logged.
    pub slow_query_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            sweep_interval_seconds: 60,
            slow_query_ms: 100,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

/// Demo traffic generator, off unless asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulatorSettings {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub error_backoff_seconds: u64,
    pub project_id: String,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: 30,
            error_backoff_seconds: 60,
            project_id: "12345678-1234-5678-9012-123456789012".to_string(),
        }
    }
}

/// # Pipeline Settings
///
/// Everything [`crate::pipeline::CampaignPipeline`] needs at start-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    /// Bus subjects are `{subject_prefix}.events.campaign.{kind}`.
    pub subject_prefix: String,
    /// Number of processing lanes campaigns are hashed onto.
    pub lane_count: usize,
    pub lane_queue_depth: usize,
    /// Events buffered per live subscriber before it is dropped.
    pub subscriber_queue_depth: usize,
    pub publish: RetrySettings,
    pub reconnect: ReconnectSettings,
    pub severity: SeverityPolicy,
    pub default_thresholds: Thresholds,
    pub cache: CacheSettings,
    pub simulator: SimulatorSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            subject_prefix: "zamc".to_string(),
            lane_count: 8,
            lane_queue_depth: 1024,
            subscriber_queue_depth: 256,
            publish: RetrySettings::default(),
            reconnect: ReconnectSettings::default(),
            severity: SeverityPolicy::default(),
            default_thresholds: Thresholds::default(),
            cache: CacheSettings::default(),
            simulator: SimulatorSettings::default(),
        }
    }
}
