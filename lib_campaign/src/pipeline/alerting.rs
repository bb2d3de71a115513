//! # Alerting Engine
//!
//! Edge-triggered rule evaluation. Every `(campaign, rule)` pair carries a
//! two-state machine:
//!
//! ```text
//!   Normal --adverse crossing--> Firing   (emits one AlertFiring)
//!   Firing --still adverse-----> Firing   (silent)
//!   Firing --condition clears--> Normal   (silent)
//! ```
//!
//! ## Core Design Principles
//!
//! 1. **Lane-owned state**: an engine belongs to exactly one processing lane,
//!    and a campaign is always routed to the same lane, so no two workers ever
//!    evaluate the same campaign concurrently and the state needs no lock.
//! 2. **Sum-typed payloads**: what fired is an [`AlertKind`], so consumers
//!    building bus events match exhaustively instead of poking at maps.
//! 3. **Policy-driven severity**: overshoot percentages are mapped through the
//!    configured [`SeverityPolicy`] rather than per-rule constants.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::configs::SeverityPolicy;
use crate::models::{
    AlertType, CampaignMetrics, CampaignRegistration, PerformanceAlert, Severity, ThresholdDirection,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertRule {
    Budget,
    RoasLow,
    RoasHigh,
    CtrLow,
    CtrHigh,
    CpcHigh,
}

impl AlertRule {
    pub const ALL: [AlertRule; 6] = [
        AlertRule::Budget,
        AlertRule::RoasLow,
        AlertRule::RoasHigh,
        AlertRule::CtrLow,
        AlertRule::CtrHigh,
        AlertRule::CpcHigh,
    ];

    /// Alert type raised by the rule. `None` for the informational
    /// favourable crossings, which only produce a threshold event.
    pub fn alert_type(&self) -> Option<AlertType> {
        match self {
            AlertRule::Budget => Some(AlertType::BudgetExceeded),
            AlertRule::RoasLow => Some(AlertType::LowPerformance),
            AlertRule::CtrLow => Some(AlertType::LowCtr),
            AlertRule::CpcHigh => Some(AlertType::HighCpc),
            AlertRule::RoasHigh | AlertRule::CtrHigh => None,
        }
    }

    pub fn metric_name(&self) -> &'static str {
        match self {
            AlertRule::Budget => "spend",
            AlertRule::RoasLow | AlertRule::RoasHigh => "roas",
            AlertRule::CtrLow | AlertRule::CtrHigh => "ctr",
            AlertRule::CpcHigh => "cpc",
        }
    }

    pub fn direction(&self) -> ThresholdDirection {
        match self {
            AlertRule::RoasLow | AlertRule::CtrLow => ThresholdDirection::Below,
            AlertRule::Budget | AlertRule::RoasHigh | AlertRule::CtrHigh | AlertRule::CpcHigh => {
                ThresholdDirection::Above
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleState {
    #[default]
    Normal,
    Firing,
}

/// What a firing carries, one variant per projection event family.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertKind {
    BudgetExceeded {
        budget_limit: f64,
        current_spend: f64,
        percentage_exceeded: f64,
    },
    Threshold {
        metric_name: &'static str,
        direction: ThresholdDirection,
        threshold_value: f64,
        current_value: f64,
    },
}

/// One Normal → Firing transition.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertFiring {
    pub rule: AlertRule,
    pub kind: AlertKind,
    /// Absent for informational crossings.
    pub alert: Option<PerformanceAlert>,
}

/// A rule's verdict on one metrics sample.
enum Verdict {
    /// The rule has no threshold configured.
    Disabled,
    /// The metric has no denominator yet.
    Skip,
    Clear,
    Adverse { threshold: f64, value: f64 },
}

pub struct AlertEngine {
    states: HashMap<(String, AlertRule), RuleState>,
    severity: SeverityPolicy,
}

impl AlertEngine {
    pub fn new(severity: SeverityPolicy) -> Self {
        Self {
            states: HashMap::new(),
            severity,
        }
    }

    pub fn state(&self, campaign_id: &str, rule: AlertRule) -> RuleState {
        self.states
            .get(&(campaign_id.to_string(), rule))
            .copied()
            .unwrap_or_default()
    }

    /// # Evaluate
    ///
    /// Runs every rule against `metrics` and returns the rules that crossed
    /// into Firing on this sample, in [`AlertRule::ALL`] order.
    pub fn evaluate(&mut self, registration: &CampaignRegistration, metrics: &CampaignMetrics) -> Vec<AlertFiring> {
        let mut fired = Vec::new();

        for rule in AlertRule::ALL {
            let (threshold, value) = match verdict(rule, registration, metrics) {
                Verdict::Skip => continue,
                Verdict::Disabled => {
                    // A rule re-enabled later must be able to fire again.
                    self.states.remove(&(registration.campaign_id.clone(), rule));
                    continue;
                }
                Verdict::Clear => {
                    if let Some(state) = self.states.get_mut(&(registration.campaign_id.clone(), rule)) {
                        if *state == RuleState::Firing {
                            tracing::debug!(campaign_id = %registration.campaign_id, ?rule, "alert condition cleared");
                        }
                        *state = RuleState::Normal;
                    }
                    continue;
                }
                Verdict::Adverse { threshold, value } => (threshold, value),
            };

            let state = self
                .states
                .entry((registration.campaign_id.clone(), rule))
                .or_default();
            if *state == RuleState::Firing {
                continue;
            }
            *state = RuleState::Firing;

            fired.push(self.firing(rule, registration, threshold, value, metrics.timestamp));
        }

        fired
    }

    fn firing(
        &self,
        rule: AlertRule,
        registration: &CampaignRegistration,
        threshold: f64,
        value: f64,
        at: DateTime<Utc>,
    ) -> AlertFiring {
        let overshoot = overshoot_percent(threshold, value);
        let kind = match rule {
            AlertRule::Budget => AlertKind::BudgetExceeded {
                budget_limit: threshold,
                current_spend: value,
                percentage_exceeded: overshoot,
            },
            _ => AlertKind::Threshold {
                metric_name: rule.metric_name(),
                direction: rule.direction(),
                threshold_value: threshold,
                current_value: value,
            },
        };

        let alert = rule.alert_type().map(|alert_type| PerformanceAlert {
            alert_id: Uuid::new_v4(),
            campaign_id: registration.campaign_id.clone(),
            alert_type,
            severity: self.severity.classify(overshoot),
            message: message(rule, threshold, value, overshoot),
            threshold,
            current_value: value,
            timestamp: at,
        });

        tracing::info!(
            campaign_id = %registration.campaign_id,
            ?rule,
            threshold,
            value,
            severity = ?alert.as_ref().map(|a| a.severity).unwrap_or(Severity::Low),
            "alert rule fired"
        );

        AlertFiring { rule, kind, alert }
    }
}

fn verdict(rule: AlertRule, registration: &CampaignRegistration, metrics: &CampaignMetrics) -> Verdict {
    let thresholds = &registration.thresholds;
    let (threshold, value, evaluable) = match rule {
        AlertRule::Budget => (Some(registration.budget_limit), metrics.spend, true),
        AlertRule::RoasLow => (thresholds.roas_low, metrics.roas, metrics.spend > 0.0),
        AlertRule::RoasHigh => (thresholds.roas_high, metrics.roas, true),
        AlertRule::CtrLow => (thresholds.ctr_low, metrics.ctr, metrics.impressions > 0),
        AlertRule::CtrHigh => (thresholds.ctr_high, metrics.ctr, true),
        AlertRule::CpcHigh => (thresholds.cpc_high, metrics.cpc, true),
    };

    let Some(threshold) = threshold else {
        return Verdict::Disabled;
    };
    if !evaluable {
        return Verdict::Skip;
    }

    let adverse = match rule.direction() {
        ThresholdDirection::Above => value > threshold,
        ThresholdDirection::Below => value < threshold,
    };
    if adverse {
        Verdict::Adverse { threshold, value }
    } else {
        Verdict::Clear
    }
}

/// `|value - threshold| / threshold * 100`, zero for a zero threshold.
fn overshoot_percent(threshold: f64, value: f64) -> f64 {
    if threshold > 0.0 {
        (value - threshold).abs() * 100.0 / threshold
    } else {
        0.0
    }
}

fn message(rule: AlertRule, threshold: f64, value: f64, overshoot: f64) -> String {
    match rule {
        AlertRule::Budget => format!("Campaign budget exceeded by {:.1}%", overshoot),
        AlertRule::RoasLow => format!("ROAS {:.2} is below target {:.2}", value, threshold),
        AlertRule::CtrLow => format!("CTR {:.2}% is below target {:.2}%", value, threshold),
        AlertRule::CpcHigh => format!("CPC {:.2} is above limit {:.2}", value, threshold),
        AlertRule::RoasHigh => format!("ROAS {:.2} is above target {:.2}", value, threshold),
        AlertRule::CtrHigh => format!("CTR {:.2}% is above target {:.2}%", value, threshold),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Platform, RawCounters, Thresholds};
    use crate::pipeline::calculator;

    fn registration(budget: f64, thresholds: Thresholds) -> CampaignRegistration {
        CampaignRegistration {
            campaign_id: "C1".into(),
            project_id: "P1".into(),
            campaign_name: "C1".into(),
            platform: Platform::Meta,
            budget_limit: budget,
            thresholds,
            registered_at: Utc::now(),
        }
    }

    fn only_budget() -> Thresholds {
        Thresholds {
            roas_low: None,
            roas_high: None,
            ctr_low: None,
            ctr_high: None,
            cpc_high: None,
        }
    }

    fn metrics(reg: &CampaignRegistration, spend: f64) -> CampaignMetrics {
        let raw = RawCounters {
            impressions: 10_000,
            clicks: 500,
            spend,
            conversions: 10,
            revenue: 0.0,
        };
        calculator::compute(reg, &raw, Utc::now()).unwrap()
    }

    #[test]
    fn budget_fires_once_per_crossing() {
        let reg = registration(1000.0, only_budget());
        let mut engine = AlertEngine::new(SeverityPolicy::default());

        assert!(engine.evaluate(&reg, &metrics(&reg, 900.0)).is_empty());

        let fired = engine.evaluate(&reg, &metrics(&reg, 1200.0));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule, AlertRule::Budget);
        assert_eq!(
            fired[0].kind,
            AlertKind::BudgetExceeded {
                budget_limit: 1000.0,
                current_spend: 1200.0,
                percentage_exceeded: 20.0,
            }
        );
        let alert = fired[0].alert.as_ref().unwrap();
        assert_eq!(alert.alert_type, AlertType::BudgetExceeded);
        assert_eq!(alert.severity, Severity::High);
        assert_eq!(alert.message, "Campaign budget exceeded by 20.0%");

        assert!(engine.evaluate(&reg, &metrics(&reg, 1300.0)).is_empty());
        assert!(engine.evaluate(&reg, &metrics(&reg, 5000.0)).is_empty());
        assert_eq!(engine.state("C1", AlertRule::Budget), RuleState::Firing);
    }

    #[test]
    fn recovery_is_silent_and_rearms() {
        let mut reg = registration(1000.0, only_budget());
        let mut engine = AlertEngine::new(SeverityPolicy::default());

        assert_eq!(engine.evaluate(&reg, &metrics(&reg, 1050.0)).len(), 1);

        reg.budget_limit = 2000.0;
        assert!(engine.evaluate(&reg, &metrics(&reg, 1050.0)).is_empty());
        assert_eq!(engine.state("C1", AlertRule::Budget), RuleState::Normal);

        let again = engine.evaluate(&reg, &metrics(&reg, 2600.0));
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].alert.as_ref().unwrap().severity, Severity::Critical);
    }

    #[test]
    fn alert_ids_are_unique_per_firing() {
        let mut reg = registration(100.0, only_budget());
        let mut engine = AlertEngine::new(SeverityPolicy::default());
        let first = engine.evaluate(&reg, &metrics(&reg, 105.0));
        reg.budget_limit = 1000.0;
        engine.evaluate(&reg, &metrics(&reg, 105.0));
        reg.budget_limit = 100.0;
        let second = engine.evaluate(&reg, &metrics(&reg, 105.0));

        let a = first[0].alert.as_ref().unwrap();
        let b = second[0].alert.as_ref().unwrap();
        assert_eq!(a.severity, Severity::Medium);
        assert_ne!(a.alert_id, b.alert_id);
    }

    #[test]
    fn low_side_rules_wait_for_a_denominator() {
        let reg = registration(1000.0, Thresholds::default());
        let mut engine = AlertEngine::new(SeverityPolicy::default());
        let fresh = calculator::compute(&reg, &RawCounters::default(), Utc::now()).unwrap();

        assert!(engine.evaluate(&reg, &fresh).is_empty());
        assert_eq!(engine.state("C1", AlertRule::CtrLow), RuleState::Normal);
        assert_eq!(engine.state("C1", AlertRule::RoasLow), RuleState::Normal);
    }

    #[test]
    fn threshold_rules_project_direction_and_type() {
        let reg = registration(10_000.0, Thresholds::default());
        let mut engine = AlertEngine::new(SeverityPolicy::default());
        // ctr 0.5%, cpc 3.0, roas 1.0
        let raw = RawCounters {
            impressions: 20_000,
            clicks: 100,
            spend: 300.0,
            conversions: 3,
            revenue: 300.0,
        };
        let m = calculator::compute(&reg, &raw, Utc::now()).unwrap();
        let fired = engine.evaluate(&reg, &m);

        let rules: Vec<AlertRule> = fired.iter().map(|f| f.rule).collect();
        assert_eq!(rules, vec![AlertRule::RoasLow, AlertRule::CtrLow, AlertRule::CpcHigh]);

        let types: Vec<AlertType> = fired.iter().filter_map(|f| f.alert.as_ref()).map(|a| a.alert_type).collect();
        assert_eq!(types, vec![AlertType::LowPerformance, AlertType::LowCtr, AlertType::HighCpc]);

        match &fired[2].kind {
            AlertKind::Threshold { metric_name, direction, threshold_value, current_value } => {
                assert_eq!(*metric_name, "cpc");
                assert_eq!(*direction, ThresholdDirection::Above);
                assert_eq!(*threshold_value, 2.0);
                assert_eq!(*current_value, 3.0);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn favourable_crossings_are_informational() {
        let reg = registration(10_000.0, Thresholds::default());
        let mut engine = AlertEngine::new(SeverityPolicy::default());
        // ctr 10%, cpc 0.5, roas 8.0
        let raw = RawCounters {
            impressions: 1_000,
            clicks: 100,
            spend: 50.0,
            conversions: 5,
            revenue: 400.0,
        };
        let m = calculator::compute(&reg, &raw, Utc::now()).unwrap();
        let fired = engine.evaluate(&reg, &m);

        let rules: Vec<AlertRule> = fired.iter().map(|f| f.rule).collect();
        assert_eq!(rules, vec![AlertRule::RoasHigh, AlertRule::CtrHigh]);
        assert!(fired.iter().all(|f| f.alert.is_none()));
        assert!(engine.evaluate(&reg, &m).is_empty());
    }

    #[test]
    fn campaigns_have_independent_state() {
        let reg_a = registration(100.0, only_budget());
        let mut reg_b = registration(100.0, only_budget());
        reg_b.campaign_id = "C2".into();
        let mut engine = AlertEngine::new(SeverityPolicy::default());

        assert_eq!(engine.evaluate(&reg_a, &metrics(&reg_a, 150.0)).len(), 1);
        assert_eq!(engine.evaluate(&reg_b, &metrics(&reg_b, 150.0)).len(), 1);
    }

    #[test]
    fn disabling_a_firing_rule_rearms_it() {
        let mut reg = registration(10_000.0, only_budget());
        reg.thresholds.cpc_high = Some(0.2);
        let mut engine = AlertEngine::new(SeverityPolicy::default());

        // cpc 0.5
        let fired = engine.evaluate(&reg, &metrics(&reg, 250.0));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule, AlertRule::CpcHigh);
        assert_eq!(engine.state("C1", AlertRule::CpcHigh), RuleState::Firing);

        reg.thresholds.cpc_high = None;
        assert!(engine.evaluate(&reg, &metrics(&reg, 250.0)).is_empty());
        assert_eq!(engine.state("C1", AlertRule::CpcHigh), RuleState::Normal);

        reg.thresholds.cpc_high = Some(0.2);
        let again = engine.evaluate(&reg, &metrics(&reg, 250.0));
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].rule, AlertRule::CpcHigh);
    }
}
