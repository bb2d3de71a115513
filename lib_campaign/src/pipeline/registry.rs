//! # Metrics Registry
//!
//! Holds every registered campaign together with its latest computed metrics.
//! Registration is explicit and not idempotent: registering an existing id is
//! an error so operator mistakes surface immediately.
//!
//! Metrics are written only by the processing lane that owns the campaign;
//! the lock here just keeps readers from observing a half-written map.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::errors::{PipelineError, PipelineResult};
use crate::models::{CampaignMetrics, CampaignRegistration, NewCampaign, RegistrationUpdate, Thresholds};

struct CampaignRecord {
    registration: CampaignRegistration,
    metrics: Option<CampaignMetrics>,
}

pub struct MetricsRegistry {
    campaigns: RwLock<HashMap<String, CampaignRecord>>,
    default_thresholds: Thresholds,
}

fn check_budget(budget_limit: f64) -> PipelineResult<()> {
    if !budget_limit.is_finite() || budget_limit <= 0.0 {
        return Err(PipelineError::InvalidInput(format!(
            "budget limit must be a positive amount (got {})",
            budget_limit
        )));
    }
    Ok(())
}

impl MetricsRegistry {
    pub fn new(default_thresholds: Thresholds) -> Self {
        Self {
            campaigns: RwLock::new(HashMap::new()),
            default_thresholds,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CampaignRecord>> {
        self.campaigns.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CampaignRecord>> {
        self.campaigns.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Register
    ///
    /// Fails with `AlreadyRegistered` for a known id and `InvalidInput` for an
    /// empty id or a budget that is not strictly positive.
    pub fn register(&self, campaign: NewCampaign, at: DateTime<Utc>) -> PipelineResult<CampaignRegistration> {
        if campaign.campaign_id.trim().is_empty() || campaign.project_id.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "campaign id and project id are required".to_string(),
            ));
        }
        check_budget(campaign.budget_limit)?;

        let mut campaigns = self.write();
        if campaigns.contains_key(&campaign.campaign_id) {
            return Err(PipelineError::AlreadyRegistered(campaign.campaign_id));
        }

        let registration = CampaignRegistration {
            campaign_name: if campaign.campaign_name.is_empty() {
                campaign.campaign_id.clone()
            } else {
                campaign.campaign_name
            },
            campaign_id: campaign.campaign_id,
            project_id: campaign.project_id,
            platform: campaign.platform,
            budget_limit: campaign.budget_limit,
            thresholds: campaign.thresholds.unwrap_or(self.default_thresholds),
            registered_at: at,
        };
        campaigns.insert(
            registration.campaign_id.clone(),
            CampaignRecord {
                registration: registration.clone(),
                metrics: None,
            },
        );
        tracing::info!(
            campaign_id = %registration.campaign_id,
            project_id = %registration.project_id,
            budget_limit = registration.budget_limit,
            "campaign registered"
        );
        Ok(registration)
    }

    pub fn lookup(&self, campaign_id: &str) -> PipelineResult<CampaignRegistration> {
        self.read()
            .get(campaign_id)
            .map(|record| record.registration.clone())
            .ok_or_else(|| PipelineError::NotFound(format!("campaign '{}'", campaign_id)))
    }

    pub fn update_registration(
        &self,
        campaign_id: &str,
        update: RegistrationUpdate,
    ) -> PipelineResult<CampaignRegistration> {
        if let Some(budget_limit) = update.budget_limit {
            check_budget(budget_limit)?;
        }
        let mut campaigns = self.write();
        let record = campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| PipelineError::NotFound(format!("campaign '{}'", campaign_id)))?;

        if let Some(budget_limit) = update.budget_limit {
            record.registration.budget_limit = budget_limit;
        }
        if let Some(thresholds) = update.thresholds {
            record.registration.thresholds = thresholds;
        }
        tracing::info!(campaign_id = %campaign_id, "campaign registration updated");
        Ok(record.registration.clone())
    }

    /// Latest metrics; `NotFound` for unknown campaigns or ones that never
    /// reported.
    pub fn metrics(&self, campaign_id: &str) -> PipelineResult<CampaignMetrics> {
        self.read()
            .get(campaign_id)
            .and_then(|record| record.metrics.clone())
            .ok_or_else(|| PipelineError::NotFound(format!("metrics for campaign '{}'", campaign_id)))
    }

    pub(crate) fn store_metrics(&self, metrics: CampaignMetrics) -> PipelineResult<()> {
        let mut campaigns = self.write();
        let record = campaigns
            .get_mut(&metrics.campaign_id)
            .ok_or_else(|| PipelineError::NotFound(format!("campaign '{}'", metrics.campaign_id)))?;
        record.metrics = Some(metrics);
        Ok(())
    }

    /// Latest metrics of every campaign in `project_id`, ordered by id.
    pub fn project_campaigns(&self, project_id: &str) -> Vec<CampaignMetrics> {
        let mut metrics: Vec<CampaignMetrics> = self
            .read()
            .values()
            .filter(|record| record.registration.project_id == project_id)
            .filter_map(|record| record.metrics.clone())
            .collect();
        metrics.sort_by(|a, b| a.campaign_id.cmp(&b.campaign_id));
        metrics
    }

    pub fn campaign_ids(&self, project_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read()
            .values()
            .filter(|record| record.registration.project_id == project_id)
            .map(|record| record.registration.campaign_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;

    fn campaign(id: &str, budget: f64) -> NewCampaign {
        NewCampaign {
            campaign_id: id.into(),
            project_id: "P1".into(),
            campaign_name: String::new(),
            platform: Platform::Linkedin,
            budget_limit: budget,
            thresholds: None,
        }
    }

    #[test]
    fn register_then_lookup() {
        let registry = MetricsRegistry::new(Thresholds::default());
        let registration = registry.register(campaign("C1", 500.0), Utc::now()).unwrap();
        assert_eq!(registration.campaign_name, "C1");
        assert_eq!(registration.thresholds, Thresholds::default());
        assert_eq!(registry.lookup("C1").unwrap(), registration);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = MetricsRegistry::new(Thresholds::default());
        registry.register(campaign("C1", 500.0), Utc::now()).unwrap();
        let err = registry.register(campaign("C1", 700.0), Utc::now()).unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyRegistered(id) if id == "C1"));
        assert_eq!(registry.lookup("C1").unwrap().budget_limit, 500.0);
    }

    #[test]
    fn non_positive_budget_is_invalid() {
        let registry = MetricsRegistry::new(Thresholds::default());
        for budget in [0.0, -10.0, f64::NAN] {
            assert!(matches!(
                registry.register(campaign("C1", budget), Utc::now()),
                Err(PipelineError::InvalidInput(_))
            ));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_campaign_is_not_found() {
        let registry = MetricsRegistry::new(Thresholds::default());
        assert!(matches!(registry.lookup("nope"), Err(PipelineError::NotFound(_))));
        assert!(matches!(registry.metrics("nope"), Err(PipelineError::NotFound(_))));
    }

    #[test]
    fn update_changes_budget_and_thresholds() {
        let registry = MetricsRegistry::new(Thresholds::default());
        registry.register(campaign("C1", 500.0), Utc::now()).unwrap();

        let thresholds = Thresholds {
            cpc_high: None,
            ..Thresholds::default()
        };
        let updated = registry
            .update_registration(
                "C1",
                RegistrationUpdate {
                    budget_limit: Some(900.0),
                    thresholds: Some(thresholds),
                },
            )
            .unwrap();
        assert_eq!(updated.budget_limit, 900.0);
        assert_eq!(updated.thresholds.cpc_high, None);

        assert!(matches!(
            registry.update_registration("C1", RegistrationUpdate { budget_limit: Some(0.0), thresholds: None }),
            Err(PipelineError::InvalidInput(_))
        ));
    }
}
