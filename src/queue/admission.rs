//! Admission control - per-user submission caps by subscription tier

use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::config::AdmissionConfig;
use crate::job::SubscriptionTier;
use crate::queue::scheduler::PriorityScheduler;

/// Verdict for a prospective submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Best-effort rate check over the scheduler's live jobs.
///
/// The count is read from a snapshot and may race with concurrent
/// submissions; credit consumption is the billing boundary.
pub struct AdmissionController {
    scheduler: Arc<PriorityScheduler>,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(scheduler: Arc<PriorityScheduler>, config: AdmissionConfig) -> Self {
        Self { scheduler, config }
    }

    pub fn can_submit(&self, user_id: &str, tier: SubscriptionTier) -> AdmissionDecision {
        let caps = self.config.tiers.get(tier);
        let now = Utc::now();
        let submissions = self.scheduler.live_submissions(user_id);

        let within = |window: Duration| {
            submissions
                .iter()
                .filter(|created_at| now.signed_duration_since(**created_at) < window)
                .count()
        };

        let last_minute = within(Duration::seconds(60));
        if last_minute >= caps.per_minute as usize {
            debug!(user_id = %user_id, tier = tier.as_str(), last_minute, "Minute cap reached");
            return AdmissionDecision::reject(format!(
                "Rate limit exceeded: {} tier allows {} renders per minute",
                tier.as_str(),
                caps.per_minute
            ));
        }

        let last_hour = within(Duration::seconds(3600));
        if last_hour >= caps.per_hour as usize {
            debug!(user_id = %user_id, tier = tier.as_str(), last_hour, "Hour cap reached");
            return AdmissionDecision::reject(format!(
                "Rate limit exceeded: {} tier allows {} renders per hour",
                tier.as_str(),
                caps.per_hour
            ));
        }

        AdmissionDecision::allow()
    }
}
