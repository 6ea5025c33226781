//! Credit ledger - cost estimation and per-render consume/refund bookkeeping

pub mod store;

pub use store::{CreditStore, InMemoryCreditStore, UsageRecord};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::CreditsConfig;
use crate::error::PipelineError;
use crate::job::RenderSettings;

const ONE_MEGAPIXEL: u64 = 1_000_000;
const FOUR_MEGAPIXELS: u64 = 4_000_000;

/// Direction of a ledger movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Consume,
    Refund,
}

/// One ledger movement for a render
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreditTransaction {
    pub render_id: String,
    pub organization_id: String,
    pub user_id: String,
    pub amount: u32,
    pub kind: TransactionKind,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a consume call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Credits were taken from the balance
    Charged(u32),
    /// A previous attempt of this render already holds the charge
    AlreadyCharged(u32),
}

impl ConsumeOutcome {
    pub fn amount(&self) -> u32 {
        match self {
            ConsumeOutcome::Charged(amount) | ConsumeOutcome::AlreadyCharged(amount) => *amount,
        }
    }
}

/// Pricing rules for a render
#[derive(Debug, Clone)]
pub struct CostTable {
    pub base_cost: u32,
    pub high_res_surcharge: u32,
    pub ultra_res_surcharge: u32,
    pub high_quality_surcharge: u32,
    pub high_quality_threshold: u8,
    pub billing_multiplier: f64,
}

impl From<&CreditsConfig> for CostTable {
    fn from(config: &CreditsConfig) -> Self {
        Self {
            base_cost: config.base_cost,
            high_res_surcharge: config.high_res_surcharge,
            ultra_res_surcharge: config.ultra_res_surcharge,
            high_quality_surcharge: config.high_quality_surcharge,
            high_quality_threshold: config.high_quality_threshold,
            billing_multiplier: config.billing_multiplier,
        }
    }
}

impl Default for CostTable {
    fn default() -> Self {
        Self::from(&CreditsConfig::default())
    }
}

impl CostTable {
    /// Whole-credit cost of a render before any billing multiplier
    pub fn estimate_cost(&self, settings: &RenderSettings) -> u32 {
        let pixels = settings.resolution.pixel_count();
        let mut cost = self.base_cost;

        if pixels > ONE_MEGAPIXEL {
            cost += self.high_res_surcharge;
        }
        if pixels > FOUR_MEGAPIXELS {
            cost += self.ultra_res_surcharge;
        }
        if settings.quality_or_default() > self.high_quality_threshold {
            cost += self.high_quality_surcharge;
        }

        cost
    }

    /// Cost actually charged, rounded up to whole credits
    pub fn billable_credits(&self, settings: &RenderSettings) -> u32 {
        let scaled = self.estimate_cost(settings) as f64 * self.billing_multiplier.max(0.0);
        scaled.ceil() as u32
    }
}

#[derive(Debug, Clone)]
enum LedgerEntry {
    Consuming,
    Charged(CreditTransaction),
    Refunding(CreditTransaction),
    Refunded {
        consume: CreditTransaction,
        refund: CreditTransaction,
    },
}

/// Ledger guaranteeing at most one consume and one refund per render
pub struct CreditLedger {
    store: Arc<dyn CreditStore>,
    costs: CostTable,
    entries: DashMap<String, LedgerEntry>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn CreditStore>, costs: CostTable) -> Self {
        Self {
            store,
            costs,
            entries: DashMap::new(),
        }
    }

    pub fn estimate_cost(&self, settings: &RenderSettings) -> u32 {
        self.costs.estimate_cost(settings)
    }

    /// Charge the organization for a render.
    ///
    /// Returns [`PipelineError::InsufficientCredits`] when the balance cannot
    /// cover the cost; in that case no transaction is recorded.
    pub async fn consume(
        &self,
        organization_id: &str,
        user_id: &str,
        render_id: &str,
        settings: &RenderSettings,
    ) -> Result<ConsumeOutcome, PipelineError> {
        match self.entries.entry(render_id.to_string()) {
            Entry::Occupied(entry) => {
                return match entry.get() {
                    LedgerEntry::Charged(tx) => Ok(ConsumeOutcome::AlreadyCharged(tx.amount)),
                    LedgerEntry::Consuming => Err(PipelineError::Ledger(format!(
                        "consume for render {render_id} is already in flight"
                    ))),
                    LedgerEntry::Refunding(_) | LedgerEntry::Refunded { .. } => {
                        Err(PipelineError::Ledger(format!(
                            "render {render_id} was refunded and cannot be charged again"
                        )))
                    }
                };
            }
            Entry::Vacant(entry) => {
                entry.insert(LedgerEntry::Consuming);
            }
        }

        let amount = self.costs.billable_credits(settings);
        let consumed = self
            .store
            .consume_credits(organization_id, user_id, render_id, amount)
            .await;

        match consumed {
            Ok(true) => {
                let tx = CreditTransaction {
                    render_id: render_id.to_string(),
                    organization_id: organization_id.to_string(),
                    user_id: user_id.to_string(),
                    amount,
                    kind: TransactionKind::Consume,
                    reason: "render".to_string(),
                    created_at: Utc::now(),
                };
                self.entries
                    .insert(render_id.to_string(), LedgerEntry::Charged(tx));
                counter!("render_credits_consumed_total").increment(amount as u64);
                info!(render_id = %render_id, organization_id = %organization_id, amount, "Consumed credits");
                Ok(ConsumeOutcome::Charged(amount))
            }
            Ok(false) => {
                self.entries.remove(render_id);
                Err(PipelineError::InsufficientCredits)
            }
            Err(e) => {
                self.entries.remove(render_id);
                Err(PipelineError::Ledger(e.to_string()))
            }
        }
    }

    /// Return the credits charged for a render.
    ///
    /// A render without a charge, or one already refunded, yields `Ok(None)`.
    pub async fn refund(
        &self,
        organization_id: &str,
        user_id: &str,
        render_id: &str,
        reason: &str,
    ) -> Result<Option<CreditTransaction>, PipelineError> {
        let consume = match self.entries.get_mut(render_id) {
            Some(mut entry) => match entry.value().clone() {
                LedgerEntry::Charged(consume) => {
                    *entry = LedgerEntry::Refunding(consume.clone());
                    consume
                }
                _ => return Ok(None),
            },
            None => {
                warn!(render_id = %render_id, "Refund requested for render without a charge");
                return Ok(None);
            }
        };

        let refunded = self
            .store
            .refund_credits(organization_id, user_id, render_id, consume.amount, reason)
            .await;

        if let Err(e) = refunded {
            self.entries
                .insert(render_id.to_string(), LedgerEntry::Charged(consume));
            return Err(PipelineError::Ledger(e.to_string()));
        }

        let refund = CreditTransaction {
            render_id: render_id.to_string(),
            organization_id: organization_id.to_string(),
            user_id: user_id.to_string(),
            amount: consume.amount,
            kind: TransactionKind::Refund,
            reason: reason.to_string(),
            created_at: Utc::now(),
        };
        self.entries.insert(
            render_id.to_string(),
            LedgerEntry::Refunded {
                consume,
                refund: refund.clone(),
            },
        );
        counter!("render_credits_refunded_total").increment(refund.amount as u64);
        info!(render_id = %render_id, amount = refund.amount, reason = %reason, "Refunded credits");
        Ok(Some(refund))
    }

    /// Append the billing record for a completed render
    pub async fn record_usage(
        &self,
        organization_id: &str,
        render_id: &str,
        project_id: &str,
        settings: &RenderSettings,
    ) -> Result<(), PipelineError> {
        let usage = UsageRecord {
            organization_id: organization_id.to_string(),
            render_id: render_id.to_string(),
            project_id: project_id.to_string(),
            credits: self.costs.billable_credits(settings),
            provider: settings.provider,
            resolution: settings.resolution,
            recorded_at: Utc::now(),
        };

        self.store
            .record_usage(&usage)
            .await
            .map_err(|e| PipelineError::Persistence(format!("failed to record usage: {e}")))
    }

    /// Transactions recorded for a render, consume first
    pub fn transactions(&self, render_id: &str) -> Vec<CreditTransaction> {
        match self.entries.get(render_id).map(|e| e.value().clone()) {
            Some(LedgerEntry::Charged(tx)) | Some(LedgerEntry::Refunding(tx)) => vec![tx],
            Some(LedgerEntry::Refunded { consume, refund }) => vec![consume, refund],
            Some(LedgerEntry::Consuming) | None => vec![],
        }
    }
}
