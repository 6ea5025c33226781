//! Credit store contract and the in-process implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::job::{ProviderKind, Resolution};

/// Append-only billing record written for each completed render
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub organization_id: String,
    pub render_id: String,
    pub project_id: String,
    pub credits: u32,
    pub provider: ProviderKind,
    pub resolution: Resolution,
    pub recorded_at: DateTime<Utc>,
}

/// Remote credit balance operations.
///
/// `consume_credits` must be a single conditional decrement on the store side;
/// callers never read-modify-write the balance themselves.
#[async_trait]
pub trait CreditStore: Send + Sync {
    /// Decrement the organization balance by `amount` if it can cover it.
    /// Returns `false` when the balance is insufficient.
    async fn consume_credits(
        &self,
        organization_id: &str,
        user_id: &str,
        render_id: &str,
        amount: u32,
    ) -> Result<bool>;

    /// Return `amount` credits to the organization balance
    async fn refund_credits(
        &self,
        organization_id: &str,
        user_id: &str,
        render_id: &str,
        amount: u32,
        reason: &str,
    ) -> Result<()>;

    /// Append a usage record
    async fn record_usage(&self, usage: &UsageRecord) -> Result<()>;
}

/// Credit store held in process memory
#[derive(Default)]
pub struct InMemoryCreditStore {
    balances: DashMap<String, i64>,
    usage: Mutex<Vec<UsageRecord>>,
}

impl InMemoryCreditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balances<I, K>(balances: I) -> Self
    where
        I: IntoIterator<Item = (K, i64)>,
        K: Into<String>,
    {
        let store = Self::new();
        for (organization_id, balance) in balances {
            store.balances.insert(organization_id.into(), balance);
        }
        store
    }

    pub fn set_balance(&self, organization_id: &str, balance: i64) {
        self.balances.insert(organization_id.to_string(), balance);
    }

    pub fn balance(&self, organization_id: &str) -> i64 {
        self.balances.get(organization_id).map(|b| *b).unwrap_or(0)
    }

    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage.lock().clone()
    }
}

#[async_trait]
impl CreditStore for InMemoryCreditStore {
    async fn consume_credits(
        &self,
        organization_id: &str,
        _user_id: &str,
        render_id: &str,
        amount: u32,
    ) -> Result<bool> {
        // The shard write lock makes the check and the decrement one step.
        let consumed = match self.balances.get_mut(organization_id) {
            Some(mut balance) if *balance >= amount as i64 => {
                *balance -= amount as i64;
                true
            }
            _ => false,
        };

        debug!(
            organization_id = %organization_id,
            render_id = %render_id,
            amount,
            consumed,
            "consume_credits"
        );
        Ok(consumed)
    }

    async fn refund_credits(
        &self,
        organization_id: &str,
        _user_id: &str,
        render_id: &str,
        amount: u32,
        reason: &str,
    ) -> Result<()> {
        *self.balances.entry(organization_id.to_string()).or_insert(0) += amount as i64;
        debug!(
            organization_id = %organization_id,
            render_id = %render_id,
            amount,
            reason = %reason,
            "refund_credits"
        );
        Ok(())
    }

    async fn record_usage(&self, usage: &UsageRecord) -> Result<()> {
        self.usage.lock().push(usage.clone());
        Ok(())
    }
}
