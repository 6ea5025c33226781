//! Unit tests for the credit ledger against in-memory and failing stores

use async_trait::async_trait;
use parking_lot::Mutex;
use render_queue::config::CreditsConfig;
use render_queue::credits::{
    ConsumeOutcome, CostTable, CreditLedger, CreditStore, InMemoryCreditStore, TransactionKind,
    UsageRecord,
};
use render_queue::error::{AppError, PipelineError, Result};
use render_queue::job::{ImageFormat, ProviderKind, RenderSettings, Resolution};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn settings(resolution: Resolution, quality: u8) -> RenderSettings {
    RenderSettings {
        provider: ProviderKind::OpenAiGptImage,
        resolution,
        format: ImageFormat::Png,
        quality: Some(quality),
    }
}

/// Store whose operations can be made to fail on demand
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryCreditStore,
    fail_consume: AtomicBool,
    fail_refund: AtomicBool,
    refunds: Mutex<Vec<(String, u32)>>,
}

#[async_trait]
impl CreditStore for FlakyStore {
    async fn consume_credits(
        &self,
        organization_id: &str,
        user_id: &str,
        render_id: &str,
        amount: u32,
    ) -> Result<bool> {
        if self.fail_consume.load(Ordering::SeqCst) {
            return Err(AppError::Internal("credit service unavailable".to_string()));
        }
        self.inner
            .consume_credits(organization_id, user_id, render_id, amount)
            .await
    }

    async fn refund_credits(
        &self,
        organization_id: &str,
        user_id: &str,
        render_id: &str,
        amount: u32,
        reason: &str,
    ) -> Result<()> {
        if self.fail_refund.load(Ordering::SeqCst) {
            return Err(AppError::Internal("credit service unavailable".to_string()));
        }
        self.refunds.lock().push((render_id.to_string(), amount));
        self.inner
            .refund_credits(organization_id, user_id, render_id, amount, reason)
            .await
    }

    async fn record_usage(&self, usage: &UsageRecord) -> Result<()> {
        self.inner.record_usage(usage).await
    }
}

#[test]
fn test_default_cost_table() {
    let costs = CostTable::default();

    assert_eq!(costs.billable_credits(&settings(Resolution::Square1024, 80)), 2);
    assert_eq!(costs.billable_credits(&settings(Resolution::Square2048, 80)), 4);
    assert_eq!(costs.billable_credits(&settings(Resolution::Square4096, 80)), 4);
}

#[test]
fn test_billing_multiplier_rounds_up() {
    let costs = CostTable::from(&CreditsConfig {
        billing_multiplier: 1.25,
        ..CreditsConfig::default()
    });

    // 2 credits * 1.25 = 2.5, billed as 3
    assert_eq!(costs.billable_credits(&settings(Resolution::Square1024, 50)), 3);
}

#[tokio::test]
async fn test_concurrent_consumes_never_overdraw() {
    let store = Arc::new(InMemoryCreditStore::with_balances([("org-1", 5)]));
    let ledger = Arc::new(CreditLedger::new(store.clone(), CostTable::default()));

    let tasks: Vec<_> = (0..6)
        .map(|i| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .consume("org-1", "u-1", &format!("r-{i}"), &settings(Resolution::Square1024, 80))
                    .await
            })
        })
        .collect();

    let mut charged = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(ConsumeOutcome::Charged(2)) => charged += 1,
            Err(PipelineError::InsufficientCredits) => rejected += 1,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    assert_eq!(charged, 2);
    assert_eq!(rejected, 4);
    assert_eq!(store.balance("org-1"), 1);
}

#[tokio::test]
async fn test_store_failure_on_consume_leaves_no_charge() {
    let store = Arc::new(FlakyStore::default());
    store.inner.set_balance("org-1", 10);
    store.fail_consume.store(true, Ordering::SeqCst);
    let ledger = CreditLedger::new(store.clone(), CostTable::default());
    let render = settings(Resolution::Square1024, 80);

    let err = ledger.consume("org-1", "u-1", "r-1", &render).await.unwrap_err();
    assert!(matches!(err, PipelineError::Ledger(_)));
    assert!(err.is_retryable());
    assert!(ledger.transactions("r-1").is_empty());

    // Nothing was charged, so a refund is a no-op.
    assert!(ledger.refund("org-1", "u-1", "r-1", "failed").await.unwrap().is_none());

    store.fail_consume.store(false, Ordering::SeqCst);
    let outcome = ledger.consume("org-1", "u-1", "r-1", &render).await.unwrap();
    assert_eq!(outcome, ConsumeOutcome::Charged(2));
    assert_eq!(store.inner.balance("org-1"), 8);
}

#[tokio::test]
async fn test_failed_refund_can_be_retried() {
    let store = Arc::new(FlakyStore::default());
    store.inner.set_balance("org-1", 10);
    let ledger = CreditLedger::new(store.clone(), CostTable::default());
    ledger
        .consume("org-1", "u-1", "r-1", &settings(Resolution::Square2048, 80))
        .await
        .unwrap();

    store.fail_refund.store(true, Ordering::SeqCst);
    assert!(ledger.refund("org-1", "u-1", "r-1", "Generation failed").await.is_err());
    assert_eq!(store.inner.balance("org-1"), 6);

    store.fail_refund.store(false, Ordering::SeqCst);
    let refund = ledger
        .refund("org-1", "u-1", "r-1", "Generation failed")
        .await
        .unwrap()
        .expect("refund should be issued");
    assert_eq!(refund.amount, 4);
    assert_eq!(refund.kind, TransactionKind::Refund);
    assert_eq!(store.inner.balance("org-1"), 10);

    // A third request finds the refund already recorded.
    assert!(ledger.refund("org-1", "u-1", "r-1", "again").await.unwrap().is_none());
    assert_eq!(store.refunds.lock().len(), 1);
}

#[tokio::test]
async fn test_refunded_render_cannot_be_charged_again() {
    let store = Arc::new(InMemoryCreditStore::with_balances([("org-1", 10)]));
    let ledger = CreditLedger::new(store.clone(), CostTable::default());
    let render = settings(Resolution::Square1024, 80);

    ledger.consume("org-1", "u-1", "r-1", &render).await.unwrap();
    ledger.refund("org-1", "u-1", "r-1", "cancelled").await.unwrap();

    let err = ledger.consume("org-1", "u-1", "r-1", &render).await.unwrap_err();
    assert!(matches!(err, PipelineError::Ledger(_)));
    assert_eq!(store.balance("org-1"), 10);

    let kinds: Vec<_> = ledger.transactions("r-1").iter().map(|tx| tx.kind).collect();
    assert_eq!(kinds, vec![TransactionKind::Consume, TransactionKind::Refund]);
}
