//! Checks the metric keys emitted by the ledger, the monitor and the queue flusher

use metrics::Unit;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use render_queue::config::{MonitorConfig, QueueConfig};
use render_queue::credits::{CostTable, CreditLedger, InMemoryCreditStore};
use render_queue::error::ErrorKind;
use render_queue::job::{
    ImageFormat, PromptParts, ProviderKind, RenderJobData, RenderSettings, Resolution,
    SubscriptionTier,
};
use render_queue::monitor::{FailureMonitor, FailureRecord, LogAlertSink};
use render_queue::queue::PriorityScheduler;
use render_queue::telemetry::{self, MetricsFlusher};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn render_job(render_id: &str) -> RenderJobData {
    RenderJobData {
        render_id: render_id.to_string(),
        project_id: "project-1".to_string(),
        scene_id: "scene-1".to_string(),
        user_id: "user-1".to_string(),
        organization_id: "org-1".to_string(),
        subscription_tier: SubscriptionTier::Growth,
        prompt: PromptParts {
            system: "You are a landscape architect.".to_string(),
            user: "A meadow with a gravel path".to_string(),
        },
        annotations: vec![],
        settings: RenderSettings {
            provider: ProviderKind::GoogleImagen,
            resolution: Resolution::Square2048,
            format: ImageFormat::Jpeg,
            quality: Some(60),
        },
        force_manual_review: false,
    }
}

fn failure(render_id: &str) -> FailureRecord {
    FailureRecord {
        render_id: render_id.to_string(),
        user_id: "user-1".to_string(),
        provider: ProviderKind::GoogleImagen,
        kind: ErrorKind::Generation,
        message: "Generation failed: upstream 503".to_string(),
        is_final: true,
    }
}

#[tokio::test]
async fn pipeline_components_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    // Credits: a 2048 render costs 4 and is refunded in full
    let store = Arc::new(InMemoryCreditStore::with_balances([("org-1", 20)]));
    let ledger = CreditLedger::new(store.clone(), CostTable::default());
    let job = render_job("r-1");
    ledger
        .consume("org-1", "user-1", "r-1", &job.settings)
        .await
        .unwrap();
    ledger
        .refund("org-1", "user-1", "r-1", "Generation failed")
        .await
        .unwrap();

    // Alerts: two failures with a threshold of two trip the kind and provider rules
    let monitor = FailureMonitor::new(
        MonitorConfig {
            pattern_threshold: 2,
            ..MonitorConfig::default()
        },
        vec![Arc::new(LogAlertSink)],
    );
    monitor.record_failure(&failure("r-1"));
    monitor.record_failure(&failure("r-2"));
    let alerts = monitor.check_for_failure_patterns().await;
    assert_eq!(alerts.len(), 2);

    // Queue gauges
    let scheduler = Arc::new(PriorityScheduler::new(QueueConfig::default()));
    scheduler.enqueue(render_job("r-3"), None).unwrap();
    scheduler.enqueue(render_job("r-4"), None).unwrap();
    let flusher = MetricsFlusher::new(scheduler.clone(), Duration::from_secs(60));
    let flushed = flusher.flush();
    assert_eq!(flushed.waiting, 2);

    let entries = snapshotter.snapshot().into_vec();
    let mut counters: HashMap<String, u64> = HashMap::new();
    let mut gauges: HashMap<String, f64> = HashMap::new();
    let mut units: HashMap<String, Option<Unit>> = HashMap::new();
    for (composite_key, unit, _, value) in entries {
        let name = composite_key.key().name().to_string();
        units.insert(name.clone(), unit);
        match value {
            DebugValue::Counter(n) => *counters.entry(name).or_default() += n,
            DebugValue::Gauge(v) => {
                gauges.insert(name, v.into_inner());
            }
            DebugValue::Histogram(_) => {}
        }
    }

    assert_eq!(counters.get("render_credits_consumed_total"), Some(&4));
    assert_eq!(counters.get("render_credits_refunded_total"), Some(&4));
    assert_eq!(counters.get("render_alerts_total"), Some(&2));
    assert_eq!(gauges.get("render_queue_waiting"), Some(&2.0));
    assert_eq!(gauges.get("render_queue_active"), Some(&0.0));
    assert_eq!(gauges.get("render_queue_paused"), Some(&0.0));
    assert_eq!(
        units.get("render_credits_consumed_total"),
        Some(&Some(Unit::Count))
    );
}
