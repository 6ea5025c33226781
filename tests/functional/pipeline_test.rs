//! End-to-end tests of the render pipeline with stub providers and a temp object store

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{DynamicImage, RgbImage};
use parking_lot::Mutex;
use render_queue::backend::{CallPolicy, ImageOptions, ImageProvider, ProviderImage, ProviderRegistry};
use render_queue::config::{
    AdmissionConfig, MonitorConfig, QualityConfig, QueueConfig, RetentionConfig, Settings,
    StorageConfig,
};
use render_queue::credits::{CostTable, CreditLedger, InMemoryCreditStore, TransactionKind};
use render_queue::error::{AppError, PipelineError};
use render_queue::job::events::{EventBus, JobEvent};
use render_queue::job::{
    ImageFormat, JobStatus, PromptParts, ProviderKind, QualityStatus, RenderJobData,
    RenderSettings, Resolution, SubscriptionTier,
};
use render_queue::monitor::FailureMonitor;
use render_queue::pipeline::{GenerationOrchestrator, InMemoryRenderStore, PipelineComponents};
use render_queue::quality::{ImageAnalysis, ImageAnalyzer, PerceptualHash, QualityGate, ReviewQueue};
use render_queue::queue::{AdmissionController, CancelOutcome, PriorityScheduler};
use render_queue::storage::{LocalObjectStore, ObjectStore, StoragePublisher};
use render_queue::AppState;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

fn png_base64() -> String {
    let image = RgbImage::from_fn(256, 256, |x, y| image::Rgb([x as u8, y as u8, 128]));
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut buffer, image::ImageFormat::Png)
        .unwrap();
    STANDARD.encode(buffer.into_inner())
}

/// Provider returning a fixed PNG after an optional delay and a number of failures
struct StubProvider {
    image: String,
    delay: Duration,
    failures_left: AtomicU32,
    calls: AtomicU32,
    cancel_on_call: Mutex<Option<(Arc<PriorityScheduler>, String)>>,
}

impl StubProvider {
    fn new() -> Self {
        Self {
            image: png_base64(),
            delay: Duration::ZERO,
            failures_left: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            cancel_on_call: Mutex::new(None),
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    fn failing(times: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(times),
            ..Self::new()
        }
    }
}

#[async_trait]
impl ImageProvider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAiGptImage
    }

    async fn generate_image(
        &self,
        _prompt: &str,
        _options: &ImageOptions,
    ) -> Result<ProviderImage, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let cancel = self.cancel_on_call.lock().take();
        if let Some((scheduler, job_id)) = cancel {
            scheduler.cancel(&job_id).unwrap();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(PipelineError::Generation("provider unavailable".to_string()));
        }
        Ok(ProviderImage {
            image_base64: Some(self.image.clone()),
            ..Default::default()
        })
    }
}

/// Scores every image 0.8 at 1024x1024 and hands out distinct hashes
#[derive(Default)]
struct FixedAnalyzer {
    next: AtomicU64,
}

impl ImageAnalyzer for FixedAnalyzer {
    fn analyze(&self, _image: &[u8]) -> Result<ImageAnalysis, String> {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ImageAnalysis {
            width: 1024,
            height: 1024,
            score: 0.8,
            issues: vec![],
            perceptual_hash: PerceptualHash(n.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
        })
    }
}

struct Harness {
    orchestrator: Arc<GenerationOrchestrator>,
    credits: Arc<InMemoryCreditStore>,
    objects: Arc<LocalObjectStore>,
    _dir: TempDir,
}

impl Harness {
    fn components(&self) -> &PipelineComponents {
        self.orchestrator.components()
    }

    async fn status(&self, render_id: &str) -> JobStatus {
        self.components()
            .renders
            .get_render(render_id)
            .await
            .unwrap()
            .expect("render row should exist")
            .status
    }
}

fn harness(provider: Arc<StubProvider>, policy: CallPolicy, queue: QueueConfig, balance: i64) -> Harness {
    let dir = tempfile::tempdir().unwrap();

    let scheduler = Arc::new(PriorityScheduler::new(queue));
    let admission = Arc::new(AdmissionController::new(
        scheduler.clone(),
        AdmissionConfig::default(),
    ));
    let credits = Arc::new(InMemoryCreditStore::with_balances([("org-1", balance)]));
    let ledger = Arc::new(CreditLedger::new(credits.clone(), CostTable::default()));

    let mut providers = ProviderRegistry::new();
    providers.register(provider, policy);

    let quality = Arc::new(QualityGate::new(
        Arc::new(FixedAnalyzer::default()),
        Arc::new(ReviewQueue::new()),
        QualityConfig::default(),
    ));
    let objects = Arc::new(LocalObjectStore::new(dir.path(), "http://cdn.test"));
    let storage = Arc::new(StoragePublisher::new(objects.clone(), StorageConfig::default()));

    let components = PipelineComponents {
        scheduler,
        admission,
        ledger,
        providers: Arc::new(providers),
        quality,
        storage,
        renders: Arc::new(InMemoryRenderStore::new()),
        monitor: Arc::new(FailureMonitor::new(MonitorConfig::default(), vec![])),
        events: Arc::new(EventBus::default()),
        http: reqwest::Client::new(),
    };

    Harness {
        orchestrator: Arc::new(GenerationOrchestrator::new(components)),
        credits,
        objects,
        _dir: dir,
    }
}

fn fast_policy() -> CallPolicy {
    CallPolicy {
        timeout: Duration::from_secs(5),
        max_retries: 1,
        backoff: Duration::from_millis(1),
    }
}

fn render_job(render_id: &str, tier: SubscriptionTier) -> RenderJobData {
    RenderJobData {
        render_id: render_id.to_string(),
        project_id: "project-1".to_string(),
        scene_id: "scene-1".to_string(),
        user_id: "user-1".to_string(),
        organization_id: "org-1".to_string(),
        subscription_tier: tier,
        prompt: PromptParts {
            system: "You are a landscape architect.".to_string(),
            user: "A drought tolerant front garden".to_string(),
        },
        annotations: vec![],
        settings: RenderSettings {
            provider: ProviderKind::OpenAiGptImage,
            resolution: Resolution::Square1024,
            format: ImageFormat::Png,
            quality: Some(80),
        },
        force_manual_review: false,
    }
}

fn drain(receiver: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_starter_render_completes_end_to_end() {
    let h = harness(Arc::new(StubProvider::new()), fast_policy(), QueueConfig::default(), 10);
    let c = h.components();

    let handle = h
        .orchestrator
        .submit(render_job("r-e2e", SubscriptionTier::Starter), None)
        .await
        .unwrap();
    assert_eq!(handle.priority, 5);
    assert_eq!(h.status("r-e2e").await, JobStatus::Pending);

    let mut events = c.events.subscribe("r-e2e").unwrap();
    let job = c.scheduler.claim().unwrap();
    let result = h.orchestrator.process_job(job).await.unwrap();

    // Credits and billing
    assert_eq!(h.credits.balance("org-1"), 8);
    let transactions = c.ledger.transactions("r-e2e");
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].amount, 2);
    let usage = h.credits.usage_records();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].credits, 2);

    // Storage
    let stored = h
        .objects
        .get("renders", "renders/project-1/r-e2e.png")
        .await
        .unwrap();
    assert!(!stored.is_empty());
    assert!(h
        .objects
        .get("renders", "thumbnails/project-1/r-e2e.jpg")
        .await
        .is_ok());
    assert_eq!(
        result.image_url,
        "http://cdn.test/renders/renders/project-1/r-e2e.png"
    );
    assert_eq!(result.metadata.format, "PNG");
    assert_eq!(result.prompt_hash.len(), 64);

    // Persistence
    let record = c.renders.get_render("r-e2e").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.quality_status, Some(QualityStatus::AutoApproved));
    assert_eq!(record.progress, 100);
    assert_eq!(c.scheduler.get("r-e2e").unwrap().status, JobStatus::Completed);
    assert_eq!(c.quality.approved_count(), 1);

    // Events
    let events = drain(&mut events);
    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {progress:?}");
    assert_eq!(progress.last(), Some(&100));
    assert!(matches!(events.last(), Some(JobEvent::Completed { .. })));
}

#[tokio::test]
async fn test_provider_timeout_fails_and_refunds() {
    let provider = Arc::new(StubProvider::slow(Duration::from_millis(300)));
    let policy = CallPolicy {
        timeout: Duration::from_millis(20),
        max_retries: 1,
        backoff: Duration::from_millis(1),
    };
    let queue = QueueConfig {
        max_attempts: 1,
        ..QueueConfig::default()
    };
    let h = harness(provider, policy, queue, 10);
    let c = h.components();

    h.orchestrator
        .submit(render_job("r-timeout", SubscriptionTier::Pro), None)
        .await
        .unwrap();
    let mut events = c.events.subscribe("r-timeout").unwrap();
    let job = c.scheduler.claim().unwrap();

    let err = h.orchestrator.process_job(job).await.unwrap_err();
    assert!(matches!(&err, PipelineError::Generation(msg) if msg.contains("timed out")));

    assert_eq!(h.status("r-timeout").await, JobStatus::Failed);
    assert_eq!(h.credits.balance("org-1"), 10);

    let transactions = c.ledger.transactions("r-timeout");
    assert_eq!(transactions.len(), 2);
    assert_eq!(transactions[1].kind, TransactionKind::Refund);
    assert_eq!(transactions[1].amount, 2);

    assert_eq!(c.monitor.pattern_checks(), 1);
    assert_eq!(c.scheduler.get("r-timeout").unwrap().status, JobStatus::Failed);
    assert!(matches!(drain(&mut events).last(), Some(JobEvent::Failed { .. })));
}

#[tokio::test]
async fn test_insufficient_credits_fails_without_refund() {
    let provider = Arc::new(StubProvider::new());
    let h = harness(provider.clone(), fast_policy(), QueueConfig::default(), 1);
    let c = h.components();

    h.orchestrator
        .submit(render_job("r-broke", SubscriptionTier::Pro), None)
        .await
        .unwrap();
    let job = c.scheduler.claim().unwrap();

    let err = h.orchestrator.process_job(job).await.unwrap_err();
    assert!(matches!(err, PipelineError::InsufficientCredits));

    let record = c.renders.get_render("r-broke").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("Insufficient credits"));
    assert!(c.ledger.transactions("r-broke").is_empty());
    assert_eq!(h.credits.balance("org-1"), 1);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

    // Not retryable: the job is not redelivered.
    assert!(c.scheduler.claim().is_none());
}

#[tokio::test]
async fn test_retry_reuses_charge_and_holds_for_review() {
    let provider = Arc::new(StubProvider::failing(1));
    let queue = QueueConfig {
        max_attempts: 2,
        backoff_base_ms: 0,
        ..QueueConfig::default()
    };
    let h = harness(provider.clone(), fast_policy(), queue, 10);
    let c = h.components();

    h.orchestrator
        .submit(render_job("r-retry", SubscriptionTier::Growth), None)
        .await
        .unwrap();

    let first = c.scheduler.claim().unwrap();
    assert!(h.orchestrator.process_job(first).await.is_err());
    assert_eq!(h.status("r-retry").await, JobStatus::Pending);
    assert_eq!(c.ledger.transactions("r-retry").len(), 1);
    assert_eq!(h.credits.balance("org-1"), 8);

    let second = c.scheduler.claim().expect("job should be redelivered");
    assert_eq!(second.attempt, 2);
    h.orchestrator.process_job(second).await.unwrap();

    assert_eq!(h.credits.balance("org-1"), 8);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

    let record = c.renders.get_render("r-retry").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.quality_status, Some(QualityStatus::PendingReview));
    assert_eq!(c.quality.review_queue().len(), 1);
    assert_eq!(c.quality.approved_count(), 0);
    assert_eq!(c.monitor.pattern_checks(), 1);
}

#[tokio::test]
async fn test_cancel_pending_render() {
    let h = harness(Arc::new(StubProvider::new()), fast_policy(), QueueConfig::default(), 10);
    let c = h.components();

    h.orchestrator
        .submit(render_job("r-cancel", SubscriptionTier::Pro), None)
        .await
        .unwrap();
    let mut events = c.events.subscribe("r-cancel").unwrap();

    let outcome = h.orchestrator.cancel("r-cancel").await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Cancelled(_)));
    assert_eq!(h.status("r-cancel").await, JobStatus::Cancelled);
    assert!(c.scheduler.claim().is_none());
    assert_eq!(h.credits.balance("org-1"), 10);
    assert!(matches!(
        drain(&mut events).as_slice(),
        [JobEvent::Failed { .. }]
    ));
}

#[tokio::test]
async fn test_cancel_during_generation_refunds_charge() {
    let provider = Arc::new(StubProvider::new());
    let h = harness(provider.clone(), fast_policy(), QueueConfig::default(), 10);
    let c = h.components();

    h.orchestrator
        .submit(render_job("r-mid", SubscriptionTier::Pro), None)
        .await
        .unwrap();
    *provider.cancel_on_call.lock() = Some((c.scheduler.clone(), "r-mid".to_string()));

    let job = c.scheduler.claim().unwrap();
    let err = h.orchestrator.process_job(job).await.unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled));
    assert_eq!(h.status("r-mid").await, JobStatus::Cancelled);
    assert_eq!(c.scheduler.get("r-mid").unwrap().status, JobStatus::Cancelled);
    assert_eq!(h.credits.balance("org-1"), 10);
    assert!(h
        .objects
        .get("renders", "renders/project-1/r-mid.png")
        .await
        .is_err());
}

#[tokio::test]
async fn test_admission_rejects_third_starter_render() {
    let h = harness(Arc::new(StubProvider::new()), fast_policy(), QueueConfig::default(), 10);

    for id in ["r-1", "r-2"] {
        h.orchestrator
            .submit(render_job(id, SubscriptionTier::Starter), None)
            .await
            .unwrap();
    }

    let err = h
        .orchestrator
        .submit(render_job("r-3", SubscriptionTier::Starter), None)
        .await
        .unwrap_err();
    assert!(matches!(&err, AppError::Admission(reason) if reason.contains("2 renders per minute")));
    assert!(h.components().scheduler.get("r-3").is_none());
}

#[tokio::test]
async fn test_worker_pool_drives_renders_to_completion() {
    let h = harness(Arc::new(StubProvider::new()), fast_policy(), QueueConfig::default(), 100);
    let mut settings = Settings::default();
    settings.queue.concurrency = 2;
    let state = AppState::from_components(settings, h.components().clone());

    state.start_background().await;
    for id in ["r-a", "r-b", "r-c"] {
        state
            .orchestrator
            .submit(render_job(id, SubscriptionTier::Growth), None)
            .await
            .unwrap();
    }

    let scheduler = &state.components().scheduler;
    for _ in 0..200 {
        if scheduler.metrics().completed == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    state.shutdown().await;

    assert_eq!(scheduler.metrics().completed, 3);
    assert_eq!(h.credits.balance("org-1"), 94);
}

#[tokio::test]
async fn test_completed_render_id_cannot_be_submitted_again() {
    let h = harness(Arc::new(StubProvider::new()), fast_policy(), QueueConfig::default(), 10);
    let c = h.components();

    h.orchestrator
        .submit(render_job("r-once", SubscriptionTier::Growth), None)
        .await
        .unwrap();
    let job = c.scheduler.claim().unwrap();
    h.orchestrator.process_job(job).await.unwrap();
    assert_eq!(h.credits.balance("org-1"), 8);

    let err = h
        .orchestrator
        .submit(render_job("r-once", SubscriptionTier::Growth), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::DuplicateJob(id) if id == "r-once"));

    assert!(c.scheduler.claim().is_none());
    assert_eq!(h.status("r-once").await, JobStatus::Completed);
    assert_eq!(h.credits.balance("org-1"), 8);
    assert_eq!(h.credits.usage_records().len(), 1);
}

#[tokio::test]
async fn test_pruned_render_id_cannot_be_submitted_again() {
    let queue = QueueConfig {
        completed_retention: RetentionConfig {
            max_count: 0,
            max_age_secs: 3600,
        },
        ..QueueConfig::default()
    };
    let h = harness(Arc::new(StubProvider::new()), fast_policy(), queue, 10);
    let c = h.components();

    h.orchestrator
        .submit(render_job("r-pruned", SubscriptionTier::Growth), None)
        .await
        .unwrap();
    let job = c.scheduler.claim().unwrap();
    h.orchestrator.process_job(job).await.unwrap();
    assert_eq!(c.scheduler.clean(), 1);
    assert!(c.scheduler.get("r-pruned").is_none());

    let err = h
        .orchestrator
        .submit(render_job("r-pruned", SubscriptionTier::Growth), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::DuplicateJob(_)));
    assert!(c.scheduler.claim().is_none());
    assert_eq!(h.credits.balance("org-1"), 8);
}

#[tokio::test]
async fn test_lease_expiring_on_the_last_attempt_refunds_and_reports() {
    let queue = QueueConfig {
        lease_secs: 0,
        max_attempts: 1,
        ..QueueConfig::default()
    };
    let h = harness(Arc::new(StubProvider::new()), fast_policy(), queue, 10);
    let c = h.components();

    let data = render_job("r-stalled", SubscriptionTier::Pro);
    h.orchestrator.submit(data.clone(), None).await.unwrap();
    let mut events = c.events.subscribe("r-stalled").unwrap();

    // The worker charges the render and then stalls past its lease.
    let _job = c.scheduler.claim().unwrap();
    c.ledger
        .consume("org-1", "user-1", "r-stalled", &data.settings)
        .await
        .unwrap();
    assert_eq!(h.credits.balance("org-1"), 8);

    c.scheduler.clean();
    let abandoned = c.scheduler.take_abandoned();
    assert_eq!(abandoned.len(), 1);
    for job in abandoned {
        h.orchestrator.settle_abandoned(job).await;
    }

    assert_eq!(h.credits.balance("org-1"), 10);
    let kinds: Vec<TransactionKind> = c
        .ledger
        .transactions("r-stalled")
        .iter()
        .map(|tx| tx.kind)
        .collect();
    assert_eq!(kinds, vec![TransactionKind::Consume, TransactionKind::Refund]);

    let record = c.renders.get_render("r-stalled").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record
        .error
        .as_deref()
        .is_some_and(|e| e.contains("worker lease expired")));
    assert_eq!(c.scheduler.get("r-stalled").unwrap().status, JobStatus::Failed);
    assert_eq!(c.monitor.pattern_checks(), 1);
    assert!(matches!(drain(&mut events).last(), Some(JobEvent::Failed { .. })));
}
