//! Render Queue
//!
//! Tiered job pipeline for AI landscape-design renders: admission control,
//! priority scheduling, credit accounting, a quality and duplicate gate,
//! object storage publishing and failure monitoring.

pub mod api;
pub mod backend;
pub mod config;
pub mod credits;
pub mod error;
pub mod job;
pub mod monitor;
pub mod pipeline;
pub mod quality;
pub mod queue;
pub mod storage;
pub mod telemetry;

pub use error::{AppError, Result};

use std::sync::Arc;
use std::time::Duration;

use backend::ProviderRegistry;
use credits::{CostTable, CreditLedger, InMemoryCreditStore};
use job::events::EventBus;
use monitor::FailureMonitor;
use pipeline::{GenerationOrchestrator, InMemoryRenderStore, PipelineComponents};
use quality::{PixelAnalyzer, QualityGate, ReviewQueue};
use queue::{AdmissionController, PriorityScheduler, WorkerPool};
use storage::{LocalObjectStore, StoragePublisher};
use telemetry::MetricsFlusher;

/// Application state shared across all handlers
pub struct AppState {
    pub settings: Arc<config::Settings>,
    pub orchestrator: Arc<GenerationOrchestrator>,
    pub workers: Arc<WorkerPool>,
    pub flusher: Arc<MetricsFlusher>,
}

impl AppState {
    /// Wire the in-process pipeline described by the settings
    pub fn build(settings: config::Settings) -> Result<Self> {
        let scheduler = Arc::new(PriorityScheduler::new(settings.queue.clone()));
        let admission = Arc::new(AdmissionController::new(
            scheduler.clone(),
            settings.admission.clone(),
        ));

        let credit_store = InMemoryCreditStore::with_balances(
            settings
                .credits
                .initial_balances
                .iter()
                .map(|(org, balance)| (org.clone(), *balance)),
        );
        let ledger = Arc::new(CreditLedger::new(
            Arc::new(credit_store),
            CostTable::from(&settings.credits),
        ));

        let providers = Arc::new(ProviderRegistry::initialize_from_config(&settings.providers)?);
        let quality = Arc::new(QualityGate::new(
            Arc::new(PixelAnalyzer),
            Arc::new(ReviewQueue::new()),
            settings.quality.clone(),
        ));
        let object_store = LocalObjectStore::new(
            settings.storage.base_path.clone(),
            settings.storage.public_base_url.clone(),
        );
        let storage = Arc::new(StoragePublisher::new(
            Arc::new(object_store),
            settings.storage.clone(),
        ));
        let monitor = Arc::new(FailureMonitor::from_config(settings.monitor.clone())?);
        let events = Arc::new(EventBus::new(&settings.events));

        let components = PipelineComponents {
            scheduler,
            admission,
            ledger,
            providers,
            quality,
            storage,
            renders: Arc::new(InMemoryRenderStore::new()),
            monitor,
            events,
            http: crate::storage::download_client(&settings.storage)?,
        };

        Ok(Self::from_components(settings, components))
    }

    /// Assemble state around already-built pipeline components
    pub fn from_components(settings: config::Settings, components: PipelineComponents) -> Self {
        let scheduler = components.scheduler.clone();
        let orchestrator = Arc::new(GenerationOrchestrator::new(components));
        let workers = Arc::new(WorkerPool::new(
            scheduler.clone(),
            orchestrator.clone(),
            settings.queue.concurrency,
        ));
        let flusher = Arc::new(MetricsFlusher::new(
            scheduler,
            Duration::from_secs(settings.metrics.flush_interval_secs),
        ));

        Self {
            settings: Arc::new(settings),
            orchestrator,
            workers,
            flusher,
        }
    }

    pub fn components(&self) -> &PipelineComponents {
        self.orchestrator.components()
    }

    /// Start workers, the failure monitor and the metrics flusher
    pub async fn start_background(&self) {
        self.workers.start().await;
        self.components().monitor.start().await;
        self.flusher.start().await;
    }

    /// Drain workers and stop timers
    pub async fn shutdown(&self) {
        self.workers.close().await;
        self.components().monitor.stop().await;
        self.flusher.stop().await;
    }
}
