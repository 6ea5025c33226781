//! Worker pool - fixed number of executors pulling jobs from the scheduler

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::job::RenderJobResult;
use crate::queue::scheduler::{AbandonedJob, ClaimedJob, PriorityScheduler};

/// How often finished jobs are pruned and expired leases reaped
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Executes one delivery of a job
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: ClaimedJob) -> Result<RenderJobResult, PipelineError>;

    /// Settle a job that failed because its final lease expired
    async fn abandon(&self, job: AbandonedJob);
}

/// Pool of concurrent workers with an explicit start/close lifecycle
pub struct WorkerPool {
    scheduler: Arc<PriorityScheduler>,
    processor: Arc<dyn JobProcessor>,
    concurrency: usize,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        scheduler: Arc<PriorityScheduler>,
        processor: Arc<dyn JobProcessor>,
        concurrency: usize,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            scheduler,
            processor,
            concurrency: concurrency.max(1),
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the workers and the maintenance task
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }

        for worker_id in 0..self.concurrency {
            let scheduler = self.scheduler.clone();
            let processor = self.processor.clone();
            let shutdown = self.shutdown.subscribe();
            workers.push(tokio::spawn(run_worker(worker_id, scheduler, processor, shutdown)));
        }

        let scheduler = self.scheduler.clone();
        let processor = self.processor.clone();
        let mut shutdown = self.shutdown.subscribe();
        workers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        scheduler.clean();
                        settle_abandoned(&scheduler, processor.as_ref()).await;
                    }
                }
            }
        }));

        info!(concurrency = self.concurrency, "Worker pool started");
    }

    /// Stop claiming new jobs and wait for in-flight jobs to finish
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        self.scheduler.close();

        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pool closed");
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

async fn run_worker(
    worker_id: usize,
    scheduler: Arc<PriorityScheduler>,
    processor: Arc<dyn JobProcessor>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id, "Worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            job = scheduler.next_job() => job,
        };

        // Claiming reaps expired leases; their final failures are settled here.
        settle_abandoned(&scheduler, processor.as_ref()).await;

        let Some(job) = job else {
            break;
        };

        let job_id = job.job_id.clone();
        match processor.process(job).await {
            Ok(_) => debug!(worker_id, job_id = %job_id, "Job processed"),
            Err(e) => debug!(worker_id, job_id = %job_id, error = %e, "Job attempt failed"),
        }

        if *shutdown.borrow() {
            break;
        }
    }
    debug!(worker_id, "Worker stopped");
}

async fn settle_abandoned(scheduler: &PriorityScheduler, processor: &dyn JobProcessor) {
    for job in scheduler.take_abandoned() {
        debug!(job_id = %job.job_id, "Settling abandoned job");
        processor.abandon(job).await;
    }
}
