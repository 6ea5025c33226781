//! Generation orchestrator - drives a claimed job through the render pipeline

use async_trait::async_trait;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backend::prompt::{build_prompt, prompt_hash};
use crate::backend::{invoke_with_retry, ImageOptions, ProviderRegistry};
use crate::credits::{ConsumeOutcome, CreditLedger};
use crate::error::{AppError, ErrorKind, PipelineError, Result};
use crate::job::events::{EventBus, JobEvent};
use crate::job::{JobStatus, QualityStatus, RenderJobData, RenderJobResult, RenderMetadata};
use crate::monitor::{FailureMonitor, FailureRecord};
use crate::pipeline::store::{RenderStore, RenderUpdate};
use crate::quality::{QualityCheck, QualityGate, QualityOutcome, QualityResult};
use crate::queue::admission::AdmissionController;
use crate::queue::scheduler::{AbandonedJob, CancelOutcome, ClaimedJob, JobHandle, PriorityScheduler};
use crate::queue::worker::JobProcessor;
use crate::storage::{prepare_image_buffer, StoragePublisher};

/// Progress checkpoints, in pipeline order
pub mod checkpoints {
    pub const STARTED: u8 = 5;
    pub const CHARGED: u8 = 10;
    pub const PROMPT_READY: u8 = 30;
    pub const GENERATED: u8 = 70;
    pub const QUALITY_CHECKED: u8 = 80;
    pub const STORED: u8 = 95;
    pub const COMPLETED: u8 = 100;
}

/// Collaborators the orchestrator drives
#[derive(Clone)]
pub struct PipelineComponents {
    pub scheduler: Arc<PriorityScheduler>,
    pub admission: Arc<AdmissionController>,
    pub ledger: Arc<CreditLedger>,
    pub providers: Arc<ProviderRegistry>,
    pub quality: Arc<QualityGate>,
    pub storage: Arc<StoragePublisher>,
    pub renders: Arc<dyn RenderStore>,
    pub monitor: Arc<FailureMonitor>,
    pub events: Arc<EventBus>,
    pub http: reqwest::Client,
}

pub struct GenerationOrchestrator {
    components: PipelineComponents,
}

impl GenerationOrchestrator {
    pub fn new(components: PipelineComponents) -> Self {
        Self { components }
    }

    pub fn components(&self) -> &PipelineComponents {
        &self.components
    }

    /// Admit and queue a render
    pub async fn submit(&self, data: RenderJobData, priority: Option<u8>) -> Result<JobHandle> {
        data.validate()?;

        // The queue forgets finished jobs after retention; the render row does not.
        let known = self
            .components
            .renders
            .get_render(&data.render_id)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        if known.is_some() {
            return Err(AppError::DuplicateJob(data.render_id));
        }

        let decision = self
            .components
            .admission
            .can_submit(&data.user_id, data.subscription_tier);
        if !decision.allowed {
            let reason = decision
                .reason
                .unwrap_or_else(|| "Submission rejected".to_string());
            info!(user_id = %data.user_id, reason = %reason, "Render rejected by admission control");
            return Err(AppError::Admission(reason));
        }

        let render_id = data.render_id.clone();
        let handle = self.components.scheduler.enqueue(data, priority)?;
        self.components
            .renders
            .update_render_status(&render_id, RenderUpdate::status(JobStatus::Pending))
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        info!(render_id = %render_id, priority = handle.priority, "Render queued");
        Ok(handle)
    }

    /// Cancel a render; a job that already paid is refunded
    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let outcome = self.components.scheduler.cancel(job_id)?;

        if let CancelOutcome::Cancelled(snapshot) = &outcome {
            let data = &snapshot.data;
            let reason = PipelineError::Cancelled.to_string();

            if let Err(e) = self
                .components
                .ledger
                .refund(&data.organization_id, &data.user_id, &data.render_id, &reason)
                .await
            {
                error!(render_id = %data.render_id, error = %e, "Refund for cancelled render failed");
            }
            if let Err(e) = self
                .components
                .renders
                .update_render_status(&data.render_id, RenderUpdate::failed(JobStatus::Cancelled, &reason))
                .await
            {
                error!(render_id = %data.render_id, error = %e, "Failed to persist cancellation");
            }
            self.components.events.publish(JobEvent::Failed {
                job_id: job_id.to_string(),
                error: reason,
            });
        }

        Ok(outcome)
    }

    /// Run one delivery of a job and settle it with the scheduler
    pub async fn process_job(&self, job: ClaimedJob) -> std::result::Result<RenderJobResult, PipelineError> {
        let span = info_span!(
            "render",
            render_id = %job.data.render_id,
            job_id = %job.job_id,
            attempt = job.attempt,
            provider = job.data.settings.provider.as_str(),
        );

        async {
            let started = Instant::now();
            match self.execute(&job, started).await {
                Ok(result) => {
                    self.finish(&job, &result, started);
                    Ok(result)
                }
                Err(err) => Err(self.handle_failure(&job, err).await),
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        job: &ClaimedJob,
        started: Instant,
    ) -> std::result::Result<RenderJobResult, PipelineError> {
        let c = &self.components;
        let data = &job.data;
        let settings = &data.settings;

        // 1. start
        c.renders
            .update_render_status(&data.render_id, RenderUpdate::status(JobStatus::Active))
            .await?;
        info!("Render started");
        self.report_progress(job, checkpoints::STARTED);

        // 2. charge
        self.checkpoint(job)?;
        match c
            .ledger
            .consume(&data.organization_id, &data.user_id, &data.render_id, settings)
            .await?
        {
            ConsumeOutcome::Charged(amount) => debug!(amount, "Credits charged"),
            ConsumeOutcome::AlreadyCharged(amount) => debug!(amount, "Charge carried over from a previous attempt"),
        }
        self.report_progress(job, checkpoints::CHARGED);

        // 3. prompt and provider
        self.checkpoint(job)?;
        let prompt = build_prompt(settings.provider, &data.prompt, &data.annotations);
        let hash = prompt_hash(&prompt);
        let provider = c.providers.get(settings.provider).ok_or_else(|| {
            PipelineError::Generation(format!("Provider {} is not configured", settings.provider.as_str()))
        })?;
        let options = ImageOptions::from_settings(settings);
        self.report_progress(job, checkpoints::PROMPT_READY);

        // 4. generate
        let generated = invoke_with_retry(provider, &prompt, &options).await?;
        let image = prepare_image_buffer(&generated, &c.http).await?;
        self.report_progress(job, checkpoints::GENERATED);

        // 5. quality gate
        self.checkpoint(job)?;
        let (quality, quality_status, image) = self.run_quality_gate(job, image).await?;
        self.report_progress(job, checkpoints::QUALITY_CHECKED);

        // 6. publish
        self.checkpoint(job)?;
        let stored = c
            .storage
            .store_render_result(&data.render_id, &data.project_id, &image, settings, &hash)
            .await?;
        self.report_progress(job, checkpoints::STORED);

        // 7. persist and bill
        self.checkpoint(job)?;
        let result = RenderJobResult {
            render_id: data.render_id.clone(),
            image_url: stored.image_url,
            thumbnail_url: stored.thumbnail_url,
            processing_time: started.elapsed().as_millis() as u64,
            prompt_hash: hash,
            metadata: RenderMetadata {
                width: stored.width,
                height: stored.height,
                format: stored.format.as_str().to_string(),
                file_size: stored.file_size,
            },
        };

        c.renders
            .update_render_status(
                &data.render_id,
                RenderUpdate {
                    status: Some(JobStatus::Completed),
                    progress: Some(checkpoints::COMPLETED),
                    quality_status: Some(quality_status),
                    quality_score: Some(quality.score),
                    error: None,
                    result: Some(result.clone()),
                },
            )
            .await?;
        c.ledger
            .record_usage(&data.organization_id, &data.render_id, &data.project_id, settings)
            .await?;

        if quality_status == QualityStatus::AutoApproved {
            c.quality
                .register_approved(&data.render_id, &data.project_id, &quality.perceptual_hash);
        }
        self.report_progress(job, checkpoints::COMPLETED);

        Ok(result)
    }

    /// Image scoring is CPU bound, so it runs on the blocking pool
    async fn run_quality_gate(
        &self,
        job: &ClaimedJob,
        image: Vec<u8>,
    ) -> std::result::Result<(QualityResult, QualityStatus, Vec<u8>), PipelineError> {
        let gate = self.components.quality.clone();
        let data = job.data.clone();
        let attempts_made = job.attempt;

        let (outcome, image) = tokio::task::spawn_blocking(move || {
            let outcome = gate.perform_quality_check(QualityCheck {
                render_id: &data.render_id,
                project_id: &data.project_id,
                image: &image,
                settings: &data.settings,
                attempts_made,
                force_manual_review: data.force_manual_review,
            });
            (outcome, image)
        })
        .await
        .map_err(|e| PipelineError::Quality {
            issues: vec![format!("Quality check aborted: {}", e)],
        })?;

        match outcome {
            QualityOutcome::Accepted { result, status } => {
                debug!(score = result.score, status = ?status, "Quality accepted");
                Ok((result, status, image))
            }
            QualityOutcome::Rejected(rejection) => Err(rejection.into()),
        }
    }

    fn finish(&self, job: &ClaimedJob, result: &RenderJobResult, started: Instant) {
        let c = &self.components;

        if let Err(e) = c.scheduler.complete(&job.job_id, job.lease_id, result.clone()) {
            warn!(error = %e, "Scheduler rejected completion");
        }

        counter!("render_jobs_completed_total").increment(1);
        histogram!("render_processing_ms").record(started.elapsed().as_millis() as f64);
        c.monitor
            .record_success(&job.data.user_id, job.data.settings.provider);

        c.events.publish(JobEvent::Completed {
            job_id: job.job_id.clone(),
            result: result.clone(),
        });
        info!(processing_time = result.processing_time, "Render completed");
    }

    /// Failure path: persist, compensate, settle, publish, check patterns
    async fn handle_failure(&self, job: &ClaimedJob, err: PipelineError) -> PipelineError {
        let c = &self.components;

        if !c.scheduler.holds_lease(&job.job_id, job.lease_id) {
            warn!(error = %err, "Lease lost before the failure was settled; leaving it to the queue");
            return err;
        }

        let cancel_requested = c.scheduler.is_cancel_requested(&job.job_id);
        let is_final = cancel_requested || job.is_final_failure(&err);
        let status = if !is_final {
            JobStatus::Pending
        } else if cancel_requested || err.kind() == ErrorKind::Cancelled {
            JobStatus::Cancelled
        } else {
            JobStatus::Failed
        };

        error!(error = %err, kind = err.kind().as_str(), is_final, "Render failed");
        self.compensate(&job.data, &err, status, is_final).await;

        match c.scheduler.fail(&job.job_id, job.lease_id, &err) {
            Ok(disposition) => debug!(disposition = ?disposition, "Failure settled"),
            Err(e) => warn!(error = %e, "Scheduler rejected failure"),
        }

        if is_final {
            c.events.publish(JobEvent::Failed {
                job_id: job.job_id.clone(),
                error: err.to_string(),
            });
        }
        c.monitor.check_for_failure_patterns().await;

        err
    }

    /// Settle a job whose last delivery ended with an expired lease
    pub async fn settle_abandoned(&self, job: AbandonedJob) {
        let c = &self.components;
        let span = info_span!(
            "render",
            render_id = %job.data.render_id,
            job_id = %job.job_id,
            attempt = job.attempts_made,
            provider = job.data.settings.provider.as_str(),
        );

        async {
            error!(error = %job.error, status = job.status.as_str(), "Render abandoned by its worker");
            self.compensate(&job.data, &job.error, job.status, true).await;
            c.events.publish(JobEvent::Failed {
                job_id: job.job_id.clone(),
                error: job.error.to_string(),
            });
            c.monitor.check_for_failure_patterns().await;
        }
        .instrument(span)
        .await
    }

    /// Persist the failure, refund a final one and record it with the monitor
    async fn compensate(&self, data: &RenderJobData, err: &PipelineError, status: JobStatus, is_final: bool) {
        let c = &self.components;

        if let Err(e) = c
            .renders
            .update_render_status(&data.render_id, RenderUpdate::failed(status, err.to_string()))
            .await
        {
            error!(error = %e, "Failed to persist render failure");
        }

        if is_final && err.requires_refund() {
            match c
                .ledger
                .refund(&data.organization_id, &data.user_id, &data.render_id, &err.to_string())
                .await
            {
                Ok(Some(tx)) => info!(amount = tx.amount, "Credits refunded"),
                Ok(None) => debug!("No charge to refund"),
                Err(e) => error!(error = %e, "Refund failed"),
            }
        }

        c.monitor.record_failure(&FailureRecord {
            render_id: data.render_id.clone(),
            user_id: data.user_id.clone(),
            provider: data.settings.provider,
            kind: err.kind(),
            message: err.to_string(),
            is_final,
        });
        counter!("render_jobs_failed_total", "kind" => err.kind().as_str()).increment(1);
    }

    fn checkpoint(&self, job: &ClaimedJob) -> std::result::Result<(), PipelineError> {
        let scheduler = &self.components.scheduler;
        if scheduler.is_cancel_requested(&job.job_id) {
            return Err(PipelineError::Cancelled);
        }
        if !scheduler.holds_lease(&job.job_id, job.lease_id) {
            return Err(PipelineError::Generation("worker lease expired".to_string()));
        }
        Ok(())
    }

    fn report_progress(&self, job: &ClaimedJob, progress: u8) {
        match self
            .components
            .scheduler
            .update_progress(&job.job_id, job.lease_id, progress)
        {
            Ok(true) => {
                debug!(progress, "Progress");
                self.components.events.publish(JobEvent::Progress {
                    job_id: job.job_id.clone(),
                    progress,
                });
            }
            Ok(false) => {}
            Err(e) => warn!(progress, error = %e, "Progress update rejected"),
        }
    }
}

#[async_trait]
impl JobProcessor for GenerationOrchestrator {
    async fn process(&self, job: ClaimedJob) -> std::result::Result<RenderJobResult, PipelineError> {
        self.process_job(job).await
    }

    async fn abandon(&self, job: AbandonedJob) {
        self.settle_abandoned(job).await
    }
}
