//! Priority scheduler - tiered priority queue with retries, leases and retention

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{QueueConfig, RetentionConfig};
use crate::error::{AppError, PipelineError, Result};
use crate::job::{JobStatus, RenderJobData, RenderJobResult};

/// Returned to the submitter once a job is queued
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: String,
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
}

/// A job delivered to a worker
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job_id: String,
    pub lease_id: Uuid,
    /// 1-based delivery attempt
    pub attempt: u32,
    pub max_attempts: u32,
    pub data: RenderJobData,
}

impl ClaimedJob {
    /// Whether a failure of this attempt ends the job for good
    pub fn is_final_failure(&self, error: &PipelineError) -> bool {
        !error.is_retryable() || self.attempt >= self.max_attempts
    }
}

/// Point-in-time queue counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetricsSnapshot {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub paused: usize,
    pub total: usize,
}

/// Read model of a job for status queries
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub priority: u8,
    pub attempts_made: u32,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<RenderJobResult>,
    pub data: RenderJobData,
}

/// What happened to a failed delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Retrying { attempt: u32, delay: Duration },
    Failed,
    Cancelled,
}

/// A job whose final delivery ended with an expired lease.
///
/// No worker will settle it, so the owner of the queue must compensate.
#[derive(Debug, Clone)]
pub struct AbandonedJob {
    pub job_id: String,
    pub attempts_made: u32,
    pub status: JobStatus,
    pub error: PipelineError,
    pub data: RenderJobData,
}

/// Result of a cancel request
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The job was not running and is now cancelled
    Cancelled(JobSnapshot),
    /// The job is running and will stop at its next checkpoint
    Requested,
    /// The job had already finished
    AlreadyFinished(JobStatus),
}

#[derive(Debug)]
struct Lease {
    id: Uuid,
    expires_at: Instant,
}

#[derive(Debug)]
struct JobRecord {
    data: RenderJobData,
    priority: u8,
    seq: u64,
    status: JobStatus,
    progress: u8,
    attempts_made: u32,
    cancel_requested: bool,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    finished: Option<Instant>,
    delayed_until: Option<Instant>,
    lease: Option<Lease>,
    error: Option<String>,
    result: Option<RenderJobResult>,
}

impl JobRecord {
    fn snapshot(&self, job_id: &str) -> JobSnapshot {
        JobSnapshot {
            job_id: job_id.to_string(),
            status: self.status,
            progress: self.progress,
            priority: self.priority,
            attempts_made: self.attempts_made,
            cancel_requested: self.cancel_requested,
            created_at: self.created_at,
            finished_at: self.finished_at,
            error: self.error.clone(),
            result: self.result.clone(),
            data: self.data.clone(),
        }
    }

    fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, JobRecord>,
    /// Lowest priority value first, then submission order
    waiting: BinaryHeap<Reverse<(u8, u64, String)>>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    abandoned: Vec<AbandonedJob>,
    next_seq: u64,
    paused: bool,
    closed: bool,
}

impl QueueState {
    fn push_waiting(&mut self, job_id: &str) {
        if let Some(job) = self.jobs.get(job_id) {
            self.waiting
                .push(Reverse((job.priority, job.seq, job_id.to_string())));
        }
    }

    /// Move due delayed jobs back to waiting
    fn promote_delayed(&mut self, now: Instant) {
        let due: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, job)| {
                job.status == JobStatus::Pending && job.delayed_until.is_some_and(|at| at <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for job_id in due {
            if let Some(job) = self.jobs.get_mut(&job_id) {
                job.delayed_until = None;
            }
            self.push_waiting(&job_id);
        }
    }

    /// Redeliver jobs whose worker stopped renewing the lease
    fn reap_expired_leases(&mut self, now: Instant, backoff_base: Duration, max_attempts: u32) {
        let expired: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, job)| {
                job.status == JobStatus::Active
                    && job.lease.as_ref().is_some_and(|lease| lease.expires_at <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for job_id in expired {
            let error = PipelineError::Generation("worker lease expired".to_string());
            let disposition = self.settle_failure(&job_id, &error, now, backoff_base, max_attempts);
            if matches!(disposition, FailureDisposition::Retrying { .. }) {
                warn!(job_id = %job_id, "Lease expired, redelivering job");
                continue;
            }

            warn!(job_id = %job_id, "Lease expired on the final attempt");
            if let Some(job) = self.jobs.get(&job_id) {
                self.abandoned.push(AbandonedJob {
                    job_id: job_id.clone(),
                    attempts_made: job.attempts_made,
                    status: job.status,
                    error,
                    data: job.data.clone(),
                });
            }
        }
    }

    fn settle_failure(
        &mut self,
        job_id: &str,
        error: &PipelineError,
        now: Instant,
        backoff_base: Duration,
        max_attempts: u32,
    ) -> FailureDisposition {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return FailureDisposition::Failed;
        };

        job.lease = None;
        job.error = Some(error.to_string());

        let retry = error.is_retryable() && !job.cancel_requested && job.attempts_made < max_attempts;

        if retry {
            let delay = backoff(backoff_base, job.attempts_made);
            job.status = JobStatus::Pending;
            job.delayed_until = Some(now + delay);
            return FailureDisposition::Retrying {
                attempt: job.attempts_made,
                delay,
            };
        }

        let cancelled = job.cancel_requested || matches!(error, PipelineError::Cancelled);
        job.status = if cancelled {
            JobStatus::Cancelled
        } else {
            JobStatus::Failed
        };
        job.finished = Some(now);
        job.finished_at = Some(Utc::now());
        self.failed.push_back(job_id.to_string());

        if cancelled {
            FailureDisposition::Cancelled
        } else {
            FailureDisposition::Failed
        }
    }

    fn prune(&mut self, completed: &RetentionConfig, failed: &RetentionConfig, now: Instant) -> usize {
        let mut removed = 0;
        for (order, retention) in [(true, completed), (false, failed)] {
            let max_age = Duration::from_secs(retention.max_age_secs);
            loop {
                let list = if order { &self.completed } else { &self.failed };
                let Some(oldest) = list.front().cloned() else {
                    break;
                };

                let expired = self
                    .jobs
                    .get(&oldest)
                    .and_then(|job| job.finished)
                    .map_or(true, |finished| now.saturating_duration_since(finished) >= max_age);

                if list.len() <= retention.max_count && !expired {
                    break;
                }

                if order {
                    self.completed.pop_front();
                } else {
                    self.failed.pop_front();
                }
                if self.jobs.get(&oldest).is_some_and(|job| !job.is_live()) {
                    self.jobs.remove(&oldest);
                    removed += 1;
                }
            }
        }
        removed
    }
}

fn backoff(base: Duration, attempts_made: u32) -> Duration {
    base.saturating_mul(1u32 << attempts_made.saturating_sub(1).min(16))
}

/// In-process job queue ordered by tier priority
pub struct PriorityScheduler {
    state: Mutex<QueueState>,
    notify: Notify,
    config: QueueConfig,
}

impl PriorityScheduler {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queue a job; priority defaults from the submitting tier
    pub fn enqueue(&self, data: RenderJobData, priority: Option<u8>) -> Result<JobHandle> {
        let priority = priority.unwrap_or(*self.config.tier_priority.get(data.subscription_tier));
        let job_id = data.render_id.clone();

        let mut state = self.state.lock();
        if state.closed {
            return Err(AppError::QueueClosed);
        }
        // A render id is accepted once, whether its job is live or finished.
        if state.jobs.contains_key(&job_id) {
            return Err(AppError::DuplicateJob(job_id));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let created_at = Utc::now();

        state.jobs.insert(
            job_id.clone(),
            JobRecord {
                data,
                priority,
                seq,
                status: JobStatus::Pending,
                progress: 0,
                attempts_made: 0,
                cancel_requested: false,
                created_at,
                finished_at: None,
                finished: None,
                delayed_until: None,
                lease: None,
                error: None,
                result: None,
            },
        );
        state.push_waiting(&job_id);
        drop(state);

        self.notify.notify_one();
        debug!(job_id = %job_id, priority, "Job queued");

        Ok(JobHandle {
            job_id,
            priority,
            enqueued_at: created_at,
        })
    }

    /// Hand the highest-priority waiting job to the caller, if any
    pub fn claim(&self) -> Option<ClaimedJob> {
        let now = Instant::now();
        let backoff_base = Duration::from_millis(self.config.backoff_base_ms);
        let lease_duration = Duration::from_secs(self.config.lease_secs);

        let mut state = self.state.lock();
        state.reap_expired_leases(now, backoff_base, self.config.max_attempts);
        state.promote_delayed(now);

        if state.paused || state.closed {
            return None;
        }

        while let Some(Reverse((_, seq, job_id))) = state.waiting.pop() {
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            // Stale heap entries: cancelled, re-queued or already delivered
            if job.seq != seq || job.status != JobStatus::Pending || job.delayed_until.is_some() {
                continue;
            }

            let lease_id = Uuid::new_v4();
            job.status = JobStatus::Active;
            job.attempts_made += 1;
            job.lease = Some(Lease {
                id: lease_id,
                expires_at: now + lease_duration,
            });

            return Some(ClaimedJob {
                job_id,
                lease_id,
                attempt: job.attempts_made,
                max_attempts: self.config.max_attempts,
                data: job.data.clone(),
            });
        }

        None
    }

    /// Wait until a job can be claimed; `None` once the queue is closed
    pub async fn next_job(&self) -> Option<ClaimedJob> {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.claim() {
                return Some(job);
            }
            if self.state.lock().closed {
                return None;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    fn with_lease<T>(
        &self,
        job_id: &str,
        lease_id: Uuid,
        f: impl FnOnce(&mut QueueState, Instant) -> T,
    ) -> Result<T> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get(job_id)
            .ok_or_else(|| AppError::JobNotFound(job_id.to_string()))?;
        let held = job.status == JobStatus::Active
            && job.lease.as_ref().is_some_and(|lease| lease.id == lease_id);
        if !held {
            return Err(AppError::LeaseLost(job_id.to_string()));
        }
        Ok(f(&mut state, Instant::now()))
    }

    /// Whether the lease is still the current delivery of an active job
    pub fn holds_lease(&self, job_id: &str, lease_id: Uuid) -> bool {
        self.with_lease(job_id, lease_id, |_, _| ()).is_ok()
    }

    /// Record progress and renew the lease; returns `true` when progress advanced
    pub fn update_progress(&self, job_id: &str, lease_id: Uuid, progress: u8) -> Result<bool> {
        let lease_duration = Duration::from_secs(self.config.lease_secs);
        self.with_lease(job_id, lease_id, |state, now| {
            let Some(job) = state.jobs.get_mut(job_id) else {
                return false;
            };
            if let Some(lease) = job.lease.as_mut() {
                lease.expires_at = now + lease_duration;
            }
            let progress = progress.min(100);
            if progress <= job.progress {
                return false;
            }
            job.progress = progress;
            true
        })
    }

    /// Mark a delivered job as completed
    pub fn complete(&self, job_id: &str, lease_id: Uuid, result: RenderJobResult) -> Result<()> {
        let retention_completed = self.config.completed_retention;
        let retention_failed = self.config.failed_retention;
        self.with_lease(job_id, lease_id, |state, now| {
            if let Some(job) = state.jobs.get_mut(job_id) {
                job.status = JobStatus::Completed;
                job.progress = 100;
                job.lease = None;
                job.error = None;
                job.result = Some(result);
                job.finished = Some(now);
                job.finished_at = Some(Utc::now());
            }
            state.completed.push_back(job_id.to_string());
            state.prune(&retention_completed, &retention_failed, now);
        })
    }

    /// Mark a delivered job as failed, scheduling a retry when allowed
    pub fn fail(&self, job_id: &str, lease_id: Uuid, error: &PipelineError) -> Result<FailureDisposition> {
        let backoff_base = Duration::from_millis(self.config.backoff_base_ms);
        let max_attempts = self.config.max_attempts;
        let disposition = self.with_lease(job_id, lease_id, |state, now| {
            state.settle_failure(job_id, error, now, backoff_base, max_attempts)
        })?;

        match disposition {
            FailureDisposition::Retrying { attempt, delay } => {
                info!(job_id = %job_id, attempt, delay_ms = delay.as_millis() as u64, "Job scheduled for retry");
            }
            FailureDisposition::Failed | FailureDisposition::Cancelled => {
                info!(job_id = %job_id, disposition = ?disposition, "Job finished unsuccessfully");
            }
        }
        Ok(disposition)
    }

    /// Cancel a job; running jobs stop cooperatively at their next checkpoint
    pub fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| AppError::JobNotFound(job_id.to_string()))?;

        match job.status {
            JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                job.cancel_requested = true;
                job.delayed_until = None;
                job.error = Some(PipelineError::Cancelled.to_string());
                job.finished = Some(Instant::now());
                job.finished_at = Some(Utc::now());
                let snapshot = job.snapshot(job_id);
                state.failed.push_back(job_id.to_string());
                info!(job_id = %job_id, "Pending job cancelled");
                Ok(CancelOutcome::Cancelled(snapshot))
            }
            JobStatus::Active => {
                job.cancel_requested = true;
                info!(job_id = %job_id, "Cancellation requested for active job");
                Ok(CancelOutcome::Requested)
            }
            status => Ok(CancelOutcome::AlreadyFinished(status)),
        }
    }

    pub fn is_cancel_requested(&self, job_id: &str) -> bool {
        self.state
            .lock()
            .jobs
            .get(job_id)
            .is_some_and(|job| job.cancel_requested)
    }

    pub fn get(&self, job_id: &str) -> Option<JobSnapshot> {
        self.state
            .lock()
            .jobs
            .get(job_id)
            .map(|job| job.snapshot(job_id))
    }

    /// Submission times of the user's waiting, delayed and active jobs
    pub fn live_submissions(&self, user_id: &str) -> Vec<DateTime<Utc>> {
        self.state
            .lock()
            .jobs
            .values()
            .filter(|job| job.is_live() && job.data.user_id == user_id)
            .map(|job| job.created_at)
            .collect()
    }

    pub fn pause(&self) {
        self.state.lock().paused = true;
        info!("Queue paused");
    }

    pub fn resume(&self) {
        self.state.lock().paused = false;
        self.notify.notify_waiters();
        info!("Queue resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Stop handing out jobs and wake idle workers
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
        info!("Queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Apply retention to finished jobs and redeliver expired leases
    pub fn clean(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.reap_expired_leases(
            now,
            Duration::from_millis(self.config.backoff_base_ms),
            self.config.max_attempts,
        );
        let removed = state.prune(
            &self.config.completed_retention,
            &self.config.failed_retention,
            now,
        );
        if removed > 0 {
            debug!(removed, "Pruned finished jobs");
        }
        removed
    }

    /// Jobs failed by lease expiry since the last call
    pub fn take_abandoned(&self) -> Vec<AbandonedJob> {
        std::mem::take(&mut self.state.lock().abandoned)
    }

    pub fn metrics(&self) -> QueueMetricsSnapshot {
        let state = self.state.lock();
        let mut snapshot = QueueMetricsSnapshot::default();

        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending if job.delayed_until.is_some() => snapshot.delayed += 1,
                JobStatus::Pending if state.paused => snapshot.paused += 1,
                JobStatus::Pending => snapshot.waiting += 1,
                JobStatus::Active => snapshot.active += 1,
                JobStatus::Completed => snapshot.completed += 1,
                JobStatus::Failed | JobStatus::Cancelled => snapshot.failed += 1,
            }
        }

        snapshot.total = snapshot.waiting
            + snapshot.active
            + snapshot.completed
            + snapshot.failed
            + snapshot.delayed
            + snapshot.paused;
        snapshot
    }
}
