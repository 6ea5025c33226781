//! Per-job progress and terminal event fan-out.
//!
//! Each job gets its own bounded [`broadcast`] channel, created on first
//! subscription and dropped once the job publishes a terminal event. A
//! multiplexed channel carries every event for consumers that want all jobs.
//! Slow receivers observe `RecvError::Lagged` instead of blocking publishers.

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::EventsConfig;
use crate::error::{AppError, Result};
use crate::job::RenderJobResult;

/// Event emitted for a single render job
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    #[serde(rename_all = "camelCase")]
    Progress { job_id: String, progress: u8 },
    #[serde(rename_all = "camelCase")]
    Completed {
        job_id: String,
        result: RenderJobResult,
    },
    #[serde(rename_all = "camelCase")]
    Failed { job_id: String, error: String },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. } => job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Progress { .. })
    }

    /// Event name used on the server-sent event stream
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Progress { .. } => "progress",
            JobEvent::Completed { .. } => "completed",
            JobEvent::Failed { .. } => "failed",
        }
    }
}

/// Publish/subscribe hub for job events
pub struct EventBus {
    channels: DashMap<String, broadcast::Sender<JobEvent>>,
    all: broadcast::Sender<JobEvent>,
    capacity: usize,
    max_subscribers: usize,
}

impl EventBus {
    pub fn new(config: &EventsConfig) -> Self {
        let capacity = config.channel_capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            channels: DashMap::new(),
            all,
            capacity,
            max_subscribers: config.max_subscribers_per_job.max(1),
        }
    }

    /// Publish an event to subscribers of its job and to the multiplexed stream.
    pub fn publish(&self, event: JobEvent) {
        let job_id = event.job_id().to_string();
        let terminal = event.is_terminal();

        if let Some(sender) = self.channels.get(&job_id) {
            // A send error only means there are no receivers left.
            let _ = sender.send(event.clone());
        }

        if terminal {
            // Dropping the sender closes the channel once receivers drain it.
            self.channels.remove(&job_id);
            debug!(job_id = %job_id, "Closed job event channel");
        } else {
            self.channels
                .remove_if(&job_id, |_, sender| sender.receiver_count() == 0);
        }

        let _ = self.all.send(event);
    }

    /// Subscribe to the events of one job
    pub fn subscribe(&self, job_id: &str) -> Result<broadcast::Receiver<JobEvent>> {
        let sender = self
            .channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);

        if sender.receiver_count() >= self.max_subscribers {
            return Err(AppError::SubscriberLimit(job_id.to_string()));
        }

        Ok(sender.subscribe())
    }

    /// Subscribe to events of every job
    pub fn subscribe_all(&self) -> broadcast::Receiver<JobEvent> {
        self.all.subscribe()
    }

    /// Drop the channel of a job nobody is listening to any more
    pub fn release(&self, job_id: &str) {
        if self
            .channels
            .remove_if(job_id, |_, sender| sender.receiver_count() == 0)
            .is_some()
        {
            debug!(job_id = %job_id, "Released idle job event channel");
        }
    }

    /// Number of jobs with an open event channel
    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&EventsConfig::default())
    }
}
