//! Logging setup, metric descriptions and the queue gauge flusher

use metrics::{describe_counter, describe_gauge, describe_histogram, gauge, Unit};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{AppError, Result};
use crate::queue::{PriorityScheduler, QueueMetricsSnapshot};

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install the global tracing subscriber. `RUST_LOG` wins over the configured level.
pub fn init(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| AppError::Internal(format!("invalid log filter '{}': {e}", logging.level)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match logging.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
    };

    installed.map_err(|e| AppError::Internal(format!("failed to install tracing subscriber: {e}")))
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "render_jobs_completed_total",
            Unit::Count,
            "Total number of renders that completed."
        );
        describe_counter!(
            "render_jobs_failed_total",
            Unit::Count,
            "Total number of failed render attempts, labelled by error kind."
        );
        describe_counter!(
            "render_credits_consumed_total",
            Unit::Count,
            "Credits charged for renders."
        );
        describe_counter!(
            "render_credits_refunded_total",
            Unit::Count,
            "Credits returned after failed or cancelled renders."
        );
        describe_counter!(
            "render_alerts_total",
            Unit::Count,
            "Alerts raised by the failure monitor, labelled by severity."
        );
        describe_histogram!(
            "render_processing_ms",
            Unit::Milliseconds,
            "Wall-clock time from claim to completion of a render."
        );
        describe_gauge!("render_queue_waiting", Unit::Count, "Jobs waiting to be claimed.");
        describe_gauge!("render_queue_active", Unit::Count, "Jobs currently leased by a worker.");
        describe_gauge!("render_queue_delayed", Unit::Count, "Jobs waiting out a retry backoff.");
        describe_gauge!("render_queue_completed", Unit::Count, "Completed jobs still retained.");
        describe_gauge!("render_queue_failed", Unit::Count, "Failed or cancelled jobs still retained.");
        describe_gauge!("render_queue_paused", Unit::Count, "Jobs held while the queue is paused.");
    });
}

/// Export one queue snapshot as gauges
pub fn publish_queue_metrics(snapshot: &QueueMetricsSnapshot) {
    gauge!("render_queue_waiting").set(snapshot.waiting as f64);
    gauge!("render_queue_active").set(snapshot.active as f64);
    gauge!("render_queue_delayed").set(snapshot.delayed as f64);
    gauge!("render_queue_completed").set(snapshot.completed as f64);
    gauge!("render_queue_failed").set(snapshot.failed as f64);
    gauge!("render_queue_paused").set(snapshot.paused as f64);
}

/// Periodically copies queue counts into gauges
pub struct MetricsFlusher {
    scheduler: Arc<PriorityScheduler>,
    interval: Duration,
    task: RwLock<Option<JoinHandle<()>>>,
}

impl MetricsFlusher {
    pub fn new(scheduler: Arc<PriorityScheduler>, interval: Duration) -> Self {
        Self {
            scheduler,
            interval: interval.max(Duration::from_millis(10)),
            task: RwLock::new(None),
        }
    }

    /// Flush once now
    pub fn flush(&self) -> QueueMetricsSnapshot {
        let snapshot = self.scheduler.metrics();
        publish_queue_metrics(&snapshot);
        snapshot
    }

    pub async fn start(&self) {
        let scheduler = self.scheduler.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let snapshot = scheduler.metrics();
                publish_queue_metrics(&snapshot);
                debug!(
                    waiting = snapshot.waiting,
                    active = snapshot.active,
                    delayed = snapshot.delayed,
                    "Flushed queue metrics"
                );
            }
        });

        if let Some(previous) = self.task.write().await.replace(handle) {
            previous.abort();
        }
        info!(interval_ms = interval.as_millis() as u64, "Started queue metrics flusher");
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.task.write().await.take() {
            handle.abort();
            info!("Stopped queue metrics flusher");
        }
    }
}
