//! Render persistence contract

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::error::PipelineError;
use crate::job::{JobStatus, QualityStatus, RenderJobResult};

/// Fields written to the render row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub quality_status: Option<QualityStatus>,
    pub quality_score: Option<f64>,
    pub error: Option<String>,
    pub result: Option<RenderJobResult>,
}

impl RenderUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn failed(status: JobStatus, error: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Persisted render row
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRecord {
    pub render_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub quality_status: Option<QualityStatus>,
    pub quality_score: Option<f64>,
    pub error: Option<String>,
    pub result: Option<RenderJobResult>,
    pub updated_at: DateTime<Utc>,
}

/// Datastore holding render rows
#[async_trait]
pub trait RenderStore: Send + Sync {
    async fn update_render_status(&self, render_id: &str, update: RenderUpdate) -> Result<(), PipelineError>;

    async fn get_render(&self, render_id: &str) -> Result<Option<RenderRecord>, PipelineError>;
}

/// Render rows kept in memory
#[derive(Default)]
pub struct InMemoryRenderStore {
    renders: DashMap<String, RenderRecord>,
}

impl InMemoryRenderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RenderStore for InMemoryRenderStore {
    async fn update_render_status(&self, render_id: &str, update: RenderUpdate) -> Result<(), PipelineError> {
        let mut record = self
            .renders
            .entry(render_id.to_string())
            .or_insert_with(|| RenderRecord {
                render_id: render_id.to_string(),
                status: JobStatus::Pending,
                progress: 0,
                quality_status: None,
                quality_score: None,
                error: None,
                result: None,
                updated_at: Utc::now(),
            });

        if let Some(status) = update.status {
            record.status = status;
            if status == JobStatus::Completed {
                record.error = None;
            }
        }
        if let Some(progress) = update.progress {
            record.progress = record.progress.max(progress);
        }
        if update.quality_status.is_some() {
            record.quality_status = update.quality_status;
        }
        if update.quality_score.is_some() {
            record.quality_score = update.quality_score;
        }
        if update.error.is_some() {
            record.error = update.error;
        }
        if update.result.is_some() {
            record.result = update.result;
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn get_render(&self, render_id: &str) -> Result<Option<RenderRecord>, PipelineError> {
        Ok(self.renders.get(render_id).map(|r| r.clone()))
    }
}
