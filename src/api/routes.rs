//! Route table and handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::job::events::JobEvent;
use crate::job::{JobStatus, RenderJobData};
use crate::queue::{CancelOutcome, JobSnapshot};
use crate::AppState;

/// Build the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let timeout = Duration::from_secs(state.settings.server.request_timeout_secs);

    Router::new()
        .route("/v1/renders", post(submit_render))
        .route("/v1/renders/:id", get(get_render).delete(cancel_render))
        .route("/v1/renders/:id/events", get(render_events))
        .route("/v1/queue/metrics", get(queue_metrics))
        .route("/v1/queue/pause", post(pause_queue))
        .route("/v1/queue/resume", post(resume_queue))
        .route("/v1/reviews", get(list_reviews))
        .route("/v1/reviews/:id/approve", post(approve_review))
        .route("/v1/reviews/:id/reject", post(reject_review))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout))
        .with_state(state)
}

/// Body of `POST /v1/renders`
#[derive(Debug, Deserialize)]
pub struct SubmitRenderRequest {
    #[serde(flatten)]
    pub job: RenderJobData,
    /// Overrides the tier priority; lower runs first
    #[serde(default)]
    pub priority: Option<u8>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub job_id: String,
    pub outcome: &'static str,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStateResponse {
    pub paused: bool,
}

async fn submit_render(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitRenderRequest>,
) -> Result<impl IntoResponse> {
    let handle = state
        .orchestrator
        .submit(request.job, request.priority)
        .await?;
    Ok((StatusCode::CREATED, Json(handle)))
}

async fn get_render(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response> {
    let components = state.components();
    if let Some(snapshot) = components.scheduler.get(&id) {
        return Ok(Json(snapshot).into_response());
    }

    // Pruned from the queue; the render row still knows the outcome.
    let record = components
        .renders
        .get_render(&id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or(AppError::JobNotFound(id))?;
    Ok(Json(record).into_response())
}

async fn cancel_render(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let (code, outcome, status) = match state.orchestrator.cancel(&id).await? {
        CancelOutcome::Cancelled(_) => (StatusCode::OK, "cancelled", JobStatus::Cancelled),
        CancelOutcome::Requested => (StatusCode::ACCEPTED, "cancel_requested", JobStatus::Active),
        CancelOutcome::AlreadyFinished(status) => (StatusCode::CONFLICT, "already_finished", status),
    };

    Ok((
        code,
        Json(CancelResponse {
            job_id: id,
            outcome,
            status,
        }),
    ))
}

async fn render_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response> {
    let components = state.components();
    let snapshot = components
        .scheduler
        .get(&id)
        .ok_or_else(|| AppError::JobNotFound(id.clone()))?;
    if snapshot.status.is_terminal() {
        return Ok(single_event(terminal_event(&snapshot)));
    }

    let receiver = components.events.subscribe(&id)?;

    // The job may have finished between the lookup and the subscription.
    if let Some(snapshot) = components.scheduler.get(&id).filter(|s| s.status.is_terminal()) {
        drop(receiver);
        components.events.release(&id);
        return Ok(single_event(terminal_event(&snapshot)));
    }

    let stream = futures::stream::unfold(Some(receiver), |receiver| async move {
        let mut receiver = receiver?;
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let next = (!event.is_terminal()).then_some(receiver);
                    return Some((Ok::<_, Infallible>(sse_event(&event)), next));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    debug!(job_id = %id, "Opened event stream");
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

async fn queue_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.components().scheduler.metrics())
}

async fn pause_queue(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let scheduler = &state.components().scheduler;
    scheduler.pause();
    Json(QueueStateResponse {
        paused: scheduler.is_paused(),
    })
}

async fn resume_queue(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let scheduler = &state.components().scheduler;
    scheduler.resume();
    Json(QueueStateResponse {
        paused: scheduler.is_paused(),
    })
}

async fn list_reviews(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.components().quality.review_queue().pending())
}

async fn approve_review(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let item = state
        .components()
        .quality
        .approve_review(&id)
        .ok_or(AppError::JobNotFound(id))?;
    Ok(Json(item))
}

async fn reject_review(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let item = state
        .components()
        .quality
        .reject_review(&id)
        .ok_or(AppError::JobNotFound(id))?;
    Ok(Json(item))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.components().monitor.health();
    let code = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

fn sse_event(event: &JobEvent) -> Event {
    Event::default()
        .event(event.name())
        .json_data(event)
        .unwrap_or_else(|_| Event::default().event(event.name()))
}

fn single_event(event: JobEvent) -> Response {
    let stream = futures::stream::iter([Ok::<_, Infallible>(sse_event(&event))]);
    Sse::new(stream).into_response()
}

/// Terminal event reconstructed for a job that already finished
fn terminal_event(snapshot: &JobSnapshot) -> JobEvent {
    match (&snapshot.status, &snapshot.result) {
        (JobStatus::Completed, Some(result)) => JobEvent::Completed {
            job_id: snapshot.job_id.clone(),
            result: result.clone(),
        },
        (status, _) => JobEvent::Failed {
            job_id: snapshot.job_id.clone(),
            error: snapshot
                .error
                .clone()
                .unwrap_or_else(|| status.as_str().to_string()),
        },
    }
}
