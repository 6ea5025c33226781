//! Functional tests for the HTTP API

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use render_queue::{api::create_router, config::Settings, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

fn create_test_app() -> (Router, Arc<AppState>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.storage.base_path = dir.path().to_string_lossy().into_owned();
    settings.credits.initial_balances.insert("org-1".to_string(), 50);

    let state = Arc::new(AppState::build(settings).unwrap());
    (create_router(state.clone()), state, dir)
}

fn render_body(render_id: &str, tier: &str) -> Value {
    json!({
        "renderId": render_id,
        "projectId": "project-1",
        "sceneId": "scene-1",
        "userId": "user-1",
        "organizationId": "org-1",
        "subscriptionTier": tier,
        "prompt": { "system": "You are a landscape architect.", "user": "A shade garden" },
        "annotations": [{ "type": "textLabel", "data": { "text": "birch grove" } }],
        "settings": {
            "provider": "openai-gpt-image",
            "resolution": "1024x1024",
            "format": "PNG",
            "quality": 80
        }
    })
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

fn json_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

#[tokio::test]
async fn test_submit_render_returns_handle() {
    let (app, _state, _dir) = create_test_app();

    let (status, body) = send(&app, "POST", "/v1/renders", Some(render_body("r-1", "starter"))).await;

    assert_eq!(status, StatusCode::CREATED);
    let body = json_body(&body);
    assert_eq!(body["jobId"], "r-1");
    assert_eq!(body["priority"], 5);
    assert!(body["enqueuedAt"].is_string());
}

#[tokio::test]
async fn test_submit_honours_explicit_priority() {
    let (app, _state, _dir) = create_test_app();

    let mut request = render_body("r-1", "pro");
    request["priority"] = json!(1);
    let (status, body) = send(&app, "POST", "/v1/renders", Some(request)).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json_body(&body)["priority"], 1);
}

#[tokio::test]
async fn test_starter_rate_limit_maps_to_429() {
    let (app, _state, _dir) = create_test_app();

    for id in ["r-1", "r-2"] {
        let (status, _) = send(&app, "POST", "/v1/renders", Some(render_body(id, "starter"))).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = send(&app, "POST", "/v1/renders", Some(render_body("r-3", "starter"))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(&body);
    assert_eq!(body["error"]["code"], "render_quota_exceeded");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("2 renders per minute"));
}

#[tokio::test]
async fn test_duplicate_live_render_is_a_conflict() {
    let (app, _state, _dir) = create_test_app();

    send(&app, "POST", "/v1/renders", Some(render_body("r-1", "growth"))).await;
    let (status, body) = send(&app, "POST", "/v1/renders", Some(render_body("r-1", "growth"))).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json_body(&body)["error"]["code"], "render_already_queued");
}

#[tokio::test]
async fn test_invalid_payload_is_rejected() {
    let (app, _state, _dir) = create_test_app();

    let mut request = render_body("r-1", "pro");
    request["settings"]["quality"] = json!(150);
    let (status, _) = send(&app, "POST", "/v1/renders", Some(request)).await;
    assert!(status.is_client_error());

    let (status, _) = send(&app, "POST", "/v1/renders", Some(json!({ "renderId": "r-2" }))).await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_get_render_status() {
    let (app, _state, _dir) = create_test_app();
    send(&app, "POST", "/v1/renders", Some(render_body("r-1", "pro"))).await;

    let (status, body) = send(&app, "GET", "/v1/renders/r-1", None).await;
    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["jobId"], "r-1");
    assert_eq!(body["status"], "pending");
    assert_eq!(body["progress"], 0);

    let (status, body) = send(&app, "GET", "/v1/renders/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body)["error"]["code"], "render_not_found");
}

#[tokio::test]
async fn test_cancel_render() {
    let (app, state, _dir) = create_test_app();
    send(&app, "POST", "/v1/renders", Some(render_body("r-1", "pro"))).await;

    let (status, body) = send(&app, "DELETE", "/v1/renders/r-1", None).await;
    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["outcome"], "cancelled");
    assert_eq!(body["status"], "cancelled");
    assert_eq!(
        state.components().scheduler.get("r-1").unwrap().status,
        render_queue::job::JobStatus::Cancelled
    );

    let (status, body) = send(&app, "DELETE", "/v1/renders/r-1", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json_body(&body)["outcome"], "already_finished");
}

#[tokio::test]
async fn test_event_stream_of_finished_render() {
    let (app, state, _dir) = create_test_app();
    send(&app, "POST", "/v1/renders", Some(render_body("r-1", "pro"))).await;
    send(&app, "DELETE", "/v1/renders/r-1", None).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/renders/r-1/events")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("event: failed"), "unexpected stream: {text}");
    assert!(text.contains("Render cancelled"));
    assert_eq!(state.components().events.open_channels(), 0);
}

#[tokio::test]
async fn test_queue_metrics_and_pause() {
    let (app, _state, _dir) = create_test_app();
    send(&app, "POST", "/v1/renders", Some(render_body("r-1", "pro"))).await;
    send(&app, "POST", "/v1/renders", Some(render_body("r-2", "growth"))).await;

    let (status, body) = send(&app, "GET", "/v1/queue/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["waiting"], 2);
    assert_eq!(body["active"], 0);

    let (_, body) = send(&app, "POST", "/v1/queue/pause", None).await;
    assert_eq!(json_body(&body)["paused"], true);
    let (_, body) = send(&app, "GET", "/v1/queue/metrics", None).await;
    let body = json_body(&body);
    assert_eq!(body["waiting"], 0);
    assert_eq!(body["paused"], 2);

    let (_, body) = send(&app, "POST", "/v1/queue/resume", None).await;
    assert_eq!(json_body(&body)["paused"], false);
}

#[tokio::test]
async fn test_health_and_reviews() {
    let (app, _state, _dir) = create_test_app();

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["healthy"], true);
    assert_eq!(body["activeAlerts"], 0);

    let (status, body) = send(&app, "GET", "/v1/reviews", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body), json!([]));

    let (status, _) = send(&app, "POST", "/v1/reviews/r-9/approve", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
