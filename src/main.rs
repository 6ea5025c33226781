//! Main entry point for the render queue service

use render_queue::{api, config::Settings, telemetry, AppState};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging and metric descriptions
    telemetry::init(&settings.logging)?;
    telemetry::describe_metrics();

    info!("Starting render queue");
    info!(
        "Loaded configuration: server={}:{} concurrency={}",
        settings.server.host, settings.server.port, settings.queue.concurrency
    );

    let addr = format!("{}:{}", settings.server.host, settings.server.port);

    // Wire the pipeline and start background tasks
    let app_state = Arc::new(AppState::build(settings)?);
    if app_state.components().providers.is_empty() {
        tracing::warn!("No image providers enabled; every render will fail at generation");
    }
    app_state.start_background().await;

    // Build the router
    let app = api::create_router(app_state.clone());

    info!("Server listening on {}", addr);

    // Start the server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, draining workers");
    app_state.shutdown().await;
    info!("Render queue stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
