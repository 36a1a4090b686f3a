//! HTTP server wiring for the control plane, built on Axum.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::{auth, routes};
use crate::engine::Engine;
use crate::types::SchedulerError;

/// Assemble the control-plane router.
pub fn router(engine: Arc<Engine>) -> Router {
    let mut app = Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/tasks", get(routes::list_tasks))
        .route("/api/tasks/:name", get(routes::get_task))
        .route("/api/tasks/:name/run", post(routes::run_task))
        .route(
            "/api/jobs",
            get(routes::list_jobs).post(routes::create_job),
        )
        .route(
            "/api/jobs/:id",
            get(routes::get_job)
                .put(routes::update_job)
                .delete(routes::delete_job),
        )
        .route("/api/logs", get(routes::list_logs))
        .route(
            "/api/analytics/recent-activity",
            get(routes::recent_activity),
        )
        .route(
            "/api/analytics/upcoming-executions",
            get(routes::upcoming_executions),
        )
        .route(
            "/api/analytics/execution-history",
            get(routes::execution_history),
        )
        .route(
            "/api/analytics/task-distribution",
            get(routes::task_distribution),
        )
        .route("/api/analytics/error-rate", get(routes::error_rate));

    if engine.settings().api_auth {
        app = app.layer(axum::middleware::from_fn(auth::basic_auth));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

/// Bind and serve the API. The returned task runs until the engine's stop
/// signal flips, then drains gracefully.
pub async fn serve(engine: Arc<Engine>) -> Result<JoinHandle<()>, SchedulerError> {
    let addr = format!(
        "{}:{}",
        engine.settings().api_host,
        engine.settings().api_port
    );
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| SchedulerError::Internal(format!("failed to bind API server on {addr}: {e}")))?;
    tracing::info!("API server listening on http://{addr}");

    let mut stop = engine.stop_subscribe();
    let app = router(engine);
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = stop.wait_for(|stopped| *stopped).await;
    });
    Ok(tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!("API server error: {e}");
        }
    }))
}
