//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::EngineError;
use crate::server::handlers::{
    cancel_deployment_handler, create_deployment_handler, delete_deployment_handler,
    get_deployment_handler, get_status_handler, health_handler, list_deployments_handler,
    retry_deployment_handler, stream_logs_handler, transcript_handler, version_handler,
};
use crate::server::state::ServerState;

/// Build the router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Deployments
        .route(
            "/deployments",
            get(list_deployments_handler).post(create_deployment_handler),
        )
        .route(
            "/deployments/{id}",
            get(get_deployment_handler).delete(delete_deployment_handler),
        )
        .route("/deployments/{id}/status", get(get_status_handler))
        .route("/deployments/{id}/logs", get(transcript_handler))
        .route("/deployments/{id}/logs/stream", get(stream_logs_handler))
        .route("/deployments/{id}/cancel", post(cancel_deployment_handler))
        .route("/deployments/{id}/retry", post(retry_deployment_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), EngineError>>, EngineError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| EngineError::ServerError(e.to_string()))
    });

    Ok(handle)
}
