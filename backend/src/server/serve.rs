//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::BackendError;
use crate::server::handlers::{
    build_logs_handler, cleanup_handler, delete_deployment_handler, execute_handler,
    get_deployment_handler, health_handler, invoke_handler, list_deployments_handler,
    start_deployment_handler, tooling_handler, version_handler,
};
use crate::server::state::ServerState;

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/tooling", get(tooling_handler))
        // Deployments
        .route(
            "/deployments",
            get(list_deployments_handler).post(start_deployment_handler),
        )
        .route("/deployments/cleanup", post(cleanup_handler))
        .route(
            "/deployments/{id}",
            get(get_deployment_handler).delete(delete_deployment_handler),
        )
        .route("/builds/{id}/logs", get(build_logs_handler))
        // Invocation and local execution
        .route("/invoke/{target}", post(invoke_handler))
        .route("/execute", post(execute_handler))
        // State and middleware
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), BackendError>>, BackendError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| BackendError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| BackendError::ServerError(e.to_string()))
    });

    Ok(handle)
}
