use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tokio::sync::Semaphore;
use tower_http::timeout::TimeoutLayer;

use crate::handlers;
use crate::process::ProcessRegistry;
use crate::shutdown::ShutdownOrchestrator;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: ProcessRegistry,
    pub shutdown: ShutdownOrchestrator,
    /// One permit per attached output stream; `None` when unlimited.
    pub viewers: Option<Arc<Semaphore>>,
}

impl AppState {
    pub fn new(shutdown: ShutdownOrchestrator) -> Self {
        let registry = shutdown.registry().clone();
        let max_clients = registry.settings().max_clients as usize;
        Self {
            viewers: (max_clients > 0).then(|| Arc::new(Semaphore::new(max_clients))),
            registry,
            shutdown,
        }
    }
}

// ============================================================================
// Server Setup
// ============================================================================

pub fn build_app(state: AppState, request_timeout_seconds: u64) -> Router {
    // Output streams stay open for the life of the process, so no request timeout.
    let streaming_routes = Router::new()
        .route("/processes/{id}/stream", get(handlers::v1::stream_output))
        .with_state(state.clone());

    let api_routes = Router::new()
        .route("/settings", get(handlers::v1::get_settings))
        .route(
            "/processes",
            get(handlers::v1::list_processes).post(handlers::v1::create_process),
        )
        .route(
            "/processes/{id}",
            get(handlers::v1::get_process).delete(handlers::v1::delete_process),
        )
        .route("/processes/{id}/stop", post(handlers::v1::stop_process))
        .route("/processes/{id}/output", get(handlers::v1::read_output))
        .route("/processes/{id}/input", post(handlers::v1::write_input))
        .with_state(state.clone())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(request_timeout_seconds),
        ));

    let api_v1 = Router::new()
        .merge(streaming_routes)
        .merge(api_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024)); // 1 MB

    Router::new()
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .route("/version", get(handlers::version))
        .with_state(state)
        .nest("/api/v1", api_v1)
}
