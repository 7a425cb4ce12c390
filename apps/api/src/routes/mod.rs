pub mod health;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::refinement::handlers;
use crate::state::AppState;

/// Upload cap for a whole request (one resume or a batch).
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/v1/process", post(handlers::handle_process))
        .route("/api/v1/process/batch", post(handlers::handle_process_batch))
        .route(
            "/api/v1/optimized/:filename",
            get(handlers::handle_download_optimized),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}
