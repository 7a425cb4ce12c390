use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
/// Returns service status plus the model and scoring mode this instance runs with.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "resume-refiner",
        "model": state.config.llm_model,
        "scoring_mode": state.config.refinement.scoring_mode,
    }))
}
