use crate::config::Config;
use crate::refinement::BatchProcessor;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// Extraction, refinement loop and prior-candidate store, wired once at startup.
    pub batch: BatchProcessor,
    pub config: Config,
}
