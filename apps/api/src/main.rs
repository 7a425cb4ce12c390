mod config;
mod db;
mod embedding;
mod errors;
mod extraction;
mod llm_client;
mod refinement;
mod routes;
mod state;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::db::create_pool;
use crate::embedding::{HttpEmbeddingClient, SimilarityScorer};
use crate::extraction::FileExtractor;
use crate::llm_client::{BoundedGenerator, LlmClient, TextGenerator};
use crate::refinement::store::{InMemoryCandidateStore, PgCandidateStore, PriorCandidateStore};
use crate::refinement::{BatchProcessor, ConvergenceController};
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Resume Refiner v{}", env!("CARGO_PKG_VERSION"));

    // Initialize LLM client; every call is bounded by the generation timeout
    let llm = LlmClient::new(config.anthropic_api_key.clone(), config.llm_model.clone())?;
    info!(
        "LLM client initialized (model: {}, timeout: {:?})",
        llm.model(),
        config.generation_timeout
    );
    let generator: Arc<dyn TextGenerator> =
        Arc::new(BoundedGenerator::new(Arc::new(llm), config.generation_timeout));

    // Initialize embeddings (optional; hybrid scoring degrades to LLM-only without them)
    let similarity = match &config.embedding_api_url {
        Some(url) => {
            let client = HttpEmbeddingClient::new(
                url.clone(),
                config.embedding_api_key.clone(),
                config.embedding_model.clone(),
            )?;
            info!("Embedding client initialized (model: {})", config.embedding_model);
            Some(SimilarityScorer::new(Arc::new(client)))
        }
        None => {
            info!("EMBEDDING_API_URL not set; hybrid scoring will use the LLM score only");
            None
        }
    };

    // Initialize prior candidate store
    let store: Arc<dyn PriorCandidateStore> = match &config.database_url {
        Some(url) => {
            let pool = create_pool(url, config.batch_concurrency).await?;
            Arc::new(PgCandidateStore::connect(pool).await?)
        }
        None => {
            info!("DATABASE_URL not set; prior candidates are kept in memory");
            Arc::new(InMemoryCandidateStore::new())
        }
    };

    let controller = Arc::new(ConvergenceController::new(
        generator,
        similarity,
        config.gate_match,
        config.refinement.clone(),
    ));
    info!(
        "Refinement loop: max_iterations={}, max_inner_rounds={}, threshold={}, mode={:?}, gate={}",
        config.refinement.max_outer_iterations,
        config.refinement.max_inner_rounds,
        config.refinement.score_threshold,
        config.refinement.scoring_mode,
        config.refinement.decision_gate,
    );

    // Build app state
    let state = AppState {
        batch: BatchProcessor::new(
            Arc::new(FileExtractor),
            controller,
            store,
            config.batch_concurrency,
        ),
        config: config.clone(),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors(&config)?);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Permissive CORS unless a single allowed origin is configured.
fn build_cors(config: &Config) -> Result<CorsLayer> {
    match &config.cors_allowed_origin {
        Some(origin) => {
            let origin = HeaderValue::from_str(origin)
                .with_context(|| format!("CORS_ALLOWED_ORIGIN is not a valid origin: {origin}"))?;
            Ok(CorsLayer::new()
                .allow_origin(origin)
                .allow_methods(Any)
                .allow_headers(Any))
        }
        None => Ok(CorsLayer::permissive()),
    }
}
