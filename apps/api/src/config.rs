use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::llm_client::DEFAULT_MODEL;
use crate::refinement::controller::{
    LoopConfig, ScoringMode, DEFAULT_MAX_INNER_ROUNDS, DEFAULT_MAX_ITERATIONS,
    DEFAULT_SCORE_THRESHOLD,
};
use crate::refinement::gate::GateMatch;

const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";
const DEFAULT_MAX_ITERATIONS_LIMIT: u32 = 10;

/// Application configuration loaded from environment variables.
/// Startup fails if a required variable is missing or a value does not parse.
#[derive(Debug, Clone)]
pub struct Config {
    pub anthropic_api_key: String,
    pub llm_model: String,
    /// Unset → hybrid scoring runs LLM-only.
    pub embedding_api_url: Option<String>,
    pub embedding_api_key: Option<String>,
    pub embedding_model: String,
    /// Unset → prior candidates live in memory for the life of the process.
    pub database_url: Option<String>,
    pub port: u16,
    pub rust_log: String,
    pub refinement: LoopConfig,
    /// Largest `max_iterations` a request may ask for.
    pub max_iterations_limit: u32,
    pub gate_match: GateMatch,
    pub generation_timeout: Duration,
    pub batch_concurrency: usize,
    pub cors_allowed_origin: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key → value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let score_threshold: f64 = parse_or(&optional, "SCORE_THRESHOLD", DEFAULT_SCORE_THRESHOLD)?;
        if !(0.0..=100.0).contains(&score_threshold) {
            anyhow::bail!("SCORE_THRESHOLD must be between 0 and 100, got {score_threshold}");
        }

        let max_iterations: u32 = parse_or(&optional, "MAX_ITERATIONS", DEFAULT_MAX_ITERATIONS)?;
        let max_iterations_limit: u32 =
            parse_or(&optional, "MAX_ITERATIONS_LIMIT", DEFAULT_MAX_ITERATIONS_LIMIT)?;
        if max_iterations > max_iterations_limit {
            anyhow::bail!(
                "MAX_ITERATIONS ({max_iterations}) exceeds MAX_ITERATIONS_LIMIT ({max_iterations_limit})"
            );
        }

        let run_timeout = optional("RUN_TIMEOUT_SECS")
            .map(|v| parse_value::<u64>("RUN_TIMEOUT_SECS", &v))
            .transpose()?
            .map(Duration::from_secs);

        let batch_concurrency: usize = parse_or(&optional, "BATCH_CONCURRENCY", 4)?;
        if batch_concurrency == 0 {
            anyhow::bail!("BATCH_CONCURRENCY must be at least 1");
        }

        Ok(Config {
            anthropic_api_key: optional("ANTHROPIC_API_KEY").with_context(|| {
                "Required environment variable 'ANTHROPIC_API_KEY' is not set".to_string()
            })?,
            llm_model: optional("LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            embedding_api_url: optional("EMBEDDING_API_URL"),
            embedding_api_key: optional("EMBEDDING_API_KEY"),
            embedding_model: optional("EMBEDDING_MODEL")
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            database_url: optional("DATABASE_URL"),
            port: parse_or(&optional, "PORT", 8080)?,
            rust_log: optional("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            refinement: LoopConfig {
                max_outer_iterations: max_iterations,
                max_inner_rounds: parse_or(&optional, "MAX_INNER_ROUNDS", DEFAULT_MAX_INNER_ROUNDS)?,
                score_threshold,
                scoring_mode: parse_or(&optional, "SCORING_MODE", ScoringMode::Evaluation)?,
                decision_gate: parse_or(&optional, "ENABLE_DECISION_GATE", true)?,
                run_timeout,
            },
            max_iterations_limit,
            gate_match: parse_or(&optional, "GATE_MATCH", GateMatch::Substring)?,
            generation_timeout: Duration::from_secs(parse_or(
                &optional,
                "GENERATION_TIMEOUT_SECS",
                120,
            )?),
            batch_concurrency,
            cors_allowed_origin: optional("CORS_ALLOWED_ORIGIN"),
        })
    }
}

fn parse_or<T, F>(optional: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match optional(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("{key} has an invalid value '{raw}'"))
}
