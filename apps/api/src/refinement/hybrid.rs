//! Hybrid Scorer: half embedding similarity, half LLM judgement, on a 0–100 scale.
//!
//! ```text
//! similarity_component = clamp(50 × cosine(resume, jd), 0, 50)
//! llm_component        = clamp(parse(LLM "0–50" answer) or raw cosine, 0, 50)
//! total                = round(similarity_component + llm_component, 2)
//! ```
//!
//! Without embeddings (provider unset or failing) the LLM half is doubled so the
//! total stays on the same scale.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::embedding::SimilarityScorer;
use crate::llm_client::{GenerationError, TextGenerator};
use crate::refinement::prompts::{render, FIT_SCORE_HEADER, FIT_SCORE_PROMPT_TEMPLATE};

/// Each half of the hybrid score is worth this much.
pub const COMPONENT_WEIGHT: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridScore {
    /// `None` when embeddings were unavailable.
    pub similarity_component: Option<f64>,
    pub llm_component: f64,
    pub total: f64,
}

#[derive(Clone)]
pub struct HybridScorer {
    generator: Arc<dyn TextGenerator>,
    similarity: Option<SimilarityScorer>,
}

impl HybridScorer {
    pub fn new(generator: Arc<dyn TextGenerator>, similarity: Option<SimilarityScorer>) -> Self {
        Self {
            generator,
            similarity,
        }
    }

    pub async fn score(
        &self,
        resume: &str,
        job_description: &str,
    ) -> Result<HybridScore, GenerationError> {
        let cosine = match &self.similarity {
            Some(scorer) => match scorer.similarity(resume, job_description).await {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Embedding similarity unavailable, scoring with LLM only: {e}");
                    None
                }
            },
            None => None,
        };

        let prompt = render(
            FIT_SCORE_HEADER,
            FIT_SCORE_PROMPT_TEMPLATE,
            &[("resume", resume), ("job_description", job_description)],
        );
        let response = self.generator.generate(&prompt).await?;

        Ok(combine(cosine, &response))
    }
}

/// Pure combination step, separated so the arithmetic is testable without I/O.
pub(crate) fn combine(cosine: Option<f64>, llm_response: &str) -> HybridScore {
    let parsed = parse_llm_score(llm_response);
    if parsed.is_none() {
        warn!(
            response = %llm_response.chars().take(40).collect::<String>(),
            "LLM fit score unparseable; falling back to raw similarity"
        );
    }

    match cosine {
        Some(cosine) => {
            let similarity_component = clamp_component(COMPONENT_WEIGHT * cosine);
            let llm_component = clamp_component(parsed.unwrap_or(cosine));
            HybridScore {
                similarity_component: Some(similarity_component),
                llm_component,
                total: round2(similarity_component + llm_component),
            }
        }
        None => {
            let llm_component = clamp_component(parsed.unwrap_or(0.0));
            HybridScore {
                similarity_component: None,
                llm_component,
                total: round2(2.0 * llm_component),
            }
        }
    }
}

fn parse_llm_score(response: &str) -> Option<f64> {
    response
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

fn clamp_component(value: f64) -> f64 {
    value.clamp(0.0, COMPONENT_WEIGHT)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
