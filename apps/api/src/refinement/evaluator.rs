//! Evaluator: asks the LLM for a critique of resume-vs-job fit and pulls a
//! 0–100 sub-score off the critique's last line.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::llm_client::{GenerationError, TextGenerator};
use crate::refinement::prompts::{
    render, EVALUATE_HEADER, EVALUATE_PROMPT_TEMPLATE, PRIOR_CANDIDATES_BLOCK,
};

/// Sub-score used when the narrative carries no parseable trailing number.
pub const FALLBACK_SUB_SCORE: u32 = 50;

/// Upper end of the evaluation scale.
pub const MAX_SUB_SCORE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub narrative: String,
    /// `None` when the last line did not end in an integer.
    pub extracted_sub_score: Option<u32>,
}

impl Evaluation {
    pub fn from_narrative(narrative: String) -> Self {
        let extracted_sub_score = extract_trailing_score(&narrative);
        Self {
            narrative,
            extracted_sub_score,
        }
    }

    /// The sub-score the loop acts on: the extracted value, or 50.
    pub fn sub_score(&self) -> u32 {
        self.extracted_sub_score.unwrap_or(FALLBACK_SUB_SCORE)
    }
}

/// Last non-empty line → last whitespace token → integer, clamped to 0–100.
pub fn extract_trailing_score(narrative: &str) -> Option<u32> {
    let last_line = narrative.lines().rev().find(|l| !l.trim().is_empty())?;
    let token = last_line.split_whitespace().last()?;
    let value: i64 = token.parse().ok()?;
    Some(value.clamp(0, MAX_SUB_SCORE as i64) as u32)
}

#[derive(Clone)]
pub struct Evaluator {
    generator: Arc<dyn TextGenerator>,
}

impl Evaluator {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    /// One LLM call. `prior_candidates` are earlier optimized resumes for the same
    /// job, included for comparison when non-empty.
    pub async fn evaluate(
        &self,
        resume: &str,
        job_description: &str,
        prior_candidates: &[String],
    ) -> Result<Evaluation, GenerationError> {
        let prompt = build_evaluate_prompt(resume, job_description, prior_candidates);
        let narrative = self.generator.generate(&prompt).await?;
        let evaluation = Evaluation::from_narrative(narrative);

        if evaluation.extracted_sub_score.is_none() {
            warn!(
                fallback = FALLBACK_SUB_SCORE,
                "Evaluation narrative has no trailing score; using fallback"
            );
        }

        Ok(evaluation)
    }
}

pub(crate) fn build_evaluate_prompt(
    resume: &str,
    job_description: &str,
    prior_candidates: &[String],
) -> String {
    let prior_block = if prior_candidates.is_empty() {
        String::new()
    } else {
        let candidates = prior_candidates
            .iter()
            .enumerate()
            .map(|(i, c)| format!("--- Prior resume {} ---\n{}", i + 1, c.trim()))
            .collect::<Vec<_>>()
            .join("\n\n");
        format!("{PRIOR_CANDIDATES_BLOCK}{candidates}\n")
    };

    render(
        EVALUATE_HEADER,
        EVALUATE_PROMPT_TEMPLATE,
        &[
            ("resume", resume),
            ("job_description", job_description),
            ("prior_candidates", &prior_block),
        ],
    )
}
