//! Optimizer: LLM rewrites of a resume, single-shot or with an inner
//! evaluate-then-rewrite refinement loop that stops once a rewrite is a no-op.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::llm_client::{GenerationError, TextGenerator};
use crate::refinement::evaluator::{Evaluation, Evaluator};
use crate::refinement::prompts::{render, REWRITE_HEADER, REWRITE_PROMPT_TEMPLATE};

/// One version of a resume. Never mutated; each optimization step makes a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCandidate {
    pub text: String,
    /// 0 for the uploaded resume, +1 per outer optimization step.
    pub iteration_index: u32,
}

impl ResumeCandidate {
    pub fn original(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            iteration_index: 0,
        }
    }

    fn successor(&self, text: String) -> Self {
        Self {
            text,
            iteration_index: self.iteration_index + 1,
        }
    }

    /// Whitespace-trimmed textual equality.
    pub fn same_text_as(&self, other: &str) -> bool {
        self.text.trim() == other.trim()
    }
}

/// Output of `optimize_with_feedback`.
#[derive(Debug, Clone)]
pub struct Refinement {
    pub candidate: ResumeCandidate,
    /// Inner rounds actually run (each is one evaluation + one rewrite).
    pub rounds: u32,
    /// True when a round's rewrite came back unchanged.
    pub converged: bool,
}

#[derive(Clone)]
pub struct Optimizer {
    generator: Arc<dyn TextGenerator>,
    evaluator: Evaluator,
}

impl Optimizer {
    pub fn new(generator: Arc<dyn TextGenerator>, evaluator: Evaluator) -> Self {
        Self {
            generator,
            evaluator,
        }
    }

    /// Single rewrite driven by an existing evaluation.
    pub async fn optimize(
        &self,
        resume: &ResumeCandidate,
        job_description: &str,
        evaluation: &Evaluation,
    ) -> Result<ResumeCandidate, GenerationError> {
        let text = self
            .rewrite(&resume.text, job_description, &evaluation.narrative)
            .await?;
        Ok(resume.successor(text))
    }

    /// Up to `max_inner_rounds` of: fresh evaluation → rewrite. Stops early when a
    /// rewrite matches its input after trimming.
    pub async fn optimize_with_feedback(
        &self,
        resume: &ResumeCandidate,
        job_description: &str,
        max_inner_rounds: u32,
    ) -> Result<Refinement, GenerationError> {
        let mut current = resume.text.clone();
        let mut rounds = 0;
        let mut converged = false;

        while rounds < max_inner_rounds {
            rounds += 1;

            let critique = self.evaluator.evaluate(&current, job_description, &[]).await?;
            let candidate = self
                .rewrite(&current, job_description, &critique.narrative)
                .await?;

            if candidate.trim() == current.trim() {
                debug!(round = rounds, "Rewrite unchanged; inner refinement converged");
                converged = true;
                break;
            }

            debug!(
                round = rounds,
                sub_score = critique.sub_score(),
                "Inner refinement round produced a new draft"
            );
            current = candidate;
        }

        Ok(Refinement {
            candidate: resume.successor(current),
            rounds,
            converged,
        })
    }

    async fn rewrite(
        &self,
        resume: &str,
        job_description: &str,
        critique: &str,
    ) -> Result<String, GenerationError> {
        let prompt = render(
            REWRITE_HEADER,
            REWRITE_PROMPT_TEMPLATE,
            &[
                ("resume", resume),
                ("job_description", job_description),
                ("evaluation", critique),
            ],
        );
        self.generator.generate(&prompt).await
    }
}
