//! Convergence Controller: the evaluate → decide → optimize → score loop.
//!
//! # Termination
//! A run stops at the first of:
//! - `Accepted`: the latest score reached the threshold
//! - `BudgetExhausted`: `max_iterations` optimization steps already taken
//! - `GateDeclined`: the decision gate said no further optimization is needed
//! - `Converged`: an optimization step returned the candidate unchanged
//!
//! `max_iterations == 0` is a single-shot evaluation.
//!
//! # No rollback
//! The loop always continues from the most recent candidate, even when it scored
//! below an earlier one. `best_score` reports the maximum seen; `score_history`
//! shows the trajectory.
//!
//! # Cancellation
//! With `run_timeout` set, only the in-flight step is dropped when the deadline
//! passes. The returned `RunFailure` carries the state accumulated so far.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::embedding::SimilarityScorer;
use crate::errors::PipelineError;
use crate::llm_client::TextGenerator;
use crate::refinement::evaluator::Evaluator;
use crate::refinement::gate::{DecisionGate, GateMatch};
use crate::refinement::hybrid::HybridScorer;
use crate::refinement::optimizer::{Optimizer, ResumeCandidate};

pub const DEFAULT_SCORE_THRESHOLD: f64 = 85.0;
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;
pub const DEFAULT_MAX_INNER_ROUNDS: u32 = 3;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Where the loop's per-iteration score comes from. Both are 0–100.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    /// The evaluator's extracted sub-score.
    #[default]
    Evaluation,
    /// `HybridScorer::score(..).total`.
    Hybrid,
}

impl FromStr for ScoringMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evaluation" => Ok(ScoringMode::Evaluation),
            "hybrid" => Ok(ScoringMode::Hybrid),
            other => Err(format!(
                "unknown scoring mode '{other}' (expected evaluation|hybrid)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    pub max_outer_iterations: u32,
    /// 0 means single-shot rewrites from the outer evaluation.
    pub max_inner_rounds: u32,
    pub score_threshold: f64,
    pub scoring_mode: ScoringMode,
    pub decision_gate: bool,
    pub run_timeout: Option<Duration>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_outer_iterations: DEFAULT_MAX_ITERATIONS,
            max_inner_rounds: DEFAULT_MAX_INNER_ROUNDS,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            scoring_mode: ScoringMode::Evaluation,
            decision_gate: true,
            run_timeout: None,
        }
    }
}

impl LoopConfig {
    pub fn limits(&self) -> RunLimits {
        RunLimits {
            max_iterations: self.max_outer_iterations,
            score_threshold: self.score_threshold,
        }
    }
}

/// Per-run bounds; callers may override the configured defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunLimits {
    pub max_iterations: u32,
    pub score_threshold: f64,
}

// ────────────────────────────────────────────────────────────────────────────
// Output types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Accepted,
    BudgetExhausted,
    Converged,
    GateDeclined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// The text the run started from.
    pub original_resume: String,
    pub best_candidate: ResumeCandidate,
    pub best_score: f64,
    pub evaluation_narrative: String,
    pub iterations_used: u32,
    pub stop_reason: StopReason,
    /// One score per evaluation, in order.
    pub score_history: Vec<f64>,
}

/// State of a run at the moment it failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunProgress {
    pub candidate: ResumeCandidate,
    pub best_score: f64,
    pub iterations_used: u32,
}

#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    pub error: PipelineError,
    pub progress: RunProgress,
}

// ────────────────────────────────────────────────────────────────────────────
// Controller
// ────────────────────────────────────────────────────────────────────────────

pub struct ConvergenceController {
    evaluator: Evaluator,
    gate: DecisionGate,
    optimizer: Optimizer,
    hybrid: HybridScorer,
    config: LoopConfig,
}

impl ConvergenceController {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        similarity: Option<SimilarityScorer>,
        gate_match: GateMatch,
        config: LoopConfig,
    ) -> Self {
        let evaluator = Evaluator::new(generator.clone());
        Self {
            gate: DecisionGate::new(generator.clone(), gate_match),
            optimizer: Optimizer::new(generator.clone(), evaluator.clone()),
            hybrid: HybridScorer::new(generator, similarity),
            evaluator,
            config,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Runs the loop on one resume. Collaborator calls are strictly sequential.
    pub async fn run(
        &self,
        resume: &str,
        job_description: &str,
        prior_candidates: &[String],
        limits: RunLimits,
    ) -> Result<RunResult, RunFailure> {
        let deadline = self
            .config
            .run_timeout
            .map(|budget| (Instant::now() + budget, budget));

        let mut current = ResumeCandidate::original(resume);
        let mut best_score = 0.0_f64;
        let mut iteration = 0_u32;
        let mut score_history = Vec::new();

        info!(
            max_iterations = limits.max_iterations,
            threshold = limits.score_threshold,
            mode = ?self.config.scoring_mode,
            "Starting refinement run"
        );

        let fail = |error: PipelineError, current: &ResumeCandidate, best_score: f64, iteration| {
            RunFailure {
                error,
                progress: RunProgress {
                    candidate: current.clone(),
                    best_score,
                    iterations_used: iteration,
                },
            }
        };

        let (evaluation, stop_reason) = loop {
            let evaluation = bounded(
                deadline,
                self.evaluator
                    .evaluate(&current.text, job_description, prior_candidates),
            )
            .await
            .map_err(|e| fail(e, &current, best_score, iteration))?;

            let score = match self.config.scoring_mode {
                ScoringMode::Evaluation => evaluation.sub_score() as f64,
                ScoringMode::Hybrid => {
                    bounded(deadline, self.hybrid.score(&current.text, job_description))
                        .await
                        .map_err(|e| fail(e, &current, best_score, iteration))?
                        .total
                }
            };

            score_history.push(score);
            best_score = best_score.max(score);
            info!(iteration, score, best_score, "Evaluated candidate");

            if score >= limits.score_threshold {
                break (evaluation, StopReason::Accepted);
            }
            if iteration >= limits.max_iterations {
                break (evaluation, StopReason::BudgetExhausted);
            }

            if self.config.decision_gate {
                let needs_work = bounded(
                    deadline,
                    self.gate.needs_optimization(&evaluation.narrative),
                )
                .await
                .map_err(|e| fail(e, &current, best_score, iteration))?;

                if !needs_work {
                    break (evaluation, StopReason::GateDeclined);
                }
            }

            let refined: Result<ResumeCandidate, PipelineError> = if self.config.max_inner_rounds > 0 {
                bounded(
                    deadline,
                    self.optimizer.optimize_with_feedback(
                        &current,
                        job_description,
                        self.config.max_inner_rounds,
                    ),
                )
                .await
                .map(|refinement| {
                    debug!(
                        rounds = refinement.rounds,
                        converged = refinement.converged,
                        "Inner refinement finished"
                    );
                    refinement.candidate
                })
            } else {
                bounded(
                    deadline,
                    self.optimizer
                        .optimize(&current, job_description, &evaluation),
                )
                .await
            };
            let refined = refined.map_err(|e| fail(e, &current, best_score, iteration))?;

            iteration += 1;
            let converged = refined.same_text_as(&current.text);
            current = refined;

            if converged {
                break (evaluation, StopReason::Converged);
            }
        };

        info!(
            stop_reason = ?stop_reason,
            iterations = iteration,
            best_score,
            "Refinement run finished"
        );

        Ok(RunResult {
            original_resume: resume.to_string(),
            best_candidate: current,
            best_score,
            evaluation_narrative: evaluation.narrative,
            iterations_used: iteration,
            stop_reason,
            score_history,
        })
    }
}

/// Awaits one step, dropping it if the run deadline passes first.
async fn bounded<T, E, F>(
    deadline: Option<(Instant, Duration)>,
    step: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<PipelineError>,
{
    match deadline {
        Some((at, budget)) => match tokio::time::timeout_at(at, step).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(PipelineError::DeadlineExceeded(budget)),
        },
        None => step.await.map_err(Into::into),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::llm_client::stub::{resume_in, PromptKind, StubGenerator};
    use crate::llm_client::GenerationError;

    const RESUME: &str = "Engineer with 2 years Python";
    const JOB: &str = "Senior Python Engineer, 5+ years";

    fn controller(stub: Arc<StubGenerator>, config: LoopConfig) -> ConvergenceController {
        ConvergenceController::new(stub, None, GateMatch::Substring, config)
    }

    fn limits(max_iterations: u32, score_threshold: f64) -> RunLimits {
        RunLimits {
            max_iterations,
            score_threshold,
        }
    }

    /// Evaluations always score `score`, gate says YES, every rewrite is new text.
    fn always_changing(score: u32) -> Arc<StubGenerator> {
        let drafts = AtomicUsize::new(0);
        Arc::new(StubGenerator::new(move |prompt| {
            Ok(match PromptKind::of(prompt) {
                PromptKind::Evaluate => format!("Gaps remain.\nScore: {score}"),
                PromptKind::OptimizationCheck => "YES".to_string(),
                PromptKind::Rewrite => {
                    format!("Draft {}", drafts.fetch_add(1, Ordering::SeqCst) + 1)
                }
                _ => String::new(),
            })
        }))
    }

    #[tokio::test]
    async fn test_zero_iterations_is_single_shot_evaluation() {
        let stub = always_changing(40);
        let controller = controller(stub.clone(), LoopConfig::default());

        let result = controller.run(RESUME, JOB, &[], limits(0, 85.0)).await.unwrap();

        assert_eq!(stub.calls_of(PromptKind::Evaluate), 1);
        assert_eq!(stub.calls_of(PromptKind::Rewrite), 0);
        assert_eq!(stub.calls_of(PromptKind::OptimizationCheck), 0);
        assert_eq!(result.iterations_used, 0);
        assert_eq!(result.stop_reason, StopReason::BudgetExhausted);
        assert_eq!(result.best_candidate, ResumeCandidate::original(RESUME));
        assert_eq!(result.best_score, 40.0);
    }

    #[tokio::test]
    async fn test_iterations_never_exceed_budget() {
        for max_iterations in 0..=4 {
            let stub = always_changing(30);
            let controller = controller(stub.clone(), LoopConfig::default());

            let result = controller
                .run(RESUME, JOB, &[], limits(max_iterations, 85.0))
                .await
                .unwrap();

            assert!(result.iterations_used <= max_iterations);
            assert_eq!(result.iterations_used, max_iterations);
            assert_eq!(result.best_candidate.iteration_index, max_iterations);
            assert_eq!(result.score_history.len() as u32, max_iterations + 1);
            // outer evaluations + 3 inner evaluations per optimization step
            assert_eq!(
                stub.calls_of(PromptKind::Evaluate) as u32,
                (max_iterations + 1) + 3 * max_iterations
            );
        }
    }

    #[tokio::test]
    async fn test_zero_threshold_accepts_first_evaluation() {
        let stub = always_changing(10);
        let controller = controller(stub.clone(), LoopConfig::default());

        let result = controller.run(RESUME, JOB, &[], limits(3, 0.0)).await.unwrap();

        assert_eq!(result.stop_reason, StopReason::Accepted);
        assert_eq!(result.iterations_used, 0);
        assert_eq!(result.best_score, 10.0);
        assert_eq!(stub.call_count(), 1);
    }

    #[tokio::test]
    async fn test_noop_rewrite_converges_after_one_iteration() {
        let stub = Arc::new(StubGenerator::echoing("Score: 40"));
        let controller = controller(stub.clone(), LoopConfig::default());

        let result = controller
            .run(RESUME, JOB, &[], LoopConfig::default().limits())
            .await
            .unwrap();

        assert_eq!(result.iterations_used, 1);
        assert_eq!(result.best_score, 40.0);
        assert_eq!(result.stop_reason, StopReason::Converged);
        assert_eq!(result.best_candidate.text, RESUME);
        assert!(result.evaluation_narrative.ends_with("Score: 40"));
        // one inner round only: one rewrite, one inner evaluation
        assert_eq!(stub.calls_of(PromptKind::Rewrite), 1);
        assert_eq!(stub.calls_of(PromptKind::Evaluate), 2);
    }

    #[tokio::test]
    async fn test_best_score_keeps_maximum_without_rollback() {
        let evaluations = AtomicUsize::new(0);
        let stub = Arc::new(StubGenerator::new(move |prompt| {
            Ok(match PromptKind::of(prompt) {
                PromptKind::Evaluate => {
                    let scores = [60, 30, 20];
                    let n = evaluations.fetch_add(1, Ordering::SeqCst);
                    format!("Score: {}", scores[n.min(2)])
                }
                PromptKind::OptimizationCheck => "YES".to_string(),
                PromptKind::Rewrite => format!("{} (rev)", resume_in(prompt)),
                _ => String::new(),
            })
        }));
        let config = LoopConfig {
            max_inner_rounds: 0,
            ..LoopConfig::default()
        };
        let controller = controller(stub, config);

        let result = controller.run("CV", JOB, &[], limits(2, 85.0)).await.unwrap();

        assert_eq!(result.best_score, 60.0);
        assert_eq!(result.score_history, vec![60.0, 30.0, 20.0]);
        // the regressed candidate is returned, not the 60-point original
        assert_eq!(result.best_candidate.text, "CV (rev) (rev)");
        assert_eq!(result.original_resume, "CV");
        assert_eq!(result.best_candidate.iteration_index, 2);
        assert_eq!(result.evaluation_narrative, "Score: 20");
    }

    #[tokio::test]
    async fn test_gate_decline_stops_without_rewriting() {
        let stub = Arc::new(StubGenerator::new(|prompt| {
            Ok(match PromptKind::of(prompt) {
                PromptKind::Evaluate => "Close enough.\nScore: 70".to_string(),
                PromptKind::OptimizationCheck => "NO".to_string(),
                _ => panic!("no other calls expected"),
            })
        }));
        let controller = controller(stub.clone(), LoopConfig::default());

        let result = controller.run(RESUME, JOB, &[], limits(3, 85.0)).await.unwrap();

        assert_eq!(result.stop_reason, StopReason::GateDeclined);
        assert_eq!(result.iterations_used, 0);
        assert_eq!(stub.call_count(), 2);
    }

    #[tokio::test]
    async fn test_disabled_gate_is_never_asked() {
        let stub = always_changing(30);
        let config = LoopConfig {
            decision_gate: false,
            max_inner_rounds: 0,
            ..LoopConfig::default()
        };
        let controller = controller(stub.clone(), config);

        let result = controller.run(RESUME, JOB, &[], limits(2, 85.0)).await.unwrap();

        assert_eq!(stub.calls_of(PromptKind::OptimizationCheck), 0);
        assert_eq!(result.iterations_used, 2);
        assert_eq!(result.best_candidate.text, "Draft 2");
    }

    #[tokio::test]
    async fn test_generation_failure_reports_progress() {
        let evaluations = AtomicUsize::new(0);
        let stub = Arc::new(StubGenerator::new(move |prompt| match PromptKind::of(prompt) {
            PromptKind::Evaluate => {
                if evaluations.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok("Score: 40".to_string())
                } else {
                    Err(GenerationError::Api {
                        status: 529,
                        message: "overloaded".to_string(),
                    })
                }
            }
            PromptKind::OptimizationCheck => Ok("YES".to_string()),
            PromptKind::Rewrite => Ok("Better draft".to_string()),
            _ => Ok(String::new()),
        }));
        let config = LoopConfig {
            max_inner_rounds: 0,
            ..LoopConfig::default()
        };
        let controller = controller(stub, config);

        let failure = controller.run(RESUME, JOB, &[], limits(3, 85.0)).await.unwrap_err();

        assert!(matches!(failure.error, PipelineError::Generation(_)));
        assert_eq!(failure.progress.best_score, 40.0);
        assert_eq!(failure.progress.iterations_used, 1);
        assert_eq!(failure.progress.candidate.text, "Better draft");
    }

    struct SlowRewrites;

    #[async_trait]
    impl TextGenerator for SlowRewrites {
        async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
            match PromptKind::of(prompt) {
                PromptKind::Rewrite => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok("never".to_string())
                }
                PromptKind::OptimizationCheck => Ok("YES".to_string()),
                _ => Ok("Score: 55".to_string()),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_deadline_keeps_accumulated_state() {
        let config = LoopConfig {
            run_timeout: Some(Duration::from_secs(30)),
            max_inner_rounds: 0,
            ..LoopConfig::default()
        };
        let controller =
            ConvergenceController::new(Arc::new(SlowRewrites), None, GateMatch::Substring, config);

        let failure = controller.run(RESUME, JOB, &[], limits(3, 85.0)).await.unwrap_err();

        assert!(matches!(failure.error, PipelineError::DeadlineExceeded(_)));
        assert_eq!(failure.progress.best_score, 55.0);
        assert_eq!(failure.progress.iterations_used, 0);
        assert_eq!(failure.progress.candidate, ResumeCandidate::original(RESUME));
    }

    #[tokio::test]
    async fn test_hybrid_mode_scores_with_hybrid_total() {
        let stub = Arc::new(StubGenerator::new(|prompt| {
            Ok(match PromptKind::of(prompt) {
                PromptKind::Evaluate => "Score: 40".to_string(),
                PromptKind::FitScore => "45".to_string(),
                _ => panic!("accepted before any optimization"),
            })
        }));
        let config = LoopConfig {
            scoring_mode: ScoringMode::Hybrid,
            ..LoopConfig::default()
        };
        let controller = controller(stub, config);

        let result = controller.run(RESUME, JOB, &[], limits(3, 85.0)).await.unwrap();

        // no embeddings → 2 × 45
        assert_eq!(result.best_score, 90.0);
        assert_eq!(result.stop_reason, StopReason::Accepted);
    }

    #[tokio::test]
    async fn test_prior_candidates_reach_outer_evaluation() {
        let stub = always_changing(90);
        let controller = controller(stub.clone(), LoopConfig::default());
        let priors = vec!["Optimized resume from an earlier upload".to_string()];

        controller.run(RESUME, JOB, &priors, limits(3, 85.0)).await.unwrap();

        let prompts = stub.prompts();
        assert!(prompts[0].contains("Optimized resume from an earlier upload"));
    }

    #[test]
    fn test_scoring_mode_from_str() {
        assert_eq!("hybrid".parse::<ScoringMode>().unwrap(), ScoringMode::Hybrid);
        assert_eq!(
            "Evaluation".parse::<ScoringMode>().unwrap(),
            ScoringMode::Evaluation
        );
        assert!("keyword".parse::<ScoringMode>().is_err());
    }

    #[test]
    fn test_stop_reason_serializes_snake_case() {
        let json = serde_json::to_string(&StopReason::BudgetExhausted).unwrap();
        assert_eq!(json, r#""budget_exhausted""#);
    }
}
