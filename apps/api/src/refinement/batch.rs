//! Batch processing: one refinement run per uploaded resume, runs in parallel,
//! failures isolated per resume.
//!
//! Flow per batch:
//! 1. snapshot prior candidates for the job description (before any run starts)
//! 2. dedupe uploads by filename (the later upload wins)
//! 3. per upload, on its own task under a concurrency semaphore:
//!    extract text (blocking pool) → controller.run → record in store
//! 4. collect every outcome, success or failure, keyed by filename

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::errors::{FailureKind, PipelineError};
use crate::extraction::DocumentExtractor;
use crate::refinement::controller::{ConvergenceController, RunLimits, RunProgress, RunResult};
use crate::refinement::store::{CandidateRecord, PriorCandidateStore, StoreError};

#[derive(Debug, Clone)]
pub struct ResumeUpload {
    pub filename: String,
    pub content_type: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Present when the run had started before it failed.
    pub progress: Option<RunProgress>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResumeOutcome {
    Completed(RunResult),
    Failed(ResumeFailure),
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry {
    pub run_id: Uuid,
    #[serde(flatten)]
    pub outcome: ResumeOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub completed: usize,
    pub failed: usize,
    /// Completed filenames, best score first; ties keep filename order.
    pub ranking: Vec<String>,
    pub results: BTreeMap<String, BatchEntry>,
}

/// Completed entries by descending `best_score`. Failed entries are not ranked.
fn rank_by_score(results: &BTreeMap<String, BatchEntry>) -> Vec<String> {
    let mut scored: Vec<(&String, f64)> = results
        .iter()
        .filter_map(|(filename, entry)| match &entry.outcome {
            ResumeOutcome::Completed(result) => Some((filename, result.best_score)),
            ResumeOutcome::Failed(_) => None,
        })
        .collect();
    // stable sort over BTreeMap order keeps ties alphabetical
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.into_iter().map(|(filename, _)| filename.clone()).collect()
}

#[derive(Clone)]
pub struct BatchProcessor {
    extractor: Arc<dyn DocumentExtractor>,
    controller: Arc<ConvergenceController>,
    store: Arc<dyn PriorCandidateStore>,
    max_concurrency: usize,
}

impl BatchProcessor {
    pub fn new(
        extractor: Arc<dyn DocumentExtractor>,
        controller: Arc<ConvergenceController>,
        store: Arc<dyn PriorCandidateStore>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            extractor,
            controller,
            store,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// The stored result for `filename` from an earlier run.
    pub async fn optimized(&self, filename: &str) -> Result<Option<CandidateRecord>, StoreError> {
        self.store.get(filename).await
    }

    pub fn default_limits(&self) -> RunLimits {
        self.controller.config().limits()
    }

    /// Prior candidates for `job_description`; a store failure means no context.
    pub async fn prior_candidates(&self, job_description: &str) -> Arc<[String]> {
        match self.store.lookup(job_description).await {
            Ok(priors) => priors.into(),
            Err(e) => {
                warn!("Prior candidate lookup failed, evaluating without history: {e}");
                Arc::from(Vec::new())
            }
        }
    }

    pub async fn process_batch(
        &self,
        uploads: Vec<ResumeUpload>,
        job_description: &str,
        limits: RunLimits,
    ) -> BatchReport {
        let job_description: Arc<str> = Arc::from(job_description);
        let priors = self.prior_candidates(&job_description).await;
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));

        let mut unique: HashMap<String, ResumeUpload> = HashMap::new();
        for upload in uploads {
            if unique.insert(upload.filename.clone(), upload).is_some() {
                info!("Duplicate filename in batch; keeping the later upload");
            }
        }

        info!(
            resumes = unique.len(),
            concurrency = self.max_concurrency,
            "Processing resume batch"
        );

        let mut handles = Vec::with_capacity(unique.len());
        for (filename, upload) in unique {
            let processor = self.clone();
            let job_description = job_description.clone();
            let priors = priors.clone();
            let semaphore = semaphore.clone();
            let run_id = Uuid::new_v4();

            let handle = tokio::spawn(async move {
                // The semaphore is never closed, so acquire cannot fail.
                let _permit = semaphore.acquire_owned().await.ok();
                processor
                    .process_one(run_id, upload, &job_description, &priors, limits)
                    .await
            });
            handles.push((filename, run_id, handle));
        }

        let mut results = BTreeMap::new();
        for (filename, run_id, handle) in handles {
            let outcome = handle.await.unwrap_or_else(|e| {
                error!(%run_id, "Resume task panicked or was cancelled: {e}");
                ResumeOutcome::Failed(ResumeFailure {
                    kind: FailureKind::Internal,
                    message: format!("task failed: {e}"),
                    progress: None,
                })
            });
            results.insert(filename, BatchEntry { run_id, outcome });
        }

        let ranking = rank_by_score(&results);
        let completed = ranking.len();
        let failed = results.len() - completed;
        info!(completed, failed, top = ?ranking.first(), "Resume batch finished");

        BatchReport {
            completed,
            failed,
            ranking,
            results,
        }
    }

    /// Extract → run → record for a single upload. Never panics on bad input;
    /// every failure becomes `ResumeOutcome::Failed`.
    pub async fn process_one(
        &self,
        run_id: Uuid,
        upload: ResumeUpload,
        job_description: &str,
        prior_candidates: &[String],
        limits: RunLimits,
    ) -> ResumeOutcome {
        let filename = upload.filename.clone();

        let resume_text = match self.extract(upload).await {
            Ok(text) => text,
            Err(e) => {
                warn!(%run_id, filename = %filename, "Skipping resume: {e}");
                return ResumeOutcome::Failed(ResumeFailure {
                    kind: e.kind(),
                    message: e.to_string(),
                    progress: None,
                });
            }
        };

        info!(%run_id, filename = %filename, chars = resume_text.len(), "Resume text extracted");

        match self
            .controller
            .run(&resume_text, job_description, prior_candidates, limits)
            .instrument(info_span!("refinement_run", %run_id, filename = %filename))
            .await
        {
            Ok(result) => {
                self.remember(&filename, job_description, &result).await;
                ResumeOutcome::Completed(result)
            }
            Err(failure) => {
                warn!(%run_id, filename = %filename, "Refinement run failed: {}", failure.error);
                ResumeOutcome::Failed(ResumeFailure {
                    kind: failure.error.kind(),
                    message: failure.error.to_string(),
                    progress: Some(failure.progress),
                })
            }
        }
    }

    async fn extract(&self, upload: ResumeUpload) -> Result<String, PipelineError> {
        let extractor = self.extractor.clone();
        tokio::task::spawn_blocking(move || {
            extractor.extract(&upload.bytes, &upload.content_type, &upload.filename)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("spawn_blocking failed in extraction: {e}")))?
        .map_err(PipelineError::from)
    }

    async fn remember(&self, filename: &str, job_description: &str, result: &RunResult) {
        let record = CandidateRecord {
            filename: filename.to_string(),
            job_description: job_description.to_string(),
            optimized_text: result.best_candidate.text.clone(),
            evaluation: result.evaluation_narrative.clone(),
            score: result.best_score,
            iterations: result.iterations_used,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.store.record(&record).await {
            warn!(filename = %filename, "Failed to record optimized resume: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::FileExtractor;
    use crate::llm_client::stub::{PromptKind, StubGenerator};
    use crate::llm_client::GenerationError;
    use crate::refinement::controller::LoopConfig;
    use crate::refinement::gate::GateMatch;
    use crate::refinement::store::InMemoryCandidateStore;

    const JOB: &str = "Senior Python Engineer, 5+ years";

    fn processor(stub: Arc<StubGenerator>, store: Arc<InMemoryCandidateStore>) -> BatchProcessor {
        let controller = ConvergenceController::new(
            stub,
            None,
            GateMatch::Substring,
            LoopConfig::default(),
        );
        BatchProcessor::new(Arc::new(FileExtractor), Arc::new(controller), store, 4)
    }

    fn text_upload(filename: &str, content_type: &str, body: &str) -> ResumeUpload {
        ResumeUpload {
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            bytes: Bytes::from(body.to_string()),
        }
    }

    #[tokio::test]
    async fn test_unsupported_file_does_not_abort_batch() {
        let store = Arc::new(InMemoryCandidateStore::new());
        let processor = processor(Arc::new(StubGenerator::echoing("Score: 40")), store);
        let uploads = vec![
            text_upload("alice.txt", "text/plain", "Engineer with 2 years Python"),
            text_upload("bob.csv", "text/csv", "name,years\nbob,3"),
        ];

        let report = processor
            .process_batch(uploads, JOB, processor.default_limits())
            .await;

        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);
        match &report.results["alice.txt"].outcome {
            ResumeOutcome::Completed(result) => {
                assert_eq!(result.best_score, 40.0);
                assert_eq!(result.iterations_used, 1);
            }
            other => panic!("expected completed run, got {other:?}"),
        }
        match &report.results["bob.csv"].outcome {
            ResumeOutcome::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::UnsupportedFormat);
                assert!(failure.progress.is_none());
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_filenames_keep_later_upload() {
        let stub = Arc::new(StubGenerator::echoing("Score: 90"));
        let store = Arc::new(InMemoryCandidateStore::new());
        let processor = processor(stub.clone(), store.clone());
        let uploads = vec![
            text_upload("cv.txt", "text/plain", "First version"),
            text_upload("cv.txt", "text/plain", "Second version"),
        ];

        let report = processor
            .process_batch(uploads, JOB, processor.default_limits())
            .await;

        assert_eq!(report.results.len(), 1);
        assert_eq!(stub.calls_of(PromptKind::Evaluate), 1);
        match &report.results["cv.txt"].outcome {
            ResumeOutcome::Completed(result) => {
                assert_eq!(result.best_candidate.text, "Second version")
            }
            other => panic!("expected completed run, got {other:?}"),
        }
        assert_eq!(store.lookup(JOB).await.unwrap(), vec!["Second version"]);
    }

    #[tokio::test]
    async fn test_generation_failure_is_recorded_per_resume() {
        let stub = Arc::new(StubGenerator::new(|prompt| {
            if prompt.contains("broken resume") {
                Err(GenerationError::EmptyContent)
            } else {
                Ok("Score: 95".to_string())
            }
        }));
        let store = Arc::new(InMemoryCandidateStore::new());
        let processor = processor(stub, store.clone());
        let uploads = vec![
            text_upload("good.txt", "text/plain", "solid resume"),
            text_upload("bad.txt", "text/plain", "broken resume"),
        ];

        let report = processor
            .process_batch(uploads, JOB, processor.default_limits())
            .await;

        assert_eq!(report.completed, 1);
        match &report.results["bad.txt"].outcome {
            ResumeOutcome::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::Generation);
                let progress = failure.progress.as_ref().unwrap();
                assert_eq!(progress.iterations_used, 0);
                assert_eq!(progress.candidate.text, "broken resume");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        // only the successful run is remembered
        assert_eq!(store.lookup(JOB).await.unwrap(), vec!["solid resume"]);
    }

    #[tokio::test]
    async fn test_priors_are_snapshotted_before_the_batch() {
        let stub = Arc::new(StubGenerator::echoing("Score: 90"));
        let store = Arc::new(InMemoryCandidateStore::new());
        store
            .record(&CandidateRecord {
                filename: "earlier.txt".to_string(),
                job_description: JOB.to_string(),
                optimized_text: "Earlier optimized resume".to_string(),
                evaluation: "Score: 88".to_string(),
                score: 88.0,
                iterations: 1,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        let processor = processor(stub.clone(), store);
        let uploads = vec![
            text_upload("a.txt", "text/plain", "Resume A"),
            text_upload("b.txt", "text/plain", "Resume B"),
        ];

        processor
            .process_batch(uploads, JOB, processor.default_limits())
            .await;

        let evaluations: Vec<String> = stub
            .prompts()
            .into_iter()
            .filter(|p| PromptKind::of(p) == PromptKind::Evaluate)
            .collect();
        assert_eq!(evaluations.len(), 2);
        for prompt in &evaluations {
            assert!(prompt.contains("Earlier optimized resume"));
            // runs in the same batch never see each other's output
            assert!(!prompt.contains("--- Prior resume 2 ---"));
        }
    }

    #[tokio::test]
    async fn test_ranking_orders_by_score_descending() {
        let stub = Arc::new(StubGenerator::new(|prompt| {
            Ok(if prompt.contains("Resume Z") {
                "Score: 95".to_string()
            } else if prompt.contains("Resume M") {
                "Score: 88".to_string()
            } else {
                "Score: 90".to_string()
            })
        }));
        let processor = processor(stub, Arc::new(InMemoryCandidateStore::new()));
        let uploads = vec![
            text_upload("a.txt", "text/plain", "Resume A"),
            text_upload("m.txt", "text/plain", "Resume M"),
            text_upload("z.txt", "text/plain", "Resume Z"),
            text_upload("x.csv", "text/csv", "not,a,resume"),
        ];

        let report = processor
            .process_batch(uploads, JOB, processor.default_limits())
            .await;

        assert_eq!(report.ranking, vec!["z.txt", "a.txt", "m.txt"]);
        assert_eq!(report.completed, 3);
        assert_eq!(report.failed, 1);
        match &report.results["z.txt"].outcome {
            ResumeOutcome::Completed(result) => assert_eq!(result.original_resume, "Resume Z"),
            other => panic!("expected completed run, got {other:?}"),
        }
    }

    #[test]
    fn test_batch_entry_serializes_with_status_tag() {
        let entry = BatchEntry {
            run_id: Uuid::nil(),
            outcome: ResumeOutcome::Failed(ResumeFailure {
                kind: FailureKind::UnsupportedFormat,
                message: "Unsupported document format: text/csv".to_string(),
                progress: None,
            }),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "unsupported_format");
        assert_eq!(json["run_id"], Uuid::nil().to_string());
    }
}
