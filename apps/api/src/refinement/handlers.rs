//! Axum route handlers for the refinement API.

use std::path::Path as FilePath;

use axum::{
    extract::{Multipart, Path, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::refinement::batch::{BatchReport, ResumeOutcome, ResumeUpload};
use crate::refinement::controller::{RunLimits, StopReason};
use crate::state::AppState;

// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub run_id: Uuid,
    pub original_resume: String,
    pub evaluation: String,
    pub optimized_resume: String,
    pub iterations: u32,
    pub score: f64,
    pub stop_reason: StopReason,
}

/// Fields collected from a multipart form.
#[derive(Debug, Default)]
struct ProcessForm {
    uploads: Vec<ResumeUpload>,
    job_description: Option<String>,
    max_iterations: Option<u32>,
    score_threshold: Option<f64>,
}

impl ProcessForm {
    fn job_description(&self) -> Result<&str, AppError> {
        self.job_description
            .as_deref()
            .map(str::trim)
            .filter(|jd| !jd.is_empty())
            .ok_or_else(|| AppError::Validation("job_description cannot be empty".to_string()))
    }

    /// Request overrides on top of `defaults`; `max_iterations` may not exceed `cap`.
    fn limits(&self, defaults: RunLimits, cap: u32) -> Result<RunLimits, AppError> {
        let max_iterations = self.max_iterations.unwrap_or(defaults.max_iterations);
        if max_iterations > cap {
            return Err(AppError::Validation(format!(
                "max_iterations must be at most {cap}"
            )));
        }
        Ok(RunLimits {
            max_iterations,
            score_threshold: self.score_threshold.unwrap_or(defaults.score_threshold),
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/v1/process
///
/// Multipart: `resume` (file), `job_description`, optional `max_iterations` and
/// `score_threshold`. Runs the refinement loop on one resume.
pub async fn handle_process(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ProcessResponse>, AppError> {
    let mut form = read_form(multipart, "resume").await?;
    let job_description = form.job_description()?.to_string();
    let limits = form.limits(state.batch.default_limits(), state.config.max_iterations_limit)?;

    let upload = form
        .uploads
        .pop()
        .ok_or_else(|| AppError::Validation("resume file is required".to_string()))?;

    let run_id = Uuid::new_v4();
    let priors = state.batch.prior_candidates(&job_description).await;

    match state
        .batch
        .process_one(run_id, upload, &job_description, &priors, limits)
        .await
    {
        ResumeOutcome::Completed(result) => Ok(Json(ProcessResponse {
            run_id,
            original_resume: result.original_resume,
            evaluation: result.evaluation_narrative,
            optimized_resume: result.best_candidate.text,
            iterations: result.iterations_used,
            score: result.best_score,
            stop_reason: result.stop_reason,
        })),
        ResumeOutcome::Failed(failure) => Err(AppError::from_failure(failure.kind, failure.message)),
    }
}

/// POST /api/v1/process/batch
///
/// Multipart: repeated `resumes` files plus `job_description`. Always returns a
/// report; individual failures are listed inside it.
pub async fn handle_process_batch(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<BatchReport>, AppError> {
    let form = read_form(multipart, "resumes").await?;
    let job_description = form.job_description()?.to_string();
    let limits = form.limits(state.batch.default_limits(), state.config.max_iterations_limit)?;

    if form.uploads.is_empty() {
        return Err(AppError::Validation(
            "at least one file in 'resumes' is required".to_string(),
        ));
    }

    let report = state
        .batch
        .process_batch(form.uploads, &job_description, limits)
        .await;

    Ok(Json(report))
}

/// GET /api/v1/optimized/:filename
///
/// The stored optimized resume for an earlier upload, as a plain-text download.
pub async fn handle_download_optimized(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let record = state
        .batch
        .optimized(&filename)
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .ok_or_else(|| AppError::NotFound(format!("no optimized resume for '{filename}'")))?;

    let stem = FilePath::new(&record.filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("resume")
        .replace(['"', '\\'], "_");

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{stem}_optimized.txt\""),
            ),
        ],
        record.optimized_text,
    )
        .into_response())
}

// ────────────────────────────────────────────────────────────────────────────
// Multipart parsing
// ────────────────────────────────────────────────────────────────────────────

async fn read_form(mut multipart: Multipart, file_field: &str) -> Result<ProcessForm, AppError> {
    let mut form = ProcessForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if name == file_field {
            let filename = field
                .file_name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("upload-{}", form.uploads.len() + 1));
            let content_type = field.content_type().unwrap_or_default().to_string();
            let bytes: Bytes = field
                .bytes()
                .await
                .map_err(|e| AppError::Validation(format!("failed to read '{filename}': {e}")))?;
            form.uploads.push(ResumeUpload {
                filename,
                content_type,
                bytes,
            });
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| AppError::Validation(format!("failed to read field '{name}': {e}")))?;

        match name.as_str() {
            "job_description" => form.job_description = Some(value),
            "max_iterations" => {
                form.max_iterations = Some(value.trim().parse().map_err(|_| {
                    AppError::Validation("max_iterations must be a non-negative integer".to_string())
                })?)
            }
            "score_threshold" => {
                let threshold: f64 = value.trim().parse().map_err(|_| {
                    AppError::Validation("score_threshold must be a number".to_string())
                })?;
                if !(0.0..=100.0).contains(&threshold) {
                    return Err(AppError::Validation(
                        "score_threshold must be between 0 and 100".to_string(),
                    ));
                }
                form.score_threshold = Some(threshold);
            }
            _ => {}
        }
    }

    Ok(form)
}
