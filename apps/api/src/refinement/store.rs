//! Prior candidate store: optimized resumes from earlier runs, looked up by job
//! description and fed to the evaluator as comparative context.
//!
//! Records are upserted by filename: re-uploading a file replaces its entry.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub filename: String,
    pub job_description: String,
    pub optimized_text: String,
    pub evaluation: String,
    pub score: f64,
    pub iterations: u32,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait PriorCandidateStore: Send + Sync {
    /// Optimized texts previously recorded for exactly this job description,
    /// oldest first.
    async fn lookup(&self, job_description: &str) -> Result<Vec<String>, StoreError>;

    /// Inserts or replaces the record for `record.filename`.
    async fn record(&self, record: &CandidateRecord) -> Result<(), StoreError>;

    /// The latest record for `filename`, if one was ever stored.
    async fn get(&self, filename: &str) -> Result<Option<CandidateRecord>, StoreError>;
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryCandidateStore {
    records: RwLock<HashMap<String, CandidateRecord>>,
}

impl InMemoryCandidateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PriorCandidateStore for InMemoryCandidateStore {
    async fn lookup(&self, job_description: &str) -> Result<Vec<String>, StoreError> {
        let records = self.records.read().await;
        let mut matching: Vec<&CandidateRecord> = records
            .values()
            .filter(|r| r.job_description == job_description)
            .collect();
        matching.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.filename.cmp(&b.filename))
        });
        Ok(matching
            .into_iter()
            .map(|r| r.optimized_text.clone())
            .collect())
    }

    async fn record(&self, record: &CandidateRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.filename.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, filename: &str) -> Result<Option<CandidateRecord>, StoreError> {
        Ok(self.records.read().await.get(filename).cloned())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Postgres
// ────────────────────────────────────────────────────────────────────────────

const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS optimized_resumes (
        filename        TEXT PRIMARY KEY,
        job_description TEXT NOT NULL,
        optimized_text  TEXT NOT NULL,
        evaluation      TEXT NOT NULL,
        score           DOUBLE PRECISION NOT NULL,
        iterations      INTEGER NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL
    )
"#;

pub struct PgCandidateStore {
    pool: PgPool,
}

impl PgCandidateStore {
    /// Wraps the pool and makes sure the table exists.
    pub async fn connect(pool: PgPool) -> Result<Self, StoreError> {
        sqlx::query(CREATE_TABLE_SQL).execute(&pool).await?;
        info!("Prior candidate table ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl PriorCandidateStore for PgCandidateStore {
    async fn lookup(&self, job_description: &str) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT optimized_text FROM optimized_resumes \
             WHERE job_description = $1 ORDER BY updated_at, filename",
        )
        .bind(job_description)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(text,)| text).collect())
    }

    async fn record(&self, record: &CandidateRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO optimized_resumes
                (filename, job_description, optimized_text, evaluation, score, iterations, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (filename) DO UPDATE SET
                job_description = EXCLUDED.job_description,
                optimized_text  = EXCLUDED.optimized_text,
                evaluation      = EXCLUDED.evaluation,
                score           = EXCLUDED.score,
                iterations      = EXCLUDED.iterations,
                updated_at      = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.filename)
        .bind(&record.job_description)
        .bind(&record.optimized_text)
        .bind(&record.evaluation)
        .bind(record.score)
        .bind(record.iterations as i32)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, filename: &str) -> Result<Option<CandidateRecord>, StoreError> {
        let row: Option<RecordRow> = sqlx::query_as(
            "SELECT filename, job_description, optimized_text, evaluation, score, iterations, updated_at \
             FROM optimized_resumes WHERE filename = $1",
        )
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(filename, job_description, optimized_text, evaluation, score, iterations, updated_at)| {
                CandidateRecord {
                    filename,
                    job_description,
                    optimized_text,
                    evaluation,
                    score,
                    iterations: iterations.max(0) as u32,
                    updated_at,
                }
            },
        ))
    }
}

type RecordRow = (String, String, String, String, f64, i32, DateTime<Utc>);
