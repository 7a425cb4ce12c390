//! Embedding similarity: text → vector via an `EmbeddingProvider`, and cosine
//! similarity between two texts.
//!
//! `HttpEmbeddingClient` speaks the OpenAI-compatible `/embeddings` shape, which
//! sentence-transformers servers (all-MiniLM-L6-v2, 384 dims) also expose.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Embedding API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Malformed embedding response: {0}")]
    Malformed(String),

    #[error("Embedding dimensions differ: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// Text in, fixed-length vector out.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Clone)]
pub struct HttpEmbeddingClient {
    client: Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpEmbeddingClient {
    pub fn new(url: String, api_key: Option<String>, model: String) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            url,
            api_key,
            model,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut request = self.client.post(&self.url).json(&EmbeddingRequest {
            model: &self.model,
            input: [text],
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EmbeddingError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let body: EmbeddingResponse = response.json().await?;
        let vector = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::Malformed("response has no data entries".to_string()))?;

        if vector.is_empty() {
            return Err(EmbeddingError::Malformed("empty embedding vector".to_string()));
        }

        debug!(dimensions = vector.len(), "Embedding computed");
        Ok(vector)
    }
}

/// Cosine similarity in [-1, 1]. A zero-norm vector has similarity 0 with anything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64, EmbeddingError> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0_f64, 0.0_f64, 0.0_f64);
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    Ok((dot / (norm_a * norm_b).sqrt()).clamp(-1.0, 1.0))
}

/// Embeds two texts and compares them.
#[derive(Clone)]
pub struct SimilarityScorer {
    provider: Arc<dyn EmbeddingProvider>,
}

impl SimilarityScorer {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }

    pub async fn similarity(&self, text_a: &str, text_b: &str) -> Result<f64, EmbeddingError> {
        let a = self.provider.embed(text_a).await?;
        let b = self.provider.embed(text_b).await?;
        cosine_similarity(&a, &b)
    }
}
