//! Embedding capability and the batcher around it.
//!
//! [`Embedder`] is the trait seam for the embedding model: one call turns a
//! batch of texts into a batch of vectors, positionally aligned. The HTTP
//! implementation targets an OpenAI-compatible `/embeddings` endpoint and
//! classifies failures as transient (429, 5xx, network, timeout) or
//! permanent (other 4xx, unparseable response).
//!
//! [`embed_all`] drives the per-document batching: fixed-size request
//! batches, a shared rate limiter consulted before every call, exponential
//! backoff on transient failures, and strict response-length validation.
//! A document's chunks are embedded all-or-nothing — if any batch exhausts
//! its retries the whole document fails and nothing is written, so a
//! partially embedded chunk set can never reach the vector index.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::config::{EmbeddingConfig, RetryPolicy};
use crate::error::EmbedError;
use crate::limiter::RateLimiter;
use crate::models::{Chunk, EmbeddedChunk};

/// The embedding capability: `embed(texts) -> vectors`, one vector per
/// input text, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    /// Model identifier, for logging and the vector-index records.
    fn model_name(&self) -> &str;
}

/// Embed every chunk of one document, in fixed-size batches.
///
/// Every submitted chunk ends in exactly one of two states: embedded (in
/// the returned vector) or failed (the returned error covers the whole
/// document). Chunks are never silently dropped.
pub async fn embed_all(
    embedder: &dyn Embedder,
    limiter: &RateLimiter,
    chunks: Vec<Chunk>,
    batch_size: usize,
    retry: RetryPolicy,
) -> Result<Vec<EmbeddedChunk>, EmbedError> {
    let mut embedded = Vec::with_capacity(chunks.len());

    for batch in chunks.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_batch(embedder, limiter, &texts, retry).await?;

        if vectors.len() != batch.len() {
            return Err(EmbedError::LengthMismatch {
                want: batch.len(),
                got: vectors.len(),
            });
        }

        for (chunk, vector) in batch.iter().zip(vectors) {
            embedded.push(EmbeddedChunk {
                parent_id: chunk.parent_id.clone(),
                chunk_index: chunk.chunk_index,
                text: chunk.text.clone(),
                vector,
                metadata: chunk.metadata.clone(),
            });
        }
    }

    Ok(embedded)
}

/// One batch with retry. Transient failures back off exponentially;
/// permanent failures are returned as-is on the first occurrence.
async fn embed_batch(
    embedder: &dyn Embedder,
    limiter: &RateLimiter,
    texts: &[String],
    retry: RetryPolicy,
) -> Result<Vec<Vec<f32>>, EmbedError> {
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            tokio::time::sleep(retry.delay(attempt)).await;
        }

        limiter.acquire().await;

        match embedder.embed(texts).await {
            Ok(vectors) => return Ok(vectors),
            Err(e) if e.is_transient() && attempt < retry.max_retries => {
                warn!(attempt = attempt + 1, error = %e, "embedding batch failed, retrying");
                attempt += 1;
            }
            Err(e) if e.is_transient() => {
                return Err(EmbedError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
}

/// Client for an OpenAI-compatible embeddings endpoint
/// (`POST {url}/embeddings`).
pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbedder {
    /// Reads the optional API key from `EMBEDDING_API_KEY`.
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: std::env::var("EMBEDDING_API_KEY").ok(),
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut request = self
            .client
            .post(format!("{}/embeddings", self.url))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EmbedError::Transient(format!("request timed out: {e}"))
            } else {
                EmbedError::Transient(format!("network error: {e}"))
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let text = response.text().await.unwrap_or_default();
            return Err(EmbedError::RateLimited(text));
        }
        if status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(EmbedError::Transient(format!("{status}: {text}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EmbedError::Permanent(format!("{status}: {text}")));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbedError::Permanent(format!("unparseable response: {e}")))?;
        parse_embeddings_response(&json)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Extract `data[].embedding` arrays in response order.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbedError::Permanent("response missing data array".to_string()))?;

    let mut vectors = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbedError::Permanent("response item missing embedding".to_string()))?;
        vectors.push(
            embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect(),
        );
    }

    Ok(vectors)
}
