//! Error taxonomy for the ingestion pipeline.
//!
//! Transient embedding and write failures are retried with backoff;
//! exhaustion converts them to a per-document failure and the run continues.
//! Permanent errors are never retried. [`SetupError`] aborts the run before
//! any document is processed.

use thiserror::Error;

/// Per-document pipeline failure, recorded by the orchestrator as a
/// `Failed` outcome rather than propagated up.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("normalization failed for document '{id}': {reason}")]
    Normalization { id: String, reason: String },

    /// Reading the tracked fingerprints out of the document index failed.
    #[error("tracking-state read failed: {0}")]
    Classification(String),

    #[error("chunking failed for document '{id}': {reason}")]
    Chunking { id: String, reason: String },

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Write(#[from] WriteError),
}

/// Failure from the embedding capability or the batcher around it.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// The provider signalled rate limiting (HTTP 429). Retryable.
    #[error("embedding provider rate limited: {0}")]
    RateLimited(String),

    /// Network error, timeout, or server-side failure. Retryable.
    #[error("transient embedding failure: {0}")]
    Transient(String),

    /// Malformed input, auth failure, or an unparseable response. Not
    /// retryable.
    #[error("permanent embedding failure: {0}")]
    Permanent(String),

    /// The provider returned a different number of vectors than texts
    /// submitted. The batch is rejected rather than guessed at.
    #[error("embedding response length {got} does not match request length {want}")]
    LengthMismatch { want: usize, got: usize },

    #[error("embedding retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl EmbedError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbedError::RateLimited(_) | EmbedError::Transient(_))
    }
}

/// Failure from a search-index operation, tagged with the index it hit.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Index unreachable, timed out, or returned a server error. Retryable.
    #[error("transient failure on index '{index}': {reason}")]
    Transient { index: String, reason: String },

    /// The index rejected the operation (schema mismatch, bad request).
    #[error("index '{index}' rejected operation: {reason}")]
    Rejected { index: String, reason: String },

    #[error("index '{index}' not found")]
    MissingIndex { index: String },
}

impl WriteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WriteError::Transient { .. })
    }
}

/// Precondition violation detected before any document is processed.
/// Fatal to the run.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("target index '{0}' does not exist; provision it before syncing")]
    MissingIndex(String),

    #[error("search backend preflight failed: {0}")]
    Backend(String),
}
