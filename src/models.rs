//! Core data models used throughout kb-sync.
//!
//! These types represent the documents, chunks, and outcomes that flow
//! through the ingestion pipeline, from raw source rows to indexed
//! embedding records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Document metadata: string scalars keyed by field name (title, url,
/// workflow_state, timestamps). A `BTreeMap` keeps serialization order
/// deterministic.
pub type Metadata = BTreeMap<String, String>;

/// Raw row produced by the source collaborator before normalization.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    /// Unique within the source (e.g. an article sys_id).
    pub id: String,
    /// Semi-structured body, possibly containing markup.
    pub raw_content: String,
    pub metadata: Metadata,
}

/// A source document after markup stripping and whitespace normalization.
///
/// The fingerprint is a hex SHA-256 of `canonical_text` and is the sole
/// input to change classification.
#[derive(Debug, Clone)]
pub struct NormalizedDocument {
    pub id: String,
    pub canonical_text: String,
    pub metadata: Metadata,
    pub fingerprint: String,
}

/// Tracking state persisted on the document-index record: the fingerprint
/// last successfully indexed for a document id. Written only after the
/// document's full pipeline has succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedDocumentRecord {
    pub id: String,
    pub fingerprint: String,
    pub chunk_count: usize,
    pub indexed_at: DateTime<Utc>,
}

/// A bounded slice of a document's canonical text, the unit of embedding.
///
/// Created by the chunker, consumed by the embedding batcher, and discarded
/// after the write step; never persisted without its vector.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub parent_id: String,
    /// 0-based, contiguous within the parent.
    pub chunk_index: usize,
    pub text: String,
    pub metadata: Metadata,
}

/// A chunk paired with its embedding vector, ready for the vector index.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub parent_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
}

impl EmbeddedChunk {
    /// Deterministic vector-index id, so re-ingesting a document upserts
    /// the same records instead of accumulating duplicates.
    pub fn record_id(&self) -> String {
        format!("{}:{}", self.parent_id, self.chunk_index)
    }
}

/// How a document compares against its tracked fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// No tracking record exists for the id.
    New,
    /// Tracking record exists with a different fingerprint.
    Changed,
    /// Fingerprints match; the document is skipped entirely.
    Unchanged,
}

/// Tagged per-document result collected by the orchestrator. One document's
/// failure never aborts the run.
#[derive(Debug, Clone)]
pub enum DocOutcome {
    /// Normalized, chunked, embedded, and written.
    Indexed {
        id: String,
        classification: Classification,
        chunks: usize,
    },
    /// Fingerprint matched the tracking record; nothing was written.
    Unchanged { id: String },
    /// Excluded by the publication filter before classification.
    Filtered { id: String },
    /// A pipeline stage failed; the document stays un-indexed and will be
    /// retried on the next run.
    Failed { id: String, reason: String },
}

/// Aggregated counts for one pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub new: u64,
    pub changed: u64,
    pub unchanged: u64,
    pub filtered: u64,
    pub deleted: u64,
    pub failed: u64,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &DocOutcome) {
        match outcome {
            DocOutcome::Indexed {
                classification: Classification::New,
                ..
            } => self.new += 1,
            DocOutcome::Indexed {
                classification: Classification::Changed,
                ..
            } => self.changed += 1,
            // classify() never produces an Indexed outcome for Unchanged,
            // but count it rather than lose it.
            DocOutcome::Indexed { .. } | DocOutcome::Unchanged { .. } => self.unchanged += 1,
            DocOutcome::Filtered { .. } => self.filtered += 1,
            DocOutcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}
