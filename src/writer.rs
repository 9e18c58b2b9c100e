//! Dual-index writer.
//!
//! Keeps the document index and the vector index mutually consistent for
//! each source document. For a new or changed document the order is fixed:
//! upsert the document body, clear the old vector entries, bulk-insert the
//! new ones, and only then commit the fingerprint onto the document
//! record. A crash anywhere before the commit leaves the fingerprint
//! unrecorded, so the next run simply reprocesses the document — content
//! is never marked indexed without having been written. Reversing that
//! ordering would silently lose data; do not.
//!
//! Transient index failures are retried with the shared backoff policy;
//! exhaustion or rejection surfaces as a per-document error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{IndexesConfig, RetryPolicy};
use crate::error::{SetupError, WriteError};
use crate::index::SearchBackend;
use crate::models::{EmbeddedChunk, IndexedDocumentRecord, NormalizedDocument};

pub struct IndexWriter {
    backend: Arc<dyn SearchBackend>,
    indexes: IndexesConfig,
    retry: RetryPolicy,
}

impl IndexWriter {
    pub fn new(backend: Arc<dyn SearchBackend>, indexes: IndexesConfig, retry: RetryPolicy) -> Self {
        Self {
            backend,
            indexes,
            retry,
        }
    }

    /// Preflight: both target indices must exist before any document is
    /// processed.
    pub async fn ensure_indices(&self) -> Result<(), SetupError> {
        for index in [&self.indexes.document, &self.indexes.vector] {
            let exists = self
                .backend
                .index_exists(index)
                .await
                .map_err(|e| SetupError::Backend(e.to_string()))?;
            if !exists {
                return Err(SetupError::MissingIndex(index.clone()));
            }
        }
        Ok(())
    }

    /// Load every committed tracking record from the document index.
    /// Records without a fingerprint (interrupted before commit) are
    /// ignored and will be reprocessed as NEW.
    pub async fn tracked(&self) -> Result<HashMap<String, IndexedDocumentRecord>, WriteError> {
        let records = self.backend.scan(&self.indexes.document).await?;

        let mut tracked = HashMap::with_capacity(records.len());
        for (id, value) in records {
            let Some(fingerprint) = value.get("fingerprint").and_then(Value::as_str) else {
                debug!(id, "document record has no committed fingerprint, treating as new");
                continue;
            };
            let chunk_count = value
                .get("chunk_count")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            let indexed_at = value
                .get("indexed_at")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            tracked.insert(
                id.clone(),
                IndexedDocumentRecord {
                    id,
                    fingerprint: fingerprint.to_string(),
                    chunk_count,
                    indexed_at,
                },
            );
        }
        Ok(tracked)
    }

    /// Write one new or changed document to both indices.
    ///
    /// Zero chunks is valid: the document is upserted, stale vectors are
    /// purged, and the fingerprint is committed with `chunk_count` 0.
    pub async fn write_document(
        &self,
        doc: &NormalizedDocument,
        chunks: &[EmbeddedChunk],
    ) -> Result<(), WriteError> {
        let body = document_body(doc);
        self.with_retry("upsert document", || {
            self.backend
                .upsert(&self.indexes.document, &doc.id, body.clone())
        })
        .await?;

        // Clear vectors from the previous version before inserting; this
        // handles shrinking chunk counts, not just replacements.
        self.with_retry("clear stale vectors", || {
            self.backend
                .delete_by_field(&self.indexes.vector, "parent_id", &doc.id)
        })
        .await?;

        if !chunks.is_empty() {
            let items: Vec<(String, Value)> = chunks
                .iter()
                .map(|c| (c.record_id(), vector_body(c, &doc.fingerprint)))
                .collect();
            self.with_retry("insert vectors", || {
                self.backend
                    .bulk_insert(&self.indexes.vector, items.clone())
            })
            .await?;
        }

        // Commit last: the fingerprint must only ever describe content
        // that is already durably in both indices.
        let committed = committed_body(doc, chunks.len());
        self.with_retry("commit fingerprint", || {
            self.backend
                .upsert(&self.indexes.document, &doc.id, committed.clone())
        })
        .await?;

        Ok(())
    }

    /// Purge a source-deleted document from both indices. The tracking
    /// record lives on the document record and disappears with it.
    pub async fn delete_document(&self, id: &str) -> Result<(), WriteError> {
        self.with_retry("delete document", || {
            self.backend.delete(&self.indexes.document, id)
        })
        .await?;
        self.with_retry("delete vectors", || {
            self.backend
                .delete_by_field(&self.indexes.vector, "parent_id", id)
        })
        .await?;
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, WriteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, WriteError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay(attempt)).await;
            }
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    warn!(op = op_name, attempt = attempt + 1, error = %e, "index write failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Document-index record without tracking fields. Upserting this replaces
/// any previously committed fingerprint, so an interrupted rewrite reads
/// as NEW on the next run.
fn document_body(doc: &NormalizedDocument) -> Value {
    json!({
        "id": doc.id,
        "content": doc.canonical_text,
        "metadata": doc.metadata,
    })
}

fn committed_body(doc: &NormalizedDocument, chunk_count: usize) -> Value {
    let mut body = document_body(doc);
    body["fingerprint"] = json!(doc.fingerprint);
    body["chunk_count"] = json!(chunk_count);
    body["indexed_at"] = json!(Utc::now().to_rfc3339());
    body
}

fn vector_body(chunk: &EmbeddedChunk, fingerprint: &str) -> Value {
    json!({
        "parent_id": chunk.parent_id,
        "chunk_index": chunk.chunk_index,
        "text": chunk.text,
        "embedding": chunk.vector,
        "metadata": chunk.metadata,
        "fingerprint": fingerprint,
    })
}
