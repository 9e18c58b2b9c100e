//! Ingestion pipeline orchestration.
//!
//! Drives the per-document flow — normalize → classify → chunk → embed →
//! write — over a bounded pool of concurrent workers, then reconciles
//! source-side deletions and produces the run summary. Each document's
//! pipeline is a function returning a tagged [`DocOutcome`]; failures are
//! collected, never propagated, so one bad document cannot abort the run.
//! Only a setup precondition violation (missing target index, unreadable
//! tracking state) is fatal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::chunk_document;
use crate::classify::{classify, deleted_ids};
use crate::config::Config;
use crate::embedding::{embed_all, Embedder};
use crate::error::PipelineError;
use crate::index::SearchBackend;
use crate::limiter::RateLimiter;
use crate::models::{
    Classification, DocOutcome, IndexedDocumentRecord, RunSummary, SourceDocument,
};
use crate::normalize::normalize_document;
use crate::source::Source;
use crate::writer::IndexWriter;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Ignore recorded fingerprints and reprocess every document.
    pub full: bool,
    /// Pull, normalize, and classify, but write nothing.
    pub dry_run: bool,
    /// Truncate the source pull.
    pub limit: Option<usize>,
}

pub struct Pipeline {
    config: Arc<Config>,
    source: Arc<dyn Source>,
    embedder: Arc<dyn Embedder>,
    backend: Arc<dyn SearchBackend>,
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        source: Arc<dyn Source>,
        embedder: Arc<dyn Embedder>,
        backend: Arc<dyn SearchBackend>,
    ) -> Self {
        Self {
            config,
            source,
            embedder,
            backend,
        }
    }

    pub async fn run(&self, opts: RunOptions, cancel: CancellationToken) -> Result<RunSummary> {
        let started = Instant::now();

        let writer = Arc::new(IndexWriter::new(
            self.backend.clone(),
            self.config.indexes.clone(),
            self.config.pipeline.retry(),
        ));
        writer.ensure_indices().await?;

        let tracked = writer
            .tracked()
            .await
            .map_err(|e| PipelineError::Classification(e.to_string()))?;

        let mut docs = self.source.fetch().await?;
        if let Some(limit) = opts.limit {
            docs.truncate(limit);
        }
        info!(pulled = docs.len(), tracked = tracked.len(), "source pull complete");

        let mut summary = RunSummary::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut candidates = Vec::with_capacity(docs.len());
        for doc in docs {
            if !is_published(&doc) {
                debug!(id = %doc.id, "not published, filtered out");
                summary.record(&DocOutcome::Filtered { id: doc.id });
                continue;
            }
            seen.insert(doc.id.clone());
            candidates.push(doc);
        }

        if opts.dry_run {
            return self.dry_run(candidates, &tracked, &seen, summary, started, opts.full);
        }

        let limiter = Arc::new(RateLimiter::new(
            self.config.embedding.rate_limit_per_minute,
        ));
        let semaphore = Arc::new(Semaphore::new(self.config.pipeline.concurrency_limit));
        let mut tasks: JoinSet<DocOutcome> = JoinSet::new();

        for doc in candidates {
            // Stop dispatching on cancellation; in-flight documents run to
            // completion so no document is left partially written.
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("cancellation requested, no further documents dispatched");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => permit?,
            };

            let known = if opts.full {
                None
            } else {
                tracked.get(&doc.id).cloned()
            };
            let config = self.config.clone();
            let embedder = self.embedder.clone();
            let writer = writer.clone();
            let limiter = limiter.clone();

            tasks.spawn(async move {
                let _permit = permit;
                process_document(doc, known, config, embedder, writer, limiter).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    warn!(error = %e, "document task aborted");
                    summary.failed += 1;
                }
            }
        }

        // Reconciliation: tracked ids absent from this pull were deleted
        // at the source and must leave both indices.
        for id in deleted_ids(&tracked, &seen) {
            if cancel.is_cancelled() {
                break;
            }
            match writer.delete_document(&id).await {
                Ok(()) => {
                    info!(id, "removed deleted document from both indices");
                    summary.deleted += 1;
                }
                Err(e) => {
                    warn!(id, error = %e, "failed to remove deleted document");
                    summary.failed += 1;
                }
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            new = summary.new,
            changed = summary.changed,
            unchanged = summary.unchanged,
            filtered = summary.filtered,
            deleted = summary.deleted,
            failed = summary.failed,
            duration_ms = summary.duration_ms,
            "run complete"
        );
        Ok(summary)
    }

    /// Classify and estimate without touching either index.
    fn dry_run(
        &self,
        candidates: Vec<SourceDocument>,
        tracked: &HashMap<String, IndexedDocumentRecord>,
        seen: &HashSet<String>,
        mut summary: RunSummary,
        started: Instant,
        full: bool,
    ) -> Result<RunSummary> {
        let mut estimated_chunks = 0usize;

        for doc in &candidates {
            let outcome = match normalize_document(doc) {
                Err(e) => DocOutcome::Failed {
                    id: doc.id.clone(),
                    reason: e.to_string(),
                },
                Ok(normalized) => {
                    let known = if full { None } else { tracked.get(&doc.id) };
                    let classification = classify(&normalized, known);
                    if classification == Classification::Unchanged {
                        DocOutcome::Unchanged {
                            id: normalized.id.clone(),
                        }
                    } else {
                        match chunk_document(
                            &normalized,
                            self.config.chunking.max_chars,
                            self.config.chunking.overlap,
                        ) {
                            Ok(chunks) => {
                                estimated_chunks += chunks.len();
                                DocOutcome::Indexed {
                                    id: normalized.id.clone(),
                                    classification,
                                    chunks: chunks.len(),
                                }
                            }
                            // Same isolation as the real path: one bad
                            // document never aborts the run.
                            Err(e) => DocOutcome::Failed {
                                id: normalized.id.clone(),
                                reason: e.to_string(),
                            },
                        }
                    }
                }
            };
            summary.record(&outcome);
        }

        summary.deleted = deleted_ids(tracked, seen).len() as u64;
        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            would_index = summary.new + summary.changed,
            estimated_chunks, "dry run, nothing written"
        );
        Ok(summary)
    }
}

/// One document's pipeline, start to finish. Never returns an error; every
/// failure collapses into a `Failed` outcome for the orchestrator.
async fn process_document(
    doc: SourceDocument,
    known: Option<IndexedDocumentRecord>,
    config: Arc<Config>,
    embedder: Arc<dyn Embedder>,
    writer: Arc<IndexWriter>,
    limiter: Arc<RateLimiter>,
) -> DocOutcome {
    let id = doc.id.clone();
    match run_stages(doc, known, config, embedder, writer, limiter).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(id, error = %e, "document failed, will retry next run");
            DocOutcome::Failed {
                id,
                reason: e.to_string(),
            }
        }
    }
}

async fn run_stages(
    doc: SourceDocument,
    known: Option<IndexedDocumentRecord>,
    config: Arc<Config>,
    embedder: Arc<dyn Embedder>,
    writer: Arc<IndexWriter>,
    limiter: Arc<RateLimiter>,
) -> Result<DocOutcome, PipelineError> {
    let normalized = normalize_document(&doc)?;

    let classification = classify(&normalized, known.as_ref());
    if classification == Classification::Unchanged {
        debug!(id = %normalized.id, "fingerprint unchanged, skipping");
        return Ok(DocOutcome::Unchanged { id: normalized.id });
    }

    let chunks = chunk_document(
        &normalized,
        config.chunking.max_chars,
        config.chunking.overlap,
    )?;

    let embedded = embed_all(
        embedder.as_ref(),
        &limiter,
        chunks,
        config.embedding.batch_size,
        config.pipeline.retry(),
    )
    .await?;

    writer.write_document(&normalized, &embedded).await?;

    info!(
        id = %normalized.id,
        ?classification,
        chunks = embedded.len(),
        "document indexed"
    );
    Ok(DocOutcome::Indexed {
        id: normalized.id,
        classification,
        chunks: embedded.len(),
    })
}

/// Rows carrying a `workflow_state` other than `published` are excluded
/// before classification; rows without the field are ingested as-is.
fn is_published(doc: &SourceDocument) -> bool {
    doc.metadata
        .get("workflow_state")
        .map(|state| state == "published")
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;

    fn doc_with_state(state: Option<&str>) -> SourceDocument {
        let mut metadata = Metadata::new();
        if let Some(s) = state {
            metadata.insert("workflow_state".to_string(), s.to_string());
        }
        SourceDocument {
            id: "A".to_string(),
            raw_content: String::new(),
            metadata,
        }
    }

    #[test]
    fn test_publication_filter() {
        assert!(is_published(&doc_with_state(Some("published"))));
        assert!(!is_published(&doc_with_state(Some("draft"))));
        assert!(!is_published(&doc_with_state(Some("retired"))));
        assert!(is_published(&doc_with_state(None)));
    }
}
