//! End-to-end pipeline tests over the in-memory collaborators.
//!
//! Each test wires a [`StaticSource`], a scriptable mock embedder, and a
//! [`MemoryBackend`] into the real orchestrator, then asserts on the run
//! summary and the resulting index contents.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use kb_sync::config::{
    ChunkingConfig, Config, EmbeddingConfig, IndexesConfig, PipelineConfig, SearchConfig,
    SourceConfig,
};
use kb_sync::embedding::Embedder;
use kb_sync::error::{EmbedError, WriteError};
use kb_sync::index::{MemoryBackend, SearchBackend};
use kb_sync::models::{Metadata, RunSummary, SourceDocument};
use kb_sync::pipeline::{Pipeline, RunOptions};
use kb_sync::source::StaticSource;

const DOC_INDEX: &str = "kb-documents";
const VEC_INDEX: &str = "kb-embeddings";

/// Embedder that fails its first `fail_first` calls transiently, fails any
/// batch containing `poison` permanently, and otherwise returns
/// length-dependent vectors.
struct MockEmbedder {
    calls: AtomicUsize,
    fail_first: usize,
    poison: Option<String>,
}

impl MockEmbedder {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            poison: None,
        })
    }

    fn flaky(fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first,
            poison: None,
        })
    }

    fn poisoned(marker: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            poison: Some(marker.to_string()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(EmbedError::Transient("connection reset".to_string()));
        }
        if let Some(marker) = &self.poison {
            if texts.iter().any(|t| t.contains(marker)) {
                return Err(EmbedError::Permanent("input rejected".to_string()));
            }
        }
        Ok(texts
            .iter()
            .map(|t| vec![t.len() as f32, 1.0, 2.0, 3.0])
            .collect())
    }

    fn model_name(&self) -> &str {
        "mock-embed"
    }
}

fn config() -> Arc<Config> {
    Arc::new(Config {
        source: SourceConfig {
            db_path: "/unused".into(),
            selector: "unused".to_string(),
        },
        indexes: IndexesConfig {
            document: DOC_INDEX.to_string(),
            vector: VEC_INDEX.to_string(),
        },
        chunking: ChunkingConfig {
            max_chars: 2048,
            overlap: 256,
        },
        embedding: EmbeddingConfig {
            url: "http://unused".to_string(),
            model: "mock-embed".to_string(),
            dims: 4,
            batch_size: 20,
            timeout_secs: 5,
            rate_limit_per_minute: 0,
        },
        search: SearchConfig {
            url: "http://unused".to_string(),
            timeout_secs: 5,
        },
        pipeline: PipelineConfig {
            concurrency_limit: 4,
            max_retries: 3,
            backoff_base_ms: 1,
        },
    })
}

fn doc(id: &str, content: &str) -> SourceDocument {
    let mut metadata = Metadata::new();
    metadata.insert("workflow_state".to_string(), "published".to_string());
    metadata.insert("title".to_string(), format!("Title of {id}"));
    SourceDocument {
        id: id.to_string(),
        raw_content: content.to_string(),
        metadata,
    }
}

fn backend() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::with_indices([DOC_INDEX, VEC_INDEX]))
}

async fn run(
    docs: Vec<SourceDocument>,
    embedder: Arc<MockEmbedder>,
    backend: Arc<MemoryBackend>,
) -> RunSummary {
    run_with_opts(docs, embedder, backend, RunOptions::default()).await
}

async fn run_with_opts(
    docs: Vec<SourceDocument>,
    embedder: Arc<MockEmbedder>,
    backend: Arc<MemoryBackend>,
    opts: RunOptions,
) -> RunSummary {
    let pipeline = Pipeline::new(
        config(),
        Arc::new(StaticSource::new(docs)),
        embedder,
        backend as Arc<dyn SearchBackend>,
    );
    pipeline
        .run(opts, CancellationToken::new())
        .await
        .expect("run should not be fatal")
}

fn field(record: &Value, name: &str) -> Value {
    record.get(name).cloned().unwrap_or(Value::Null)
}

#[tokio::test]
async fn test_first_run_indexes_new_document() {
    let backend = backend();
    let summary = run(vec![doc("A", "Hello world.")], MockEmbedder::ok(), backend.clone()).await;

    assert_eq!(summary.new, 1);
    assert_eq!(summary.failed, 0);

    let docs = backend.records(DOC_INDEX);
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].0, "A");
    assert_eq!(field(&docs[0].1, "content"), "Hello world.");
    assert!(field(&docs[0].1, "fingerprint").is_string());

    let vectors = backend.records(VEC_INDEX);
    assert_eq!(vectors.len(), 1);
    assert_eq!(vectors[0].0, "A:0");
    assert_eq!(field(&vectors[0].1, "parent_id"), "A");
    assert_eq!(field(&vectors[0].1, "chunk_index"), 0);
    assert_eq!(field(&vectors[0].1, "embedding").as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_second_run_on_identical_content_writes_nothing() {
    let backend = backend();
    let docs = vec![doc("A", "Hello world."), doc("B", "<p>Other content</p>")];

    let first = run(docs.clone(), MockEmbedder::ok(), backend.clone()).await;
    assert_eq!(first.new, 2);

    let writes_after_first = backend.write_ops();
    let second = run(docs, MockEmbedder::ok(), backend.clone()).await;

    assert_eq!(second.unchanged, 2);
    assert_eq!(second.new + second.changed + second.failed, 0);
    assert_eq!(backend.write_ops(), writes_after_first);
}

#[tokio::test]
async fn test_markup_variants_hash_identically() {
    // Whitespace-only differences normalize away, so the second run still
    // classifies the document as unchanged.
    let backend = backend();
    run(
        vec![doc("A", "<p>Hello   world.</p>")],
        MockEmbedder::ok(),
        backend.clone(),
    )
    .await;
    let second = run(
        vec![doc("A", "<p>Hello world.</p>\n")],
        MockEmbedder::ok(),
        backend.clone(),
    )
    .await;
    assert_eq!(second.unchanged, 1);
}

#[tokio::test]
async fn test_changed_content_replaces_old_vectors() {
    let backend = backend();
    run(vec![doc("A", "Hello world.")], MockEmbedder::ok(), backend.clone()).await;

    let old_fingerprint = field(&backend.records(DOC_INDEX)[0].1, "fingerprint")
        .as_str()
        .unwrap()
        .to_string();

    let summary = run(
        vec![doc("A", "Hello world! Extra.")],
        MockEmbedder::ok(),
        backend.clone(),
    )
    .await;
    assert_eq!(summary.changed, 1);

    let docs = backend.records(DOC_INDEX);
    let new_fingerprint = field(&docs[0].1, "fingerprint")
        .as_str()
        .unwrap()
        .to_string();
    assert_ne!(new_fingerprint, old_fingerprint);

    // Every vector entry belongs to the new content version.
    let vectors = backend.records(VEC_INDEX);
    assert!(!vectors.is_empty());
    for (_, v) in &vectors {
        assert_eq!(field(v, "fingerprint").as_str().unwrap(), new_fingerprint);
        assert_eq!(field(v, "text"), "Hello world! Extra.");
    }
}

#[tokio::test]
async fn test_vector_entries_match_current_chunk_set_exactly() {
    let backend = backend();
    let long = (0..40)
        .map(|i| format!("Paragraph {i} with enough words to matter."))
        .collect::<Vec<_>>()
        .join("\n\n");
    run(vec![doc("A", &long)], MockEmbedder::ok(), backend.clone()).await;

    let many = backend.records(VEC_INDEX).len();
    assert!(many > 0);

    // Shrinking the document must shrink the vector set, leaving no
    // orphans from the longer version.
    run(vec![doc("A", "Now very short.")], MockEmbedder::ok(), backend.clone()).await;

    let vectors = backend.records(VEC_INDEX);
    assert_eq!(vectors.len(), 1);
    assert_eq!(vectors[0].0, "A:0");

    // chunk_index values are exactly 0..N-1.
    let mut indices: Vec<u64> = backend
        .records(VEC_INDEX)
        .iter()
        .map(|(_, v)| field(v, "chunk_index").as_u64().unwrap())
        .collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0]);
}

#[tokio::test]
async fn test_source_deletion_purges_both_indices() {
    let backend = backend();
    run(
        vec![doc("A", "Hello."), doc("B", "Stays.")],
        MockEmbedder::ok(),
        backend.clone(),
    )
    .await;

    let summary = run(vec![doc("B", "Stays.")], MockEmbedder::ok(), backend.clone()).await;
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.unchanged, 1);

    let doc_ids: Vec<String> = backend.records(DOC_INDEX).into_iter().map(|(id, _)| id).collect();
    assert_eq!(doc_ids, vec!["B"]);
    for (_, v) in backend.records(VEC_INDEX) {
        assert_eq!(field(&v, "parent_id"), "B");
    }
}

#[tokio::test]
async fn test_transient_failures_retried_to_success() {
    let backend = backend();
    let embedder = MockEmbedder::flaky(2);

    let summary = run(vec![doc("A", "Hello world.")], embedder.clone(), backend.clone()).await;

    assert_eq!(summary.new, 1);
    assert_eq!(summary.failed, 0);
    // Two failures plus the successful third attempt, nothing beyond.
    assert_eq!(embedder.calls(), 3);
    assert_eq!(backend.records(VEC_INDEX).len(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_leave_document_unindexed() {
    let backend = backend();
    let embedder = MockEmbedder::flaky(usize::MAX);

    let summary = run(vec![doc("A", "Hello world.")], embedder, backend.clone()).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.new, 0);
    // The write step was skipped entirely: no document record, no vectors.
    assert!(backend.records(DOC_INDEX).is_empty());
    assert!(backend.records(VEC_INDEX).is_empty());

    // The next run picks the document up again.
    let retry = run(vec![doc("A", "Hello world.")], MockEmbedder::ok(), backend.clone()).await;
    assert_eq!(retry.new, 1);
    assert_eq!(backend.records(VEC_INDEX).len(), 1);
}

#[tokio::test]
async fn test_empty_document_is_recorded_with_zero_vectors() {
    let backend = backend();
    let summary = run(vec![doc("A", "")], MockEmbedder::ok(), backend.clone()).await;

    assert_eq!(summary.new, 1);
    assert_eq!(summary.failed, 0);

    let docs = backend.records(DOC_INDEX);
    assert_eq!(field(&docs[0].1, "chunk_count"), 0);
    assert!(backend.records(VEC_INDEX).is_empty());

    // And it is tracked: the second run skips it.
    let second = run(vec![doc("A", "")], MockEmbedder::ok(), backend.clone()).await;
    assert_eq!(second.unchanged, 1);
}

#[tokio::test]
async fn test_one_failure_does_not_abort_the_run() {
    let backend = backend();
    let embedder = MockEmbedder::poisoned("REJECTME");

    let summary = run(
        vec![doc("A", "Fine content."), doc("B", "REJECTME please")],
        embedder,
        backend.clone(),
    )
    .await;

    assert_eq!(summary.new, 1);
    assert_eq!(summary.failed, 1);

    let doc_ids: Vec<String> = backend.records(DOC_INDEX).into_iter().map(|(id, _)| id).collect();
    assert_eq!(doc_ids, vec!["A"]);
}

#[tokio::test]
async fn test_malformed_markup_is_a_per_document_failure() {
    let backend = backend();
    let summary = run(
        vec![doc("A", "truncated <div class="), doc("B", "Good.")],
        MockEmbedder::ok(),
        backend.clone(),
    )
    .await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.new, 1);
}

#[tokio::test]
async fn test_unpublished_rows_are_filtered() {
    let backend = backend();
    let mut draft = doc("D", "Draft content.");
    draft
        .metadata
        .insert("workflow_state".to_string(), "draft".to_string());

    let summary = run(vec![doc("A", "Live."), draft], MockEmbedder::ok(), backend.clone()).await;

    assert_eq!(summary.new, 1);
    assert_eq!(summary.filtered, 1);
    assert_eq!(backend.records(DOC_INDEX).len(), 1);
}

#[tokio::test]
async fn test_full_flag_reprocesses_unchanged_documents() {
    let backend = backend();
    run(vec![doc("A", "Hello.")], MockEmbedder::ok(), backend.clone()).await;

    let summary = run_with_opts(
        vec![doc("A", "Hello.")],
        MockEmbedder::ok(),
        backend.clone(),
        RunOptions {
            full: true,
            ..Default::default()
        },
    )
    .await;

    assert_eq!(summary.new, 1);
    assert_eq!(summary.unchanged, 0);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let backend = backend();
    let summary = run_with_opts(
        vec![doc("A", "Hello world.")],
        MockEmbedder::ok(),
        backend.clone(),
        RunOptions {
            dry_run: true,
            ..Default::default()
        },
    )
    .await;

    assert_eq!(summary.new, 1);
    assert_eq!(backend.write_ops(), 0);
    assert!(backend.records(DOC_INDEX).is_empty());
}

#[tokio::test]
async fn test_dry_run_records_chunking_failures_per_document() {
    let backend = backend();
    let mut cfg = (*config()).clone();
    cfg.chunking = ChunkingConfig {
        max_chars: 10,
        overlap: 10,
    };

    let pipeline = Pipeline::new(
        Arc::new(cfg),
        Arc::new(StaticSource::new(vec![
            doc("A", "Hello world."),
            doc("B", "More text."),
        ])),
        MockEmbedder::ok(),
        backend.clone() as Arc<dyn SearchBackend>,
    );
    let summary = pipeline
        .run(
            RunOptions {
                dry_run: true,
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .expect("bad chunk bounds fail documents, not the run");

    assert_eq!(summary.failed, 2);
    assert_eq!(summary.new, 0);
    assert_eq!(backend.write_ops(), 0);
}

#[tokio::test]
async fn test_cancelled_run_dispatches_no_documents() {
    let backend = backend();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let pipeline = Pipeline::new(
        config(),
        Arc::new(StaticSource::new(vec![doc("A", "Hello.")])),
        MockEmbedder::ok(),
        backend.clone() as Arc<dyn SearchBackend>,
    );
    let summary = pipeline.run(RunOptions::default(), cancel).await.unwrap();

    assert_eq!(summary.new + summary.changed + summary.failed, 0);
    assert!(backend.records(DOC_INDEX).is_empty());
}

/// Backend whose vector-index bulk inserts can be made to fail, for
/// checking that a partial write never commits a fingerprint.
struct BrokenBulkBackend {
    inner: MemoryBackend,
    fail_bulk: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl SearchBackend for BrokenBulkBackend {
    async fn index_exists(&self, index: &str) -> Result<bool, WriteError> {
        self.inner.index_exists(index).await
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>, WriteError> {
        self.inner.get(index, id).await
    }

    async fn upsert(&self, index: &str, id: &str, doc: Value) -> Result<(), WriteError> {
        self.inner.upsert(index, id, doc).await
    }

    async fn delete(&self, index: &str, id: &str) -> Result<(), WriteError> {
        self.inner.delete(index, id).await
    }

    async fn bulk_insert(
        &self,
        index: &str,
        items: Vec<(String, Value)>,
    ) -> Result<(), WriteError> {
        if self.fail_bulk.load(Ordering::SeqCst) {
            return Err(WriteError::Rejected {
                index: index.to_string(),
                reason: "mapping conflict".to_string(),
            });
        }
        self.inner.bulk_insert(index, items).await
    }

    async fn delete_by_field(
        &self,
        index: &str,
        field: &str,
        value: &str,
    ) -> Result<(), WriteError> {
        self.inner.delete_by_field(index, field, value).await
    }

    async fn scan(&self, index: &str) -> Result<Vec<(String, Value)>, WriteError> {
        self.inner.scan(index).await
    }
}

#[tokio::test]
async fn test_partial_write_does_not_commit_fingerprint() {
    let backend = Arc::new(BrokenBulkBackend {
        inner: MemoryBackend::with_indices([DOC_INDEX, VEC_INDEX]),
        fail_bulk: std::sync::atomic::AtomicBool::new(true),
    });

    let pipeline = Pipeline::new(
        config(),
        Arc::new(StaticSource::new(vec![doc("A", "Hello world.")])),
        MockEmbedder::ok(),
        backend.clone() as Arc<dyn SearchBackend>,
    );
    let summary = pipeline
        .run(RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);

    // The document body was upserted before the vector write failed, but
    // no fingerprint was committed and no vectors landed.
    let docs = backend.inner.records(DOC_INDEX);
    assert_eq!(docs.len(), 1);
    assert!(field(&docs[0].1, "fingerprint").is_null());
    assert!(backend.inner.records(VEC_INDEX).is_empty());

    // With the fault cleared, the next run classifies the document as new
    // and completes the write.
    backend.fail_bulk.store(false, Ordering::SeqCst);
    let pipeline = Pipeline::new(
        config(),
        Arc::new(StaticSource::new(vec![doc("A", "Hello world.")])),
        MockEmbedder::ok(),
        backend.clone() as Arc<dyn SearchBackend>,
    );
    let summary = pipeline
        .run(RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.new, 1);
    assert!(field(&backend.inner.records(DOC_INDEX)[0].1, "fingerprint").is_string());
    assert_eq!(backend.inner.records(VEC_INDEX).len(), 1);
}

#[tokio::test]
async fn test_missing_target_index_is_fatal() {
    let pipeline = Pipeline::new(
        config(),
        Arc::new(StaticSource::new(vec![doc("A", "Hello.")])),
        MockEmbedder::ok(),
        Arc::new(MemoryBackend::empty()) as Arc<dyn SearchBackend>,
    );

    let err = pipeline
        .run(RunOptions::default(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("does not exist"));
}
