//! Search-engine backend abstraction.
//!
//! The [`SearchBackend`] trait covers the per-index operations the
//! pipeline needs: upsert/get/delete by id, bulk insert, delete-by-field,
//! and a full scan used to load tracked fingerprints. Each call is assumed
//! atomic, but nothing is transactional across indices — cross-index
//! consistency is the writer's job, not the backend's.
//!
//! Implementations must be `Send + Sync`; documents are processed by
//! concurrent workers sharing one backend handle.

pub mod http;
pub mod memory;

pub use http::HttpBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::WriteError;

#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn index_exists(&self, index: &str) -> Result<bool, WriteError>;

    /// Fetch one record by id, or `None` if absent.
    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>, WriteError>;

    /// Insert or fully replace a record.
    async fn upsert(&self, index: &str, id: &str, doc: Value) -> Result<(), WriteError>;

    /// Delete one record. Deleting an absent id is not an error.
    async fn delete(&self, index: &str, id: &str) -> Result<(), WriteError>;

    /// Insert or replace many records in one call.
    async fn bulk_insert(&self, index: &str, items: Vec<(String, Value)>)
        -> Result<(), WriteError>;

    /// Delete every record whose `field` equals `value`.
    async fn delete_by_field(&self, index: &str, field: &str, value: &str)
        -> Result<(), WriteError>;

    /// All `(id, record)` pairs in the index. Used once per run to load
    /// tracked fingerprints from the document index.
    async fn scan(&self, index: &str) -> Result<Vec<(String, Value)>, WriteError>;
}
