//! In-memory [`SearchBackend`] for tests.
//!
//! `BTreeMap`s behind `std::sync::RwLock`, one per configured index. Also
//! counts mutating operations so tests can assert that an unchanged run
//! performs zero writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::WriteError;

use super::SearchBackend;

pub struct MemoryBackend {
    indices: RwLock<HashMap<String, BTreeMap<String, Value>>>,
    write_ops: AtomicU64,
}

impl MemoryBackend {
    /// Backend with the given indices pre-provisioned.
    pub fn with_indices<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let indices = names
            .into_iter()
            .map(|n| (n.into(), BTreeMap::new()))
            .collect();
        Self {
            indices: RwLock::new(indices),
            write_ops: AtomicU64::new(0),
        }
    }

    /// Backend with no indices, for exercising setup preflight failures.
    pub fn empty() -> Self {
        Self::with_indices(Vec::<String>::new())
    }

    /// Snapshot of all `(id, record)` pairs in an index.
    pub fn records(&self, index: &str) -> Vec<(String, Value)> {
        self.indices
            .read()
            .unwrap()
            .get(index)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Number of mutating calls (upsert, delete, bulk, delete_by_field)
    /// made so far.
    pub fn write_ops(&self) -> u64 {
        self.write_ops.load(Ordering::SeqCst)
    }

    fn with_index<T>(
        &self,
        index: &str,
        f: impl FnOnce(&mut BTreeMap<String, Value>) -> T,
    ) -> Result<T, WriteError> {
        let mut indices = self.indices.write().unwrap();
        match indices.get_mut(index) {
            Some(records) => Ok(f(records)),
            None => Err(WriteError::MissingIndex {
                index: index.to_string(),
            }),
        }
    }
}

#[async_trait]
impl SearchBackend for MemoryBackend {
    async fn index_exists(&self, index: &str) -> Result<bool, WriteError> {
        Ok(self.indices.read().unwrap().contains_key(index))
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>, WriteError> {
        let indices = self.indices.read().unwrap();
        match indices.get(index) {
            Some(records) => Ok(records.get(id).cloned()),
            None => Err(WriteError::MissingIndex {
                index: index.to_string(),
            }),
        }
    }

    async fn upsert(&self, index: &str, id: &str, doc: Value) -> Result<(), WriteError> {
        self.write_ops.fetch_add(1, Ordering::SeqCst);
        self.with_index(index, |records| {
            records.insert(id.to_string(), doc);
        })
    }

    async fn delete(&self, index: &str, id: &str) -> Result<(), WriteError> {
        self.write_ops.fetch_add(1, Ordering::SeqCst);
        self.with_index(index, |records| {
            records.remove(id);
        })
    }

    async fn bulk_insert(
        &self,
        index: &str,
        items: Vec<(String, Value)>,
    ) -> Result<(), WriteError> {
        self.write_ops.fetch_add(1, Ordering::SeqCst);
        self.with_index(index, |records| {
            for (id, doc) in items {
                records.insert(id, doc);
            }
        })
    }

    async fn delete_by_field(
        &self,
        index: &str,
        field: &str,
        value: &str,
    ) -> Result<(), WriteError> {
        self.write_ops.fetch_add(1, Ordering::SeqCst);
        self.with_index(index, |records| {
            records.retain(|_, doc| doc.get(field).and_then(Value::as_str) != Some(value));
        })
    }

    async fn scan(&self, index: &str) -> Result<Vec<(String, Value)>, WriteError> {
        let indices = self.indices.read().unwrap();
        match indices.get(index) {
            Some(records) => Ok(records.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            None => Err(WriteError::MissingIndex {
                index: index.to_string(),
            }),
        }
    }
}
