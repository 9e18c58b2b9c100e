//! Source collaborator: where raw knowledge-base rows come from.
//!
//! [`Source`] yields one finite batch of [`SourceDocument`]s per run. The
//! shipping implementation reads a SQLite snapshot of the analytics table
//! through a configured SELECT; tests use [`StaticSource`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row};
use std::str::FromStr;

use crate::config::SourceConfig;
use crate::models::{Metadata, SourceDocument};

/// A finite, restartable sequence of source documents, consumed once per
/// run.
#[async_trait]
pub trait Source: Send + Sync {
    async fn fetch(&self) -> Result<Vec<SourceDocument>>;
}

/// Reads rows from a SQLite database using the configured selector query.
///
/// The selector must yield an `id` column and a `content` column; every
/// other column is carried as string metadata (title, url, workflow_state,
/// timestamps), mirroring the warehouse row shape.
pub struct SqliteSource {
    config: SourceConfig,
}

impl SqliteSource {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Source for SqliteSource {
    async fn fetch(&self) -> Result<Vec<SourceDocument>> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite:{}", self.config.db_path.display()))?
                .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| {
                format!("Failed to open source db: {}", self.config.db_path.display())
            })?;

        let rows = sqlx::query(&self.config.selector)
            .fetch_all(&pool)
            .await
            .context("Source selector query failed")?;

        let mut docs = Vec::with_capacity(rows.len());
        for row in &rows {
            docs.push(row_to_document(row)?);
        }

        pool.close().await;
        Ok(docs)
    }
}

fn row_to_document(row: &SqliteRow) -> Result<SourceDocument> {
    let mut id = None;
    let mut content = None;
    let mut metadata = Metadata::new();

    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name();
        let value = column_as_string(row, i);
        match name {
            "id" => id = value,
            "content" => content = value,
            _ => {
                if let Some(v) = value {
                    metadata.insert(name.to_string(), v);
                }
            }
        }
    }

    let id = id.context("selector row is missing a non-null 'id' column")?;
    Ok(SourceDocument {
        id,
        raw_content: content.unwrap_or_default(),
        metadata,
    })
}

/// SQLite columns are dynamically typed; render whatever is there as a
/// string scalar.
fn column_as_string(row: &SqliteRow, idx: usize) -> Option<String> {
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v;
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(|n| n.to_string());
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(|n| n.to_string());
    }
    None
}

/// Fixed in-memory source for tests.
pub struct StaticSource {
    docs: Vec<SourceDocument>,
}

impl StaticSource {
    pub fn new(docs: Vec<SourceDocument>) -> Self {
        Self { docs }
    }
}

#[async_trait]
impl Source for StaticSource {
    async fn fetch(&self) -> Result<Vec<SourceDocument>> {
        Ok(self.docs.clone())
    }
}
