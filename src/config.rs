use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    pub indexes: IndexesConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Where source rows come from: a SQLite snapshot of the analytics table
/// plus the SELECT that pulls candidate rows out of it.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub db_path: PathBuf,
    /// Must yield `id` and `content` columns; every other column becomes
    /// document metadata.
    pub selector: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexesConfig {
    /// Full-text document index.
    pub document: String,
    /// Chunk embedding index.
    pub vector: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Upper bound on chunk length, in bytes; cuts are clamped to UTF-8
    /// character boundaries.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    /// Bytes repeated from the end of one chunk at the start of the
    /// next. Must be < max_chars.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap: default_overlap(),
        }
    }
}

fn default_max_chars() -> usize {
    2048
}
fn default_overlap() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Base URL of an OpenAI-compatible embeddings endpoint.
    pub url: String,
    pub model: String,
    /// Expected vector dimensionality.
    pub dims: usize,
    /// Chunks per embedding request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Embedding requests allowed per minute across all workers.
    /// 0 disables throttling.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
}

fn default_batch_size() -> usize {
    20
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_rate_limit() -> u32 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Base URL of the search engine REST API.
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Documents processed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency_limit: usize,
    /// Additional attempts after the first, for transient embedding and
    /// write failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}

/// Shared retry policy for transient embedding and index-write failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Exponential backoff before retry `attempt` (1-based), capped at
    /// base × 2^6.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.pow((attempt - 1).min(6))
    }
}

impl PipelineConfig {
    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.source.selector.trim().is_empty() {
        anyhow::bail!("source.selector must not be empty");
    }

    if config.indexes.document.is_empty() || config.indexes.vector.is_empty() {
        anyhow::bail!("indexes.document and indexes.vector must not be empty");
    }
    if config.indexes.document == config.indexes.vector {
        anyhow::bail!("indexes.document and indexes.vector must be distinct");
    }

    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap >= config.chunking.max_chars {
        anyhow::bail!("chunking.overlap must be < chunking.max_chars");
    }

    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }

    if config.pipeline.concurrency_limit == 0 {
        anyhow::bail!("pipeline.concurrency_limit must be > 0");
    }

    Ok(())
}
