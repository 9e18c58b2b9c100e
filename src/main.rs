//! # kb-sync CLI (`kbsync`)
//!
//! Syncs knowledge-base documents from a SQL snapshot into paired
//! full-text and vector search indices.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbsync sync` | Run the incremental ingestion pipeline |
//! | `kbsync check` | Validate configuration and backend preconditions |
//!
//! ## Examples
//!
//! ```bash
//! # Incremental sync
//! kbsync sync --config ./config/kbsync.toml
//!
//! # Reprocess everything, ignoring recorded fingerprints
//! kbsync sync --full
//!
//! # See what a run would do without writing
//! kbsync sync --dry-run --limit 50
//! ```
//!
//! Exit status: 0 on a clean run, 1 on a fatal error, 2 when the run
//! completed but some documents failed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kb_sync::config::{load_config, Config};
use kb_sync::embedding::HttpEmbedder;
use kb_sync::index::HttpBackend;
use kb_sync::models::RunSummary;
use kb_sync::pipeline::{Pipeline, RunOptions};
use kb_sync::source::SqliteSource;
use kb_sync::writer::IndexWriter;

/// kb-sync — incremental knowledge-base ingestion into a dual search
/// index.
#[derive(Parser)]
#[command(
    name = "kbsync",
    about = "Sync knowledge-base documents into paired full-text and vector search indices",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion pipeline.
    Sync {
        /// Reprocess every document, ignoring recorded fingerprints.
        #[arg(long)]
        full: bool,

        /// Pull and classify but write nothing.
        #[arg(long)]
        dry_run: bool,

        /// Process at most N source documents.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Validate the configuration and verify both target indices exist.
    Check,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = Arc::new(load_config(&cli.config)?);

    match cli.command {
        Commands::Sync {
            full,
            dry_run,
            limit,
        } => {
            let summary = run_sync(config, RunOptions { full, dry_run, limit }).await?;
            print_summary(&summary, dry_run);
            Ok(if summary.has_failures() { 2 } else { 0 })
        }
        Commands::Check => {
            run_check(&config).await?;
            println!("check ok");
            Ok(0)
        }
    }
}

async fn run_sync(config: Arc<Config>, opts: RunOptions) -> Result<RunSummary> {
    let source = Arc::new(SqliteSource::new(config.source.clone()));
    let embedder = Arc::new(HttpEmbedder::new(&config.embedding)?);
    let backend = Arc::new(HttpBackend::new(&config.search)?);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing in-flight documents");
            ctrl_c.cancel();
        }
    });

    let pipeline = Pipeline::new(config, source, embedder, backend);
    pipeline.run(opts, cancel).await
}

async fn run_check(config: &Config) -> Result<()> {
    let backend = Arc::new(HttpBackend::new(&config.search)?);
    let writer = IndexWriter::new(
        backend,
        config.indexes.clone(),
        config.pipeline.retry(),
    );
    writer.ensure_indices().await?;
    Ok(())
}

fn print_summary(summary: &RunSummary, dry_run: bool) {
    if dry_run {
        println!("sync (dry-run)");
    } else {
        println!("sync");
    }
    println!("  new: {}", summary.new);
    println!("  changed: {}", summary.changed);
    println!("  unchanged: {}", summary.unchanged);
    println!("  filtered: {}", summary.filtered);
    println!("  deleted: {}", summary.deleted);
    println!("  failed: {}", summary.failed);
    println!("  duration: {}ms", summary.duration_ms);
    if summary.has_failures() {
        println!("completed with failures");
    } else {
        println!("ok");
    }
}
