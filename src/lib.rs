//! # kb-sync
//!
//! Incremental ingestion of knowledge-base documents from a relational
//! analytics source into a pair of synchronized search indices: a
//! full-text document index and a chunked vector-embedding index.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌─────────┐   ┌──────────┐   ┌─────────────┐
//! │  Source  │──▶│ Normalize │──▶│Classify │──▶│ Chunk +  │──▶│ Dual-Index  │
//! │ (SQL)    │   │ + hash    │   │ vs      │   │ Embed    │   │ Writer      │
//! └──────────┘   └───────────┘   │ tracked │   └──────────┘   └─────────────┘
//!                                └────┬────┘
//!                                     │ fingerprint match → skip
//! ```
//!
//! Documents whose content fingerprint matches the one recorded on their
//! last successful indexing are skipped entirely; changed and new
//! documents are re-chunked, re-embedded, and rewritten; tracked documents
//! missing from the current pull are purged from both indices. Fingerprints
//! are committed only after both indices hold the new content, so an
//! interrupted run reprocesses rather than loses documents.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types and run accounting |
//! | [`error`] | Pipeline error taxonomy |
//! | [`source`] | Source rows (SQL snapshot) |
//! | [`normalize`] | Markup stripping and content fingerprinting |
//! | [`classify`] | Change detection and deletion reconciliation |
//! | [`chunk`] | Bounded, overlapping text chunking |
//! | [`embedding`] | Embedding capability and batched retry logic |
//! | [`limiter`] | Shared per-minute request limiter |
//! | [`index`] | Search-engine backend abstraction |
//! | [`writer`] | Cross-index consistency and fingerprint commit |
//! | [`pipeline`] | Orchestration, concurrency, and the run summary |

pub mod chunk;
pub mod classify;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod limiter;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod source;
pub mod writer;
