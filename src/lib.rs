//! Persistent knowledge store for AI coding assistants.
//!
//! Trove keeps an append-only audit trail of assistant activity, a curated
//! set of memories per project, and a global index that aggregates memories
//! across projects. Memories decay in importance unless they are recalled,
//! can be linked into a typed graph, and are searchable by keyword, by
//! meaning, or both.
//!
//! # Architecture
//!
//! - **Storage**: one SQLite file per project plus one global file, with FTS5
//!   for keyword search and [sqlite-vec](https://github.com/asg017/sqlite-vec)
//!   for vector search
//! - **Embeddings**: pluggable [`embedding::EmbeddingProvider`]; vectors are
//!   filled in by a bounded background worker pool, never inline on writes
//! - **Search**: keyword (BM25), semantic (cosine) or hybrid, re-ranked by
//!   recency and decayed importance
//! - **Sync**: committed project memories are copied into the global store,
//!   keyed by content hash
//!
//! # Modules
//!
//! - [`config`]: TOML configuration with defaults and `TROVE_*` overrides
//! - [`db`]: store handles, schema, migrations, health checks
//! - [`memory`]: memories, categorization, ranking, search, relationships, review
//! - [`activity`]: the redacted audit log and timelines
//! - [`session`]: session lifecycle, summaries, continuity context
//! - [`sync`]: the global index
//! - [`embedding`]: providers and the background worker pool
//! - [`engine`]: the async [`Trove`] facade over all of the above

pub mod activity;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod memory;
pub mod session;
pub mod sync;

pub use config::TroveConfig;
pub use engine::Trove;
pub use error::{TroveError, TroveResult};

use tracing_subscriber::EnvFilter;

/// Install a stderr `fmt` subscriber at the configured log level.
/// `RUST_LOG`-style directives are accepted; an invalid one falls back to
/// `info`. Does nothing if a subscriber is already installed.
pub fn init_tracing(config: &TroveConfig) {
    let filter =
        EnvFilter::try_new(&config.server.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
