//! # devctx
//!
//! Hybrid retrieval and context assembly over a local knowledge store.
//!
//! devctx keeps ADRs, notes, papers and chat logs in SQLite (documents,
//! chunks, an FTS5 index, embedding vectors) and turns a query into a
//! bounded, sanitized, provenance-tagged context block for an LLM prompt.
//!
//! ## Pipeline
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐
//! │  query   │──▶│ lexical FTS5 │──┐
//! └────┬─────┘   └──────────────┘  │   ┌─────┐   ┌──────────┐   ┌────────┐
//!      │         ┌──────────────┐  ├──▶│ RRF │──▶│ sanitize │──▶│ budget │──▶ ContextResult
//!      └────────▶│ vector (cos) │──┘   └─────┘   └──────────┘   └────────┘
//!                └──────────────┘
//! ```
//!
//! [`enhanced`] optionally wraps this with LLM query expansion and
//! re-ranking, degrading to the plain pipeline whenever generation fails.
//!
//! ## Quick Start
//!
//! ```bash
//! devctx init
//! devctx ingest ./docs
//! devctx context "why did we pick sqlite" --budget 8000
//! devctx enhanced "retry policy" --expand --rerank --json
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Documents, chunks, hits, and context results |
//! | [`error`] | Typed errors for the query path |
//! | [`sanitize`] | Redaction and per-chunk length ceiling |
//! | [`chunk`] | Paragraph-boundary chunking |
//! | [`embedding`] | Embedding providers and capability check |
//! | [`generation`] | Text-generation provider for enhancements |
//! | [`store`] | Storage trait with SQLite and in-memory backends |
//! | [`search`] | Lexical and vector retrieval branches |
//! | [`fusion`] | Reciprocal rank fusion |
//! | [`context`] | Context builder |
//! | [`enhanced`] | Query expansion and re-ranking |
//! | [`cancel`] | Cancellation token |
//! | [`ingest`] | Filesystem ingestion |
//! | [`db`] / [`migrate`] | Connection pool and schema |

pub mod cancel;
pub mod chunk;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod enhanced;
pub mod error;
pub mod fusion;
pub mod generation;
pub mod http;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod sanitize;
pub mod search;
pub mod stats;
pub mod store;

pub use context::ContextBuilder;
pub use enhanced::{EnhancedConfig, EnhancedRag, EnhancedRagResult};
pub use error::{RagError, RagResult};
pub use models::ContextResult;
