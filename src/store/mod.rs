//! Storage abstraction for devctx.
//!
//! The [`Store`] trait defines every storage operation the ingestion and
//! retrieval paths need, so the pipeline runs unchanged against SQLite
//! ([`SqliteStore`]) or memory ([`InMemoryStore`]).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Ordering contract
//!
//! - [`keyword_search`](Store::keyword_search) returns hits by descending
//!   relevance, ties in insertion order.
//! - [`vector_search`](Store::vector_search) returns hits by descending
//!   cosine similarity, ties by chunk ID ascending.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, Document, SearchHit, StoreStats};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Identity of an already-archived document, used to skip unchanged input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocumentRef {
    pub id: String,
    pub content_hash: String,
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_document`](Store::upsert_document) | Insert or update a document |
/// | [`find_document_by_path`](Store::find_document_by_path) | Look up a document by source path |
/// | [`replace_chunks`](Store::replace_chunks) | Replace all chunks for a document |
/// | [`upsert_embedding`](Store::upsert_embedding) | Store an embedding vector for a chunk |
/// | [`get_document`](Store::get_document) | Retrieve a document by ID |
/// | [`keyword_search`](Store::keyword_search) | Full-text keyword search |
/// | [`vector_search`](Store::vector_search) | Cosine similarity vector search |
/// | [`embedding_dims`](Store::embedding_dims) | Distinct dimensionalities of stored vectors |
/// | [`stats`](Store::stats) | Row counts |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or update a document keyed by `(source, source_path)`.
    async fn upsert_document(&self, doc: &Document) -> Result<()>;

    async fn find_document_by_path(
        &self,
        source: &str,
        source_path: &str,
    ) -> Result<Option<StoredDocumentRef>>;

    /// Replace all chunks for a document, optionally storing one vector per chunk.
    async fn replace_chunks(
        &self,
        doc_id: &str,
        chunks: &[Chunk],
        vectors: Option<&[Vec<f32>]>,
    ) -> Result<()>;

    async fn upsert_embedding(
        &self,
        chunk: &Chunk,
        vector: &[f32],
        model: &str,
    ) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Full-text search. Callers pass raw user text; implementations must
    /// tolerate any string and return an empty vec when nothing matches.
    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;

    /// Brute-force cosine similarity over every stored vector whose
    /// dimensionality equals `query_vec.len()`. Vectors of other sizes are
    /// never scored.
    async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<SearchHit>>;

    /// Distinct dimensionalities of stored vectors, ascending. Empty when
    /// no vectors are stored; more than one entry after a model change.
    async fn embedding_dims(&self) -> Result<Vec<usize>>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// Split raw query text into lowercase alphanumeric terms.
///
/// Shared by both store implementations so keyword behavior matches.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_terms_strips_syntax() {
        assert_eq!(
            query_terms("\"rust\" AND (cargo* OR -crates)"),
            vec!["rust", "and", "cargo", "or", "crates"]
        );
    }

    #[test]
    fn test_query_terms_dedupes_case_insensitively() {
        assert_eq!(query_terms("SQLite sqlite FTS5"), vec!["sqlite", "fts5"]);
    }

    #[test]
    fn test_query_terms_empty_and_symbols() {
        assert!(query_terms("").is_empty());
        assert!(query_terms("   ").is_empty());
        assert!(query_terms("*** ::: \"\"").is_empty());
    }
}
