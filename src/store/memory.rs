//! In-memory [`Store`] implementation for tests and ephemeral indexes.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Keyword search
//! scores chunks by term frequency over [`query_terms`]; vector search is
//! brute-force cosine similarity.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{Chunk, Document, SearchHit, SearchMethod, StoreStats};

use super::{query_terms, Store, StoredDocumentRef};

struct StoredVector {
    chunk_id: String,
    document_id: String,
    vector: Vec<f32>,
}

/// In-memory store. Chunks keep insertion order, which breaks keyword ties.
#[derive(Default)]
pub struct InMemoryStore {
    docs: RwLock<HashMap<String, Document>>,
    chunks: RwLock<Vec<Chunk>>,
    vectors: RwLock<Vec<StoredVector>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn term_frequency(text: &str, terms: &[String]) -> usize {
    let tokens = query_terms_all(text);
    terms
        .iter()
        .map(|t| tokens.iter().filter(|tok| *tok == t).count())
        .sum()
}

/// Like [`query_terms`] but keeps duplicates, for counting.
fn query_terms_all(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

impl InMemoryStore {
    fn hit(
        &self,
        docs: &HashMap<String, Document>,
        chunk: &Chunk,
        score: f64,
        method: SearchMethod,
    ) -> SearchHit {
        let doc = docs.get(&chunk.document_id);
        SearchHit {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            chunk_index: chunk.chunk_index,
            source_path: doc.map(|d| d.source_path.clone()).unwrap_or_default(),
            title: doc.and_then(|d| d.title.clone()),
            text: chunk.text.clone(),
            score,
            method,
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        let mut docs = write(&self.docs)?;
        docs.retain(|_, d| {
            !(d.source == doc.source && d.source_path == doc.source_path && d.id != doc.id)
        });
        docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn find_document_by_path(
        &self,
        source: &str,
        source_path: &str,
    ) -> Result<Option<StoredDocumentRef>> {
        let docs = read(&self.docs)?;
        Ok(docs
            .values()
            .find(|d| d.source == source && d.source_path == source_path)
            .map(|d| StoredDocumentRef {
                id: d.id.clone(),
                content_hash: d.content_hash.clone(),
            }))
    }

    async fn replace_chunks(
        &self,
        doc_id: &str,
        chunks: &[Chunk],
        vectors: Option<&[Vec<f32>]>,
    ) -> Result<()> {
        {
            let mut stored = write(&self.chunks)?;
            stored.retain(|c| c.document_id != doc_id);
            stored.extend(chunks.iter().cloned());
        }
        let mut stored_vecs = write(&self.vectors)?;
        stored_vecs.retain(|sv| sv.document_id != doc_id);
        if let Some(vecs) = vectors {
            for (c, v) in chunks.iter().zip(vecs.iter()) {
                stored_vecs.push(StoredVector {
                    chunk_id: c.id.clone(),
                    document_id: doc_id.to_string(),
                    vector: v.clone(),
                });
            }
        }
        Ok(())
    }

    async fn upsert_embedding(&self, chunk: &Chunk, vector: &[f32], _model: &str) -> Result<()> {
        let mut vecs = write(&self.vectors)?;
        vecs.retain(|sv| sv.chunk_id != chunk.id);
        vecs.push(StoredVector {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            vector: vector.to_vec(),
        });
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(read(&self.docs)?.get(id).cloned())
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let terms = query_terms(query);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let docs = read(&self.docs)?;
        let chunks = read(&self.chunks)?;
        let mut hits: Vec<SearchHit> = chunks
            .iter()
            .filter_map(|c| {
                let tf = term_frequency(&c.text, &terms);
                (tf > 0).then(|| self.hit(&docs, c, tf as f64, SearchMethod::Lexical))
            })
            .collect();
        // Stable sort keeps insertion order among equal scores.
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<SearchHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let docs = read(&self.docs)?;
        let chunks = read(&self.chunks)?;
        let vecs = read(&self.vectors)?;
        let by_id: HashMap<&str, &Chunk> = chunks.iter().map(|c| (c.id.as_str(), c)).collect();

        let mut hits: Vec<SearchHit> = vecs
            .iter()
            .filter(|sv| sv.vector.len() == query_vec.len())
            .filter_map(|sv| {
                let chunk = by_id.get(sv.chunk_id.as_str())?;
                let sim = cosine_similarity(query_vec, &sv.vector) as f64;
                Some(self.hit(&docs, chunk, sim, SearchMethod::Vector))
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn embedding_dims(&self) -> Result<Vec<usize>> {
        let mut dims: Vec<usize> = read(&self.vectors)?.iter().map(|sv| sv.vector.len()).collect();
        dims.sort_unstable();
        dims.dedup();
        Ok(dims)
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            documents: read(&self.docs)?.len() as i64,
            chunks: read(&self.chunks)?.len() as i64,
            vectors: read(&self.vectors)?.len() as i64,
        })
    }
}
