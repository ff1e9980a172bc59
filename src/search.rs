//! Lexical and vector retrieval branches.
//!
//! Both branches return [`SearchHit`]s in the store's ordering contract and
//! never see each other's results; [`fusion`](crate::fusion) combines them.
//! [`run_search`] backs the `devctx search` command.

use anyhow::{bail, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::db;
use crate::embedding::EmbeddingCapability;
use crate::error::{RagError, RagResult};
use crate::fusion;
use crate::models::SearchHit;
use crate::sanitize::Sanitizer;
use crate::store::{SqliteStore, Store};

/// Full-text search over chunk text.
///
/// Any string is accepted; it is reduced to quoted terms before reaching
/// the index. No terms, no matches, or `limit == 0` yield an empty vec.
pub async fn search_lexical(
    store: &dyn Store,
    query: &str,
    limit: usize,
) -> RagResult<Vec<SearchHit>> {
    if limit == 0 || query.trim().is_empty() {
        return Ok(Vec::new());
    }
    let hits = store.keyword_search(query, limit).await?;
    tracing::debug!(hits = hits.len(), "lexical search complete");
    Ok(hits)
}

/// Cosine-similarity search against stored chunk vectors.
///
/// Only vectors with the query's dimensionality are scored. Fails with
/// [`RagError::EmbeddingUnavailable`] for an empty query vector or when no
/// stored vector has the query's dimensionality.
pub async fn search_vector(
    store: &dyn Store,
    query_embedding: &[f32],
    limit: usize,
) -> RagResult<Vec<SearchHit>> {
    if query_embedding.is_empty() {
        return Err(RagError::EmbeddingUnavailable(
            "query embedding is empty".to_string(),
        ));
    }
    let dims = store.embedding_dims().await?;
    if dims.is_empty() {
        return Ok(Vec::new());
    }
    if !dims.contains(&query_embedding.len()) {
        return Err(RagError::EmbeddingUnavailable(format!(
            "query embedding has {} dims, stored vectors have {:?}",
            query_embedding.len(),
            dims
        )));
    }
    if dims.len() > 1 {
        tracing::warn!(
            ?dims,
            query_dims = query_embedding.len(),
            "stored vectors have mixed dimensions; re-ingest to refresh stale embeddings"
        );
    }
    if limit == 0 {
        return Ok(Vec::new());
    }
    let hits = store.vector_search(query_embedding, limit).await?;
    tracing::debug!(hits = hits.len(), "vector search complete");
    Ok(hits)
}

/// Run a branch under a deadline, mapping expiry to [`RagError::SearchTimeout`].
pub async fn with_deadline<T, F>(branch: &'static str, timeout: Duration, fut: F) -> RagResult<T>
where
    F: Future<Output = RagResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(RagError::SearchTimeout {
            branch,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// CLI entry point for `devctx search`.
pub async fn run_search(config: &Config, query: &str, mode: &str, limit: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    match mode {
        "lexical" | "vector" | "hybrid" => {}
        _ => bail!(
            "Unknown search mode: {}. Use lexical, vector, or hybrid.",
            mode
        ),
    }

    let capability = EmbeddingCapability::from_config(&config.embedding);
    if mode == "vector" && !capability.is_available() {
        bail!("Mode 'vector' requires embeddings. Set [embedding] provider in config.");
    }

    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool));
    let retrieval = &config.retrieval;
    let final_limit = limit.unwrap_or(retrieval.final_limit);
    let timeout = retrieval.search_timeout();

    let lexical = if mode == "vector" {
        Vec::new()
    } else {
        with_deadline(
            "lexical",
            timeout,
            search_lexical(store.as_ref(), query, retrieval.candidate_k_lexical),
        )
        .await?
    };

    let vector = if mode == "lexical" || !capability.is_available() {
        Vec::new()
    } else {
        let embedding = capability.embed_query(query).await?;
        with_deadline(
            "vector",
            timeout,
            search_vector(store.as_ref(), &embedding, retrieval.candidate_k_vector),
        )
        .await?
    };

    let mut hits = match mode {
        "lexical" => lexical,
        "vector" => vector,
        _ => fusion::fuse(&lexical, &vector, retrieval.rrf_k, final_limit),
    };
    hits.truncate(final_limit);

    if hits.is_empty() {
        println!("No results.");
        store.pool().close().await;
        return Ok(());
    }

    let sanitizer = Sanitizer::new(240);
    for (i, hit) in hits.iter().enumerate() {
        let title = hit.title.as_deref().unwrap_or("(untitled)");
        let excerpt = sanitizer.sanitize(&hit.text);
        println!("{}. [{:.4}] {} ({})", i + 1, hit.score, title, hit.method);
        println!("    path: {}#{}", hit.source_path, hit.chunk_index);
        println!("    excerpt: \"{}\"", excerpt.text.replace('\n', " ").trim());
        println!("    chunk: {}", hit.chunk_id);
        println!();
    }

    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::content_hash;
    use crate::models::{Chunk, Document};
    use crate::store::InMemoryStore;

    async fn store_with_vectors() -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .upsert_document(&Document {
                id: "d1".into(),
                source: "filesystem".into(),
                source_path: "notes.md".into(),
                title: None,
                body: String::new(),
                created_at: 0,
                content_hash: content_hash(""),
            })
            .await
            .unwrap();
        let chunks = vec![
            Chunk {
                id: "a".into(),
                document_id: "d1".into(),
                chunk_index: 0,
                text: "tokio runtime".into(),
                hash: content_hash("tokio runtime"),
            },
            Chunk {
                id: "b".into(),
                document_id: "d1".into(),
                chunk_index: 1,
                text: "sqlite wal".into(),
                hash: content_hash("sqlite wal"),
            },
        ];
        store
            .replace_chunks("d1", &chunks, Some(&[vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_lexical_zero_limit_is_empty() {
        let store = store_with_vectors().await;
        assert!(search_lexical(&store, "tokio", 0).await.unwrap().is_empty());
        assert_eq!(search_lexical(&store, "tokio", 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lexical_tolerates_fts_syntax() {
        let store = store_with_vectors().await;
        let hits = search_lexical(&store, "\"sqlite* AND (", 5).await.unwrap();
        assert_eq!(hits[0].chunk_id, "b");
    }

    #[tokio::test]
    async fn test_vector_rejects_empty_embedding() {
        let store = store_with_vectors().await;
        let err = search_vector(&store, &[], 5).await.unwrap_err();
        assert!(matches!(err, RagError::EmbeddingUnavailable(_)));
    }

    #[tokio::test]
    async fn test_vector_rejects_dimension_mismatch() {
        let store = store_with_vectors().await;
        let err = search_vector(&store, &[1.0, 0.0], 5).await.unwrap_err();
        assert!(matches!(err, RagError::EmbeddingUnavailable(_)));
    }

    #[tokio::test]
    async fn test_vector_uses_matching_dims_when_mixed() {
        let store = store_with_vectors().await;
        let stale = Chunk {
            id: "b".into(),
            document_id: "d1".into(),
            chunk_index: 1,
            text: "sqlite wal".into(),
            hash: content_hash("sqlite wal"),
        };
        store.upsert_embedding(&stale, &[0.0, 1.0], "new-model").await.unwrap();

        let hits = search_vector(&store, &[0.0, 1.0], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "b");

        let hits = search_vector(&store, &[1.0, 0.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "a");
    }

    #[tokio::test]
    async fn test_vector_empty_table_is_empty() {
        let store = InMemoryStore::new();
        assert!(search_vector(&store, &[1.0], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vector_orders_by_similarity() {
        let store = store_with_vectors().await;
        let hits = search_vector(&store, &[0.1, 0.9, 0.0], 5).await.unwrap();
        assert_eq!(hits[0].chunk_id, "b");
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_deadline_maps_to_search_timeout() {
        let res: RagResult<()> = with_deadline("lexical", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(matches!(
            res,
            Err(RagError::SearchTimeout {
                branch: "lexical",
                timeout_ms: 10
            })
        ));
    }
}
