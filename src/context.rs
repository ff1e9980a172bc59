//! Context assembly: the hybrid retrieval pipeline end to end.
//!
//! ```text
//! query ─┬─ lexical branch ──┐
//!        └─ vector branch ───┴─ RRF fuse ─ dedupe ─ sanitize ─ char budget ─ ContextResult
//! ```
//!
//! Both branches run concurrently under `search_timeout`. The vector branch
//! is skipped, not failed, when no embedding provider is usable. A request
//! only fails outright when no branch succeeded and at least one failed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::config::{Config, RetrievalConfig};
use crate::db;
use crate::embedding::EmbeddingCapability;
use crate::error::{RagError, RagResult};
use crate::fusion;
use crate::models::{
    BranchStatus, ContextChunk, ContextResult, Provenance, RetrievalReport, SearchHit,
    CHARS_PER_TOKEN,
};
use crate::sanitize::Sanitizer;
use crate::search::{search_lexical, search_vector, with_deadline};
use crate::store::{SqliteStore, Store};

/// Retrieval knobs the builder reads on every request.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub rrf_k: f64,
    pub candidate_k_lexical: usize,
    pub candidate_k_vector: usize,
    pub search_timeout: Duration,
    pub max_query_chars: usize,
}

impl From<&RetrievalConfig> for ContextSettings {
    fn from(r: &RetrievalConfig) -> Self {
        Self {
            rrf_k: r.rrf_k,
            candidate_k_lexical: r.candidate_k_lexical,
            candidate_k_vector: r.candidate_k_vector,
            search_timeout: r.search_timeout(),
            max_query_chars: r.max_query_chars,
        }
    }
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

/// Builds bounded, sanitized context for a query.
///
/// Cheap to clone; every service is shared behind an `Arc` or is `Copy`.
#[derive(Clone)]
pub struct ContextBuilder {
    store: Arc<dyn Store>,
    embedding: EmbeddingCapability,
    sanitizer: Sanitizer,
    settings: ContextSettings,
}

impl ContextBuilder {
    pub fn new(
        store: Arc<dyn Store>,
        embedding: EmbeddingCapability,
        sanitizer: Sanitizer,
        settings: ContextSettings,
    ) -> Self {
        Self {
            store,
            embedding,
            sanitizer,
            settings,
        }
    }

    /// Wire a builder from loaded configuration.
    pub fn from_config(config: &Config, store: Arc<dyn Store>) -> Self {
        Self::new(
            store,
            EmbeddingCapability::from_config(&config.embedding),
            Sanitizer::new(config.sanitizer.max_chunk_chars),
            ContextSettings::from(&config.retrieval),
        )
    }

    pub async fn build_context(
        &self,
        query: &str,
        limit: usize,
        char_budget: usize,
    ) -> RagResult<ContextResult> {
        self.validate(query, limit)?;
        if query.trim().is_empty() {
            return Ok(ContextResult::empty(query));
        }
        self.build_inner(query, limit, char_budget).await
    }

    /// Like [`build_context`](Self::build_context), but abandons the request
    /// with [`RagError::Cancelled`] once `cancel` fires. No partial result
    /// is ever returned.
    pub async fn build_context_with_cancel(
        &self,
        query: &str,
        limit: usize,
        char_budget: usize,
        cancel: &CancelToken,
    ) -> RagResult<ContextResult> {
        if cancel.is_cancelled() {
            return Err(RagError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("context build cancelled");
                Err(RagError::Cancelled)
            }
            res = self.build_context(query, limit, char_budget) => res,
        }
    }

    fn validate(&self, query: &str, limit: usize) -> RagResult<()> {
        if limit == 0 {
            return Err(RagError::InvalidInput("limit must be at least 1".to_string()));
        }
        if query.chars().any(|c| c.is_control() && !c.is_whitespace()) {
            return Err(RagError::InvalidInput(
                "query contains control characters".to_string(),
            ));
        }
        let len = query.chars().count();
        if len > self.settings.max_query_chars {
            return Err(RagError::InvalidInput(format!(
                "query is {} chars, maximum is {}",
                len, self.settings.max_query_chars
            )));
        }
        Ok(())
    }

    async fn build_inner(
        &self,
        query: &str,
        limit: usize,
        char_budget: usize,
    ) -> RagResult<ContextResult> {
        let timeout = self.settings.search_timeout;
        let lexical = with_deadline(
            "lexical",
            timeout,
            search_lexical(self.store.as_ref(), query, self.settings.candidate_k_lexical),
        );
        let (lexical, vector) = tokio::join!(lexical, self.vector_branch(query));

        let (lexical_hits, lexical_status) = match lexical {
            Ok(hits) => {
                let n = hits.len();
                (hits, BranchStatus::Ok { hits: n })
            }
            Err(e) => {
                tracing::warn!(error = %e, "lexical branch failed");
                (
                    Vec::new(),
                    BranchStatus::Failed {
                        error: e.to_string(),
                    },
                )
            }
        };
        let (vector_hits, vector_status) = vector;

        let any_ok = lexical_status.is_ok() || vector_status.is_ok();
        let any_failed = matches!(lexical_status, BranchStatus::Failed { .. })
            || matches!(vector_status, BranchStatus::Failed { .. });
        if !any_ok && any_failed {
            return Err(RagError::AllSourcesFailed(format!(
                "lexical: {:?}; vector: {:?}",
                lexical_status, vector_status
            )));
        }

        let fused = fusion::fuse(&lexical_hits, &vector_hits, self.settings.rrf_k, limit);
        let report = RetrievalReport {
            lexical: lexical_status,
            vector: vector_status,
            fused_candidates: fused.len(),
        };

        let candidates = self.sanitize_hits(dedupe(fused));
        let result = assemble(query, candidates, char_budget, report);
        tracing::debug!(
            chunks = result.chunks.len(),
            total_chars = result.total_chars,
            truncated = result.truncated,
            redactions = result.redactions,
            "context built"
        );
        Ok(result)
    }

    async fn vector_branch(&self, query: &str) -> (Vec<SearchHit>, BranchStatus) {
        if let EmbeddingCapability::Unavailable { reason } = &self.embedding {
            return (
                Vec::new(),
                BranchStatus::Skipped {
                    reason: reason.clone(),
                },
            );
        }

        let search = async {
            let embedding = self.embedding.embed_query(query).await?;
            search_vector(
                self.store.as_ref(),
                &embedding,
                self.settings.candidate_k_vector,
            )
            .await
        };

        match with_deadline("vector", self.settings.search_timeout, search).await {
            Ok(hits) => {
                let n = hits.len();
                (hits, BranchStatus::Ok { hits: n })
            }
            Err(RagError::EmbeddingUnavailable(reason)) => {
                tracing::warn!(%reason, "vector branch skipped");
                (Vec::new(), BranchStatus::Skipped { reason })
            }
            Err(e) => {
                tracing::warn!(error = %e, "vector branch failed");
                (
                    Vec::new(),
                    BranchStatus::Failed {
                        error: e.to_string(),
                    },
                )
            }
        }
    }

    fn sanitize_hits(&self, hits: Vec<SearchHit>) -> Vec<ContextChunk> {
        hits.iter()
            .map(|hit| {
                let clean = self.sanitizer.sanitize(&hit.text);
                ContextChunk {
                    text: clean.text,
                    provenance: Provenance::from_hit(hit),
                    rank: 0,
                    redactions: clean.redactions,
                    sanitizer_truncated: clean.truncated,
                }
            })
            .collect()
    }
}

/// Keep the first occurrence of every chunk id.
fn dedupe(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|h| seen.insert(h.chunk_id.clone()))
        .collect()
}

/// Greedily pack already-sanitized chunks into `char_budget` and number them.
///
/// Stops at the first chunk that would overflow the budget and marks the
/// result truncated. Chunks are not sanitized again here.
pub(crate) fn assemble(
    query: &str,
    candidates: Vec<ContextChunk>,
    char_budget: usize,
    report: RetrievalReport,
) -> ContextResult {
    let mut chunks = Vec::with_capacity(candidates.len());
    let mut total_chars = 0;
    let mut truncated = false;

    for mut chunk in candidates {
        let len = chunk.char_len();
        if total_chars + len > char_budget {
            truncated = true;
            break;
        }
        total_chars += len;
        chunk.rank = chunks.len() + 1;
        chunks.push(chunk);
    }

    let redactions = chunks.iter().map(|c| c.redactions).sum();
    ContextResult {
        query: query.to_string(),
        chunks,
        total_chars,
        estimated_tokens: total_chars / CHARS_PER_TOKEN,
        truncated,
        redactions,
        report,
    }
}

/// Print a context result as JSON or as a prompt block with a summary line.
pub(crate) fn print_context(result: &ContextResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    if result.is_empty() {
        println!("No context.");
        return Ok(());
    }
    print!("{}", result.to_prompt());
    println!(
        "-- {} chunks, {} chars (~{} tokens), {} redactions{}",
        result.chunks.len(),
        result.total_chars,
        result.estimated_tokens,
        result.redactions,
        if result.truncated { ", truncated" } else { "" }
    );
    Ok(())
}

/// Cancel `token` on Ctrl-C.
pub(crate) fn cancel_on_ctrl_c(token: &CancelToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}

/// CLI entry point for `devctx context`.
pub async fn run_context(
    config: &Config,
    query: &str,
    limit: Option<usize>,
    budget: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::new(db::connect(config).await?));
    let builder = ContextBuilder::from_config(config, store.clone());

    let cancel = CancelToken::new();
    cancel_on_ctrl_c(&cancel);
    let result = builder
        .build_context_with_cancel(
            query,
            limit.unwrap_or(config.retrieval.final_limit),
            budget.unwrap_or(config.retrieval.char_budget),
            &cancel,
        )
        .await?;

    print_context(&result, json)?;
    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::content_hash;
    use crate::embedding::Embedder;
    use crate::models::{Chunk, Document, StoreStats};
    use crate::store::{InMemoryStore, StoredDocumentRef};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    /// Returns the same vector for every input.
    struct StaticEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for StaticEmbedder {
        fn model_name(&self) -> &str {
            "static"
        }
        fn dims(&self) -> usize {
            self.0.len()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| self.0.clone()).collect())
        }
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        fn model_name(&self) -> &str {
            "broken"
        }
        fn dims(&self) -> usize {
            3
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(anyhow!("connection refused"))
        }
    }

    /// Wraps an in-memory store with injectable failures and latency.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryStore,
        fail_keyword: bool,
        fail_vector: bool,
        delay: Option<Duration>,
        vector_delay: Option<Duration>,
    }

    impl FlakyStore {
        async fn pause(&self) {
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn upsert_document(&self, doc: &Document) -> Result<()> {
            self.inner.upsert_document(doc).await
        }
        async fn find_document_by_path(
            &self,
            source: &str,
            source_path: &str,
        ) -> Result<Option<StoredDocumentRef>> {
            self.inner.find_document_by_path(source, source_path).await
        }
        async fn replace_chunks(
            &self,
            doc_id: &str,
            chunks: &[Chunk],
            vectors: Option<&[Vec<f32>]>,
        ) -> Result<()> {
            self.inner.replace_chunks(doc_id, chunks, vectors).await
        }
        async fn upsert_embedding(&self, chunk: &Chunk, vector: &[f32], model: &str) -> Result<()> {
            self.inner.upsert_embedding(chunk, vector, model).await
        }
        async fn get_document(&self, id: &str) -> Result<Option<Document>> {
            self.inner.get_document(id).await
        }
        async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
            self.pause().await;
            if self.fail_keyword {
                return Err(anyhow!("fts index corrupted"));
            }
            self.inner.keyword_search(query, limit).await
        }
        async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<SearchHit>> {
            self.pause().await;
            if let Some(d) = self.vector_delay {
                tokio::time::sleep(d).await;
            }
            if self.fail_vector {
                return Err(anyhow!("vector table locked"));
            }
            self.inner.vector_search(query_vec, limit).await
        }
        async fn embedding_dims(&self) -> Result<Vec<usize>> {
            self.inner.embedding_dims().await
        }
        async fn stats(&self) -> Result<StoreStats> {
            self.inner.stats().await
        }
    }

    const TEXTS: [&str; 4] = [
        "SQLite runs in WAL mode so readers never block the writer.",
        "The tokio runtime drives every retrieval branch concurrently.",
        "Reciprocal rank fusion merges lexical and vector rankings for sqlite search.",
        "Escalations go to ops@example.com, card 4111 1111 1111 1111, Authorization: Bearer abc123def456",
    ];

    async fn seed(store: &dyn Store) {
        store
            .upsert_document(&Document {
                id: "d1".into(),
                source: "filesystem".into(),
                source_path: "notes/arch.md".into(),
                title: Some("Architecture".into()),
                body: TEXTS.join("\n\n"),
                created_at: 0,
                content_hash: content_hash(&TEXTS.join("\n\n")),
            })
            .await
            .unwrap();
        let chunks: Vec<Chunk> = TEXTS
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk {
                id: format!("c{i}"),
                document_id: "d1".into(),
                chunk_index: i as i64,
                text: t.to_string(),
                hash: content_hash(t),
            })
            .collect();
        let vectors = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.7, 0.0, 0.7],
            vec![0.0, 0.0, 1.0],
        ];
        store.replace_chunks("d1", &chunks, Some(&vectors)).await.unwrap();
    }

    async fn builder_with(store: Arc<dyn Store>, embedding: EmbeddingCapability) -> ContextBuilder {
        seed(store.as_ref()).await;
        ContextBuilder::new(store, embedding, Sanitizer::default(), ContextSettings::default())
    }

    async fn lexical_only() -> ContextBuilder {
        builder_with(
            Arc::new(InMemoryStore::new()),
            EmbeddingCapability::unavailable("disabled"),
        )
        .await
    }

    fn static_embedding() -> EmbeddingCapability {
        EmbeddingCapability::available(Arc::new(StaticEmbedder(vec![1.0, 0.0, 0.0])))
    }

    fn chunk_ids(result: &ContextResult) -> Vec<&str> {
        result
            .chunks
            .iter()
            .map(|c| c.provenance.chunk_id.as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_build_is_deterministic() {
        let builder = builder_with(Arc::new(InMemoryStore::new()), static_embedding()).await;
        let a = builder.build_context("sqlite fusion", 10, 10_000).await.unwrap();
        let b = builder.build_context("sqlite fusion", 10, 10_000).await.unwrap();
        assert_eq!(chunk_ids(&a), chunk_ids(&b));
        assert_eq!(a.total_chars, b.total_chars);
        assert!(!a.is_empty());
    }

    #[tokio::test]
    async fn test_hybrid_fuses_both_branches() {
        let builder = builder_with(Arc::new(InMemoryStore::new()), static_embedding()).await;
        let result = builder.build_context("sqlite", 10, 10_000).await.unwrap();
        assert!(result.report.lexical.is_ok());
        assert!(result.report.vector.is_ok());
        // c0 is first in both lists.
        assert_eq!(result.chunks[0].provenance.chunk_id, "c0");
        assert_eq!(result.chunks[0].rank, 1);
        let ranks: Vec<usize> = result.chunks.iter().map(|c| c.rank).collect();
        assert_eq!(ranks, (1..=result.chunks.len()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_budget_is_respected() {
        let builder = lexical_only().await;
        let full = builder.build_context("sqlite", 10, 10_000).await.unwrap();
        assert_eq!(full.chunks.len(), 2);
        assert!(!full.truncated);

        let first_len = full.chunks[0].char_len();
        let tight = builder.build_context("sqlite", 10, first_len + 1).await.unwrap();
        assert_eq!(tight.chunks.len(), 1);
        assert!(tight.truncated);
        assert!(tight.total_chars <= first_len + 1);
        assert_eq!(tight.estimated_tokens, tight.total_chars / CHARS_PER_TOKEN);
    }

    #[tokio::test]
    async fn test_chunks_are_sanitized() {
        let builder = lexical_only().await;
        let result = builder.build_context("escalations", 10, 10_000).await.unwrap();
        assert_eq!(result.chunks.len(), 1);
        let chunk = &result.chunks[0];
        assert!(!chunk.text.contains("ops@example.com"));
        assert!(!chunk.text.contains("4111 1111"));
        assert!(!chunk.text.contains("abc123def456"));
        assert!(chunk.redactions >= 3);
        assert_eq!(result.redactions, chunk.redactions);
    }

    #[tokio::test]
    async fn test_degrades_without_embedding_provider() {
        let builder = lexical_only().await;
        let result = builder.build_context("tokio runtime", 10, 10_000).await.unwrap();
        assert_eq!(chunk_ids(&result), vec!["c1"]);
        assert!(result.report.lexical.is_ok());
        assert!(matches!(result.report.vector, BranchStatus::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_embedding_failure_skips_vector_branch() {
        let builder = builder_with(
            Arc::new(InMemoryStore::new()),
            EmbeddingCapability::available(Arc::new(BrokenEmbedder)),
        )
        .await;
        let result = builder.build_context("tokio", 10, 10_000).await.unwrap();
        assert_eq!(chunk_ids(&result), vec!["c1"]);
        assert!(matches!(result.report.vector, BranchStatus::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_empty_index_and_empty_query() {
        let builder = ContextBuilder::new(
            Arc::new(InMemoryStore::new()),
            EmbeddingCapability::unavailable("disabled"),
            Sanitizer::default(),
            ContextSettings::default(),
        );
        let result = builder.build_context("anything", 10, 1_000).await.unwrap();
        assert!(result.is_empty());
        assert!(!result.truncated);

        let seeded = lexical_only().await;
        let blank = seeded.build_context("   \n", 10, 1_000).await.unwrap();
        assert!(blank.is_empty());
        assert!(!blank.truncated);
    }

    #[tokio::test]
    async fn test_invalid_input_rejected() {
        let builder = lexical_only().await;
        assert!(matches!(
            builder.build_context("sqlite", 0, 1_000).await,
            Err(RagError::InvalidInput(_))
        ));
        assert!(matches!(
            builder.build_context("sql\u{0}ite", 5, 1_000).await,
            Err(RagError::InvalidInput(_))
        ));
        let long = "a".repeat(ContextSettings::default().max_query_chars + 1);
        assert!(matches!(
            builder.build_context(&long, 5, 1_000).await,
            Err(RagError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_lexical_failure_falls_back_to_vector() {
        let store = Arc::new(FlakyStore {
            fail_keyword: true,
            ..Default::default()
        });
        let builder = builder_with(store, static_embedding()).await;
        let result = builder.build_context("sqlite", 10, 10_000).await.unwrap();
        assert!(matches!(result.report.lexical, BranchStatus::Failed { .. }));
        assert!(result.report.vector.is_ok());
        assert_eq!(result.chunks[0].provenance.chunk_id, "c0");
    }

    #[tokio::test]
    async fn test_all_sources_failed() {
        let store = Arc::new(FlakyStore {
            fail_keyword: true,
            fail_vector: true,
            ..Default::default()
        });
        let builder = builder_with(store, static_embedding()).await;
        let err = builder.build_context("sqlite", 10, 10_000).await.unwrap_err();
        assert!(matches!(err, RagError::AllSourcesFailed(_)));
    }

    #[tokio::test]
    async fn test_lexical_timeout_without_vector_fails() {
        let store = Arc::new(FlakyStore {
            delay: Some(Duration::from_millis(500)),
            ..Default::default()
        });
        seed(store.as_ref()).await;
        let settings = ContextSettings {
            search_timeout: Duration::from_millis(20),
            ..ContextSettings::default()
        };
        let builder = ContextBuilder::new(
            store,
            EmbeddingCapability::unavailable("disabled"),
            Sanitizer::default(),
            settings,
        );
        let err = builder.build_context("sqlite", 10, 10_000).await.unwrap_err();
        assert!(matches!(err, RagError::AllSourcesFailed(_)));
    }

    #[tokio::test]
    async fn test_vector_timeout_keeps_lexical_results() {
        let store = Arc::new(FlakyStore {
            vector_delay: Some(Duration::from_millis(500)),
            ..Default::default()
        });
        seed(store.as_ref()).await;
        let settings = ContextSettings {
            search_timeout: Duration::from_millis(50),
            ..ContextSettings::default()
        };
        let builder =
            ContextBuilder::new(store, static_embedding(), Sanitizer::default(), settings);
        let result = builder.build_context("tokio runtime", 10, 10_000).await.unwrap();
        assert_eq!(result.report.lexical, BranchStatus::Ok { hits: 1 });
        match &result.report.vector {
            BranchStatus::Failed { error } => assert!(error.contains("timed out")),
            other => panic!("expected failed vector branch, got {:?}", other),
        }
        assert_eq!(chunk_ids(&result), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_cancellation_returns_cancelled() {
        let store = Arc::new(FlakyStore {
            delay: Some(Duration::from_millis(500)),
            ..Default::default()
        });
        let builder = builder_with(store, EmbeddingCapability::unavailable("disabled")).await;
        let token = CancelToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = builder
            .build_context_with_cancel("sqlite", 10, 10_000, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Cancelled));

        let pre = CancelToken::new();
        pre.cancel();
        assert!(matches!(
            builder.build_context_with_cancel("sqlite", 10, 10_000, &pre).await,
            Err(RagError::Cancelled)
        ));
    }

    #[test]
    fn test_assemble_stops_at_first_overflow() {
        let chunk = |id: &str, text: &str| ContextChunk {
            text: text.to_string(),
            provenance: Provenance {
                document_id: "d".into(),
                chunk_id: id.into(),
                chunk_index: 0,
                source_path: "p".into(),
                title: None,
                score: 0.0,
            },
            rank: 0,
            redactions: 1,
            sanitizer_truncated: false,
        };
        let result = assemble(
            "q",
            vec![chunk("a", "12345"), chunk("b", "1234567890"), chunk("c", "1")],
            10,
            RetrievalReport::default(),
        );
        // "c" would fit but packing stops at the first overflow.
        assert_eq!(chunk_ids(&result), vec!["a"]);
        assert!(result.truncated);
        assert_eq!(result.total_chars, 5);
        assert_eq!(result.redactions, 1);
    }
}
