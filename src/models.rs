//! Core data models used throughout devctx.
//!
//! [`Document`] and [`Chunk`] are persisted by the store. [`SearchHit`],
//! [`ContextChunk`], and [`ContextResult`] are built per query and never
//! written back.

use serde::Serialize;
use std::fmt;

/// Approximate chars-per-token ratio used for chunk sizing and token estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// A stored unit of knowledge (an ADR, paper, chat log, note).
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    /// Source type, e.g. `"filesystem"`.
    pub source: String,
    /// Path (or other locator) within the source.
    pub source_path: String,
    pub title: Option<String>,
    pub body: String,
    /// Unix seconds.
    pub created_at: i64,
    /// SHA-256 hex digest of `body`.
    pub content_hash: String,
}

/// A contiguous slice of a document's body.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// Which retrieval stage produced a [`SearchHit`] score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    /// Negated BM25 rank from the full-text index.
    Lexical,
    /// Cosine similarity against a stored embedding.
    Vector,
    /// Reciprocal-rank-fusion score.
    Fused,
}

impl fmt::Display for SearchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMethod::Lexical => write!(f, "lexical"),
            SearchMethod::Vector => write!(f, "vector"),
            SearchMethod::Fused => write!(f, "fused"),
        }
    }
}

/// A single retrieval result referencing one stored chunk.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub source_path: String,
    pub title: Option<String>,
    /// Full chunk text, unsanitized.
    pub text: String,
    pub score: f64,
    pub method: SearchMethod,
}

/// Where a piece of assembled context came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provenance {
    pub document_id: String,
    pub chunk_id: String,
    pub chunk_index: i64,
    pub source_path: String,
    pub title: Option<String>,
    /// The score that ranked this chunk (fused unless re-ranked).
    pub score: f64,
}

impl Provenance {
    pub fn from_hit(hit: &SearchHit) -> Self {
        Self {
            document_id: hit.document_id.clone(),
            chunk_id: hit.chunk_id.clone(),
            chunk_index: hit.chunk_index,
            source_path: hit.source_path.clone(),
            title: hit.title.clone(),
            score: hit.score,
        }
    }
}

/// A sanitized chunk ready for LLM consumption.
#[derive(Debug, Clone, Serialize)]
pub struct ContextChunk {
    pub text: String,
    pub provenance: Provenance,
    /// 1-based inclusion rank.
    pub rank: usize,
    pub redactions: usize,
    /// Whether the sanitizer cut this chunk at its per-chunk ceiling.
    pub sanitizer_truncated: bool,
}

impl ContextChunk {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Outcome of one retrieval branch for a single query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BranchStatus {
    Ok { hits: usize },
    Skipped { reason: String },
    Failed { error: String },
}

impl BranchStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, BranchStatus::Ok { .. })
    }
}

/// How each retrieval branch fared while building a context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalReport {
    pub lexical: BranchStatus,
    pub vector: BranchStatus,
    /// Number of fused candidates before dedupe and budgeting.
    pub fused_candidates: usize,
}

impl Default for RetrievalReport {
    fn default() -> Self {
        Self {
            lexical: BranchStatus::Skipped {
                reason: "not run".to_string(),
            },
            vector: BranchStatus::Skipped {
                reason: "not run".to_string(),
            },
            fused_candidates: 0,
        }
    }
}

/// The assembled, size-bounded context for one query.
#[derive(Debug, Clone, Serialize)]
pub struct ContextResult {
    pub query: String,
    pub chunks: Vec<ContextChunk>,
    pub total_chars: usize,
    pub estimated_tokens: usize,
    /// Set when at least one candidate was dropped to respect the char budget.
    pub truncated: bool,
    pub redactions: usize,
    pub report: RetrievalReport,
}

impl ContextResult {
    pub fn empty(query: &str) -> Self {
        Self {
            query: query.to_string(),
            chunks: Vec::new(),
            total_chars: 0,
            estimated_tokens: 0,
            truncated: false,
            redactions: 0,
            report: RetrievalReport::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Render the chunks as a provenance-tagged block for an LLM prompt.
    pub fn to_prompt(&self) -> String {
        let mut out = String::new();
        for chunk in &self.chunks {
            let p = &chunk.provenance;
            let title = p.title.as_deref().unwrap_or(&p.source_path);
            out.push_str(&format!(
                "[{}] {} ({}#{})\n{}\n\n",
                chunk.rank, title, p.source_path, p.chunk_index, chunk.text
            ));
        }
        if self.truncated {
            out.push_str("[context truncated to fit budget]\n");
        }
        out
    }
}

/// Row counts for the `stats` command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub documents: i64,
    pub chunks: i64,
    pub vectors: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(rank: usize, text: &str) -> ContextChunk {
        ContextChunk {
            text: text.to_string(),
            provenance: Provenance {
                document_id: "d1".into(),
                chunk_id: format!("c{rank}"),
                chunk_index: 0,
                source_path: "notes/adr-001.md".into(),
                title: Some("ADR 001".into()),
                score: 0.03,
            },
            rank,
            redactions: 0,
            sanitizer_truncated: false,
        }
    }

    #[test]
    fn test_prompt_includes_provenance() {
        let mut result = ContextResult::empty("why sqlite");
        result.chunks.push(chunk(1, "We chose SQLite."));
        let prompt = result.to_prompt();
        assert!(prompt.starts_with("[1] ADR 001 (notes/adr-001.md#0)"));
        assert!(prompt.contains("We chose SQLite."));
        assert!(!prompt.contains("truncated"));
    }

    #[test]
    fn test_prompt_marks_truncation() {
        let mut result = ContextResult::empty("q");
        result.truncated = true;
        assert!(result.to_prompt().contains("[context truncated to fit budget]"));
    }

    #[test]
    fn test_char_len_counts_chars_not_bytes() {
        assert_eq!(chunk(1, "héllo").char_len(), 5);
    }
}
