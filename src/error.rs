//! Error taxonomy for the retrieval and context pipeline.
//!
//! Plumbing code (config loading, ingestion, store implementations) uses
//! `anyhow`. The query path surfaces [`RagError`] so callers can tell a
//! degraded branch from a hard failure.

use thiserror::Error;

/// Errors produced by the retrieval, context, and enhancement layers.
#[derive(Debug, Error)]
pub enum RagError {
    /// No embedding provider is configured, the provider failed, or the
    /// query vector does not match the stored dimensionality.
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// A retrieval branch exceeded its deadline.
    #[error("{branch} search timed out after {timeout_ms} ms")]
    SearchTimeout { branch: &'static str, timeout_ms: u64 },

    /// The text-generation capability is missing or returned an error.
    #[error("generation unavailable: {0}")]
    GenerationUnavailable(String),

    /// A text-generation call exceeded its deadline.
    #[error("generation timed out after {timeout_ms} ms")]
    GenerationTimeout { timeout_ms: u64 },

    /// The request cannot be processed as given.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// Every retrieval branch failed; there is nothing to build context from.
    #[error("all retrieval sources failed: {0}")]
    AllSourcesFailed(String),

    /// The storage layer returned an error.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type RagResult<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_branch() {
        let err = RagError::SearchTimeout {
            branch: "lexical",
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "lexical search timed out after 250 ms");
    }
}
