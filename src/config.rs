//! TOML configuration parsing and validation.
//!
//! Only `[db]` is required; every other section falls back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/devctx.sqlite"
//!
//! [retrieval]
//! rrf_k = 60.0
//! final_limit = 12
//! char_budget = 12000
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub sanitizer: SanitizerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub enhancement: EnhancementConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// RRF smoothing constant: each hit contributes `1 / (rrf_k + rank)`.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_lexical: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_vector: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_char_budget")]
    pub char_budget: usize,
    #[serde(default = "default_search_timeout_ms")]
    pub search_timeout_ms: u64,
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            candidate_k_lexical: default_candidate_k(),
            candidate_k_vector: default_candidate_k(),
            final_limit: default_final_limit(),
            char_budget: default_char_budget(),
            search_timeout_ms: default_search_timeout_ms(),
            max_query_chars: default_max_query_chars(),
        }
    }
}

impl RetrievalConfig {
    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }
}

fn default_rrf_k() -> f64 {
    60.0
}
fn default_candidate_k() -> usize {
    40
}
fn default_final_limit() -> usize {
    12
}
fn default_char_budget() -> usize {
    12_000
}
fn default_search_timeout_ms() -> u64 {
    3_000
}
fn default_max_query_chars() -> usize {
    4_096
}

#[derive(Debug, Deserialize, Clone)]
pub struct SanitizerConfig {
    /// Per-chunk length ceiling applied after redaction.
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: default_max_chunk_chars(),
        }
    }
}

fn default_max_chunk_chars() -> usize {
    4_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama, or an OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_output_tokens() -> u32 {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnhancementConfig {
    #[serde(default)]
    pub use_query_expansion: bool,
    #[serde(default)]
    pub use_reranking: bool,
    #[serde(default = "default_max_expansions")]
    pub max_expansions: usize,
    #[serde(default = "default_char_budget")]
    pub char_budget: usize,
    /// Deadline for each expansion or re-rank call.
    #[serde(default = "default_generation_timeout_ms")]
    pub generation_timeout_ms: u64,
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            use_query_expansion: false,
            use_reranking: false,
            max_expansions: default_max_expansions(),
            char_budget: default_char_budget(),
            generation_timeout_ms: default_generation_timeout_ms(),
        }
    }
}

fn default_max_expansions() -> usize {
    2
}
fn default_generation_timeout_ms() -> u64 {
    15_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }

    let r = &config.retrieval;
    if r.final_limit < 1 {
        bail!("retrieval.final_limit must be >= 1");
    }
    if r.rrf_k.is_nan() || r.rrf_k <= 0.0 {
        bail!("retrieval.rrf_k must be > 0");
    }
    if r.char_budget == 0 {
        bail!("retrieval.char_budget must be > 0");
    }
    if r.search_timeout_ms == 0 {
        bail!("retrieval.search_timeout_ms must be > 0");
    }
    if config.sanitizer.max_chunk_chars == 0 {
        bail!("sanitizer.max_chunk_chars must be > 0");
    }
    if config.enhancement.char_budget == 0 {
        bail!("enhancement.char_budget must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.generation.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.generation.is_enabled() && config.generation.model.is_none() {
        bail!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = parse_config("[db]\npath = \"./data/devctx.sqlite\"\n").unwrap();
        assert_eq!(cfg.retrieval.rrf_k, 60.0);
        assert_eq!(cfg.retrieval.final_limit, 12);
        assert_eq!(cfg.retrieval.search_timeout(), Duration::from_millis(3000));
        assert_eq!(cfg.sanitizer.max_chunk_chars, 4000);
        assert!(!cfg.embedding.is_enabled());
        assert!(!cfg.generation.is_enabled());
        assert!(!cfg.enhancement.use_query_expansion);
        assert_eq!(cfg.ingest.include_globs, vec!["**/*.md", "**/*.txt"]);
    }

    #[test]
    fn test_enabled_embedding_requires_dims() {
        let err = parse_config(
            "[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"openai\"\nmodel = \"m\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse_config("[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"gpu\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_generation_requires_model() {
        let err = parse_config("[db]\npath = \"x.sqlite\"\n[generation]\nprovider = \"openai\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("generation.model"));
    }

    #[test]
    fn test_zero_budget_rejected() {
        let err = parse_config("[db]\npath = \"x.sqlite\"\n[retrieval]\nchar_budget = 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("char_budget"));
    }

    #[test]
    fn test_negative_rrf_k_rejected() {
        let err =
            parse_config("[db]\npath = \"x.sqlite\"\n[retrieval]\nrrf_k = -1.0\n").unwrap_err();
        assert!(err.to_string().contains("rrf_k"));
    }
}
