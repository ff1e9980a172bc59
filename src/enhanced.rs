//! Enhanced RAG: query expansion and LLM re-ranking on top of
//! [`ContextBuilder`].
//!
//! Every enhancement is optional and best-effort. When the generator is
//! missing, slow, or answers with something unparseable, the step is
//! skipped, a WARN is logged, and the reason lands in
//! [`EnhancedRagResult::degradations`]. Only a failure to build context for
//! the original query is fatal.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use serde::Serialize;

use crate::config::{Config, EnhancementConfig};
use crate::context::{assemble, print_context, ContextBuilder};
use crate::db;
use crate::error::{RagError, RagResult};
use crate::generation::{GenerateOptions, GenerationCapability};
use crate::models::{ContextChunk, ContextResult};
use crate::store::{SqliteStore, Store};

/// Longest passage excerpt shown to the re-ranker.
const RERANK_EXCERPT_CHARS: usize = 600;

/// Per-request enhancement switches.
#[derive(Debug, Clone)]
pub struct EnhancedConfig {
    pub use_query_expansion: bool,
    pub use_reranking: bool,
    pub max_expansions: usize,
    pub char_budget: usize,
}

impl From<&EnhancementConfig> for EnhancedConfig {
    fn from(e: &EnhancementConfig) -> Self {
        Self {
            use_query_expansion: e.use_query_expansion,
            use_reranking: e.use_reranking,
            max_expansions: e.max_expansions,
            char_budget: e.char_budget,
        }
    }
}

impl Default for EnhancedConfig {
    fn default() -> Self {
        Self::from(&EnhancementConfig::default())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnhancedRagResult {
    pub query: String,
    /// Expansions that were generated, whether or not they produced context.
    pub expanded_queries: Vec<String>,
    pub context: ContextResult,
    /// Whether the re-ranker's order was applied.
    pub reranked: bool,
    /// One entry per enhancement step that was skipped or failed.
    pub degradations: Vec<String>,
}

/// Orchestrates expansion, multi-query retrieval, and re-ranking.
pub struct EnhancedRag {
    builder: ContextBuilder,
    generation: GenerationCapability,
    generation_timeout: Duration,
    options: GenerateOptions,
    limit: usize,
}

impl EnhancedRag {
    pub fn new(
        builder: ContextBuilder,
        generation: GenerationCapability,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            builder,
            generation,
            generation_timeout,
            options: GenerateOptions::default(),
            limit: 12,
        }
    }

    pub fn from_config(config: &Config, store: Arc<dyn Store>) -> Self {
        let mut rag = Self::new(
            ContextBuilder::from_config(config, store),
            GenerationCapability::from_config(&config.generation),
            Duration::from_millis(config.enhancement.generation_timeout_ms),
        );
        rag.options.temperature = config.generation.temperature;
        rag.options.max_tokens = config.generation.max_output_tokens;
        rag.limit = config.retrieval.final_limit;
        rag
    }

    pub async fn enhanced_context(
        &self,
        query: &str,
        config: &EnhancedConfig,
    ) -> RagResult<EnhancedRagResult> {
        let mut degradations = Vec::new();

        let original = self
            .builder
            .build_context(query, self.limit, config.char_budget)
            .await?;

        let mut expanded_queries = Vec::new();
        if config.use_query_expansion && config.max_expansions > 0 && !query.trim().is_empty() {
            match self.expand(query, config.max_expansions).await {
                Ok(queries) => expanded_queries = queries,
                Err(e) => degrade(&mut degradations, "query expansion", &e),
            }
        }

        let mut truncated = original.truncated;
        let mut seen = HashSet::new();
        let mut merged: Vec<ContextChunk> = Vec::new();
        let mut absorb = |ctx: ContextResult, merged: &mut Vec<ContextChunk>| {
            for chunk in ctx.chunks {
                if seen.insert(chunk.provenance.chunk_id.clone()) {
                    merged.push(chunk);
                }
            }
        };
        let report = original.report.clone();
        absorb(original, &mut merged);

        for expansion in &expanded_queries {
            match self
                .builder
                .build_context(expansion, self.limit, config.char_budget)
                .await
            {
                Ok(ctx) => {
                    truncated |= ctx.truncated;
                    absorb(ctx, &mut merged);
                }
                Err(e) => degrade(
                    &mut degradations,
                    &format!("expanded query {:?}", expansion),
                    &anyhow!(e),
                ),
            }
        }

        let mut reranked = false;
        if config.use_reranking && merged.len() > 1 {
            match self.rerank_order(query, &merged).await {
                Ok(order) => {
                    merged = apply_order(merged, &order);
                    reranked = true;
                }
                Err(e) => degrade(&mut degradations, "re-ranking", &e),
            }
        }

        let mut context = assemble(query, merged, config.char_budget, report);
        context.truncated |= truncated;

        tracing::debug!(
            expansions = expanded_queries.len(),
            chunks = context.chunks.len(),
            reranked,
            degradations = degradations.len(),
            "enhanced context built"
        );

        Ok(EnhancedRagResult {
            query: query.to_string(),
            expanded_queries,
            context,
            reranked,
            degradations,
        })
    }

    async fn generate(&self, prompt: &str) -> RagResult<String> {
        let generator = match &self.generation {
            GenerationCapability::Available(g) => g,
            GenerationCapability::Unavailable { reason } => {
                return Err(RagError::GenerationUnavailable(reason.clone()))
            }
        };
        match tokio::time::timeout(self.generation_timeout, generator.generate(prompt, &self.options))
            .await
        {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(RagError::GenerationUnavailable(e.to_string())),
            Err(_) => Err(RagError::GenerationTimeout {
                timeout_ms: self.generation_timeout.as_millis() as u64,
            }),
        }
    }

    async fn expand(&self, query: &str, max: usize) -> anyhow::Result<Vec<String>> {
        let prompt = format!(
            "Rewrite the search query below into up to {max} alternative phrasings that \
             would retrieve the same information. Reply with one query per line and nothing else.\n\n\
             Query: {query}"
        );
        let response = self.generate(&prompt).await?;
        let queries = parse_expansions(&response, query, max);
        if queries.is_empty() {
            bail!("generator returned no usable expansions");
        }
        Ok(queries)
    }

    async fn rerank_order(&self, query: &str, passages: &[ContextChunk]) -> anyhow::Result<Vec<usize>> {
        let mut prompt = format!(
            "Rank the passages below by relevance to the query. Reply with only a JSON array \
             of passage numbers, most relevant first.\n\nQuery: {query}\n"
        );
        for (i, chunk) in passages.iter().enumerate() {
            let excerpt: String = chunk.text.chars().take(RERANK_EXCERPT_CHARS).collect();
            prompt.push_str(&format!("\n[{i}] {excerpt}\n"));
        }
        let response = self.generate(&prompt).await?;
        parse_rerank(&response, passages.len())
    }
}

fn degrade(degradations: &mut Vec<String>, step: &str, err: &anyhow::Error) {
    tracing::warn!(step, error = %err, "enhancement degraded");
    degradations.push(format!("{step}: {err}"));
}

/// Strip a leading bullet or `1.` / `1)` numbering and surrounding quotes.
fn strip_list_marker(line: &str) -> &str {
    let line = line
        .trim()
        .trim_start_matches(['-', '*', '•'])
        .trim_start();
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    let line = if digits > 0 {
        let rest = &line[digits..];
        rest.strip_prefix('.')
            .or_else(|| rest.strip_prefix(')'))
            .unwrap_or(line)
    } else {
        line
    };
    line.trim().trim_matches('"').trim()
}

/// One expansion per non-empty line, without duplicates or the original.
fn parse_expansions(response: &str, original: &str, max: usize) -> Vec<String> {
    let original = original.trim().to_lowercase();
    let mut seen = HashSet::new();
    response
        .lines()
        .map(strip_list_marker)
        .filter(|q| !q.is_empty())
        .filter(|q| q.to_lowercase() != original)
        .filter(|q| seen.insert(q.to_lowercase()))
        .take(max)
        .map(str::to_string)
        .collect()
}

/// Slice out the outermost JSON array or object from a chatty reply.
fn extract_json(response: &str) -> Option<&str> {
    let start = response.find(['[', '{'])?;
    let close = if response[start..].starts_with('[') { ']' } else { '}' };
    let end = response.rfind(close)?;
    (end > start).then(|| &response[start..=end])
}

fn indices_from(values: &[serde_json::Value], n: usize) -> anyhow::Result<Vec<usize>> {
    let mut order = Vec::with_capacity(values.len());
    for v in values {
        let idx = v
            .as_u64()
            .ok_or_else(|| anyhow!("non-integer passage number {}", v))? as usize;
        if idx >= n {
            bail!("passage number {} out of range (have {})", idx, n);
        }
        if !order.contains(&idx) {
            order.push(idx);
        }
    }
    if order.is_empty() {
        bail!("empty ranking");
    }
    Ok(order)
}

/// Parse a re-rank reply into a full permutation of `0..n`.
///
/// Accepts `[2, 0, 1]`, `{"order": [2, 0, 1]}`, or `{"scores": [0.1, 0.9, 0.5]}`.
/// Passages missing from a partial ranking follow in their prior order.
fn parse_rerank(response: &str, n: usize) -> anyhow::Result<Vec<usize>> {
    let json = extract_json(response).ok_or_else(|| anyhow!("malformed re-rank response"))?;
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| anyhow!("malformed re-rank response: {}", e))?;

    let mut order = if let Some(arr) = value.as_array() {
        indices_from(arr, n)?
    } else if let Some(arr) = value.get("order").and_then(|o| o.as_array()) {
        indices_from(arr, n)?
    } else if let Some(arr) = value.get("scores").and_then(|s| s.as_array()) {
        if arr.len() != n {
            bail!("expected {} scores, got {}", n, arr.len());
        }
        let scores = arr
            .iter()
            .map(|s| s.as_f64().ok_or_else(|| anyhow!("non-numeric score {}", s)))
            .collect::<anyhow::Result<Vec<f64>>>()?;
        let mut idx: Vec<usize> = (0..n).collect();
        idx.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
        idx
    } else {
        bail!("malformed re-rank response: expected an array, order, or scores");
    };

    for i in 0..n {
        if !order.contains(&i) {
            order.push(i);
        }
    }
    Ok(order)
}

fn apply_order(chunks: Vec<ContextChunk>, order: &[usize]) -> Vec<ContextChunk> {
    let mut slots: Vec<Option<ContextChunk>> = chunks.into_iter().map(Some).collect();
    order.iter().filter_map(|&i| slots.get_mut(i)?.take()).collect()
}

/// CLI entry point for `devctx enhanced`.
///
/// Command-line switches only turn enhancements on; the config file's
/// `[enhancement]` settings supply everything else.
pub async fn run_enhanced(
    config: &Config,
    query: &str,
    expand: bool,
    rerank: bool,
    max_expansions: Option<usize>,
    budget: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::new(db::connect(config).await?));
    let rag = EnhancedRag::from_config(config, store.clone());

    let mut enhanced = EnhancedConfig::from(&config.enhancement);
    enhanced.use_query_expansion |= expand;
    enhanced.use_reranking |= rerank;
    if let Some(n) = max_expansions {
        enhanced.max_expansions = n;
    }
    if let Some(b) = budget {
        enhanced.char_budget = b;
    }

    let result = rag.enhanced_context(query, &enhanced).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for q in &result.expanded_queries {
            println!("expanded: {}", q);
        }
        for d in &result.degradations {
            println!("degraded: {}", d);
        }
        if result.reranked {
            println!("reranked: yes");
        }
        print_context(&result.context, false)?;
    }

    store.pool().close().await;
    Ok(())
}
