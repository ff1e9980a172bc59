//! Filesystem ingestion: walk → hash → chunk → embed → store.
//!
//! Files whose content hash matches the stored document are skipped, so
//! re-running ingestion over an unchanged tree writes nothing. Embedding
//! is inline and non-fatal: a failed batch leaves its chunks searchable by
//! keyword only.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::chunk::{chunk_text, content_hash};
use crate::config::{Config, IngestConfig};
use crate::db;
use crate::embedding::EmbeddingCapability;
use crate::models::{Chunk, Document};
use crate::store::{SqliteStore, Store};

/// Source type recorded on every document this module writes.
pub const FILESYSTEM_SOURCE: &str = "filesystem";

/// A text file found under the ingest root.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the ingest root, `/`-separated.
    pub source_path: String,
    pub title: String,
    pub body: String,
    /// Modification time, unix seconds.
    pub modified: i64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub scanned: usize,
    pub ingested: usize,
    pub unchanged: usize,
    pub chunks: usize,
    pub embedded: usize,
    pub embedding_failed: usize,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

/// First `# ` heading, else the file name.
fn title_for(path: &Path, body: &str) -> String {
    body.lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        })
}

/// Collect matching text files under `root`, sorted by relative path.
pub fn scan_directory(root: &Path, config: &IngestConfig) -> Result<Vec<SourceFile>> {
    if !root.exists() {
        bail!("Ingest root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");
        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let body = match std::fs::read_to_string(path) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable file");
                continue;
            }
        };
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        files.push(SourceFile {
            title: title_for(path, &body),
            source_path: rel_str,
            body,
            modified,
        });
    }

    files.sort_by(|a, b| a.source_path.cmp(&b.source_path));
    Ok(files)
}

/// Embed and store vectors for `chunks`, batch by batch.
///
/// Returns `(embedded, failed)`. Errors are logged, never propagated.
async fn embed_chunks(
    store: &dyn Store,
    embedding: &EmbeddingCapability,
    chunks: &[Chunk],
    batch_size: usize,
) -> (usize, usize) {
    let Some(embedder) = embedding.embedder() else {
        return (0, 0);
    };
    let mut embedded = 0;
    let mut failed = 0;

    for batch in chunks.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        match embedder.embed(&texts).await {
            Ok(vectors) if vectors.len() == batch.len() => {
                for (chunk, vec) in batch.iter().zip(vectors.iter()) {
                    match store.upsert_embedding(chunk, vec, embedder.model_name()).await {
                        Ok(()) => embedded += 1,
                        Err(e) => {
                            tracing::warn!(chunk = %chunk.id, error = %e, "failed to store embedding");
                            failed += 1;
                        }
                    }
                }
            }
            Ok(vectors) => {
                tracing::warn!(
                    expected = batch.len(),
                    got = vectors.len(),
                    "embedding batch size mismatch"
                );
                failed += batch.len();
            }
            Err(e) => {
                tracing::warn!(error = %e, "embedding batch failed");
                failed += batch.len();
            }
        }
    }
    (embedded, failed)
}

/// Write `files` into `store`, skipping any whose content is unchanged.
pub async fn ingest_files(
    store: &dyn Store,
    embedding: &EmbeddingCapability,
    files: &[SourceFile],
    max_tokens: usize,
    batch_size: usize,
) -> Result<IngestSummary> {
    let mut summary = IngestSummary {
        scanned: files.len(),
        ..Default::default()
    };

    for file in files {
        let hash = content_hash(&file.body);
        let existing = store
            .find_document_by_path(FILESYSTEM_SOURCE, &file.source_path)
            .await?;
        if existing.as_ref().is_some_and(|e| e.content_hash == hash) {
            tracing::debug!(path = %file.source_path, "unchanged, skipping");
            summary.unchanged += 1;
            continue;
        }

        let doc_id = existing
            .map(|e| e.id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        // The real hash is written only after the chunks are committed, so an
        // interrupted run is retried instead of being skipped as unchanged.
        let mut doc = Document {
            id: doc_id.clone(),
            source: FILESYSTEM_SOURCE.to_string(),
            source_path: file.source_path.clone(),
            title: Some(file.title.clone()),
            body: file.body.clone(),
            created_at: file.modified,
            content_hash: String::new(),
        };
        store
            .upsert_document(&doc)
            .await
            .with_context(|| format!("Failed to store {}", file.source_path))?;

        let chunks = chunk_text(&doc_id, &file.body, max_tokens);
        store
            .replace_chunks(&doc_id, &chunks, None)
            .await
            .with_context(|| format!("Failed to store chunks for {}", file.source_path))?;

        doc.content_hash = hash;
        store
            .upsert_document(&doc)
            .await
            .with_context(|| format!("Failed to store {}", file.source_path))?;
        let (embedded, failed) = embed_chunks(store, embedding, &chunks, batch_size).await;

        summary.ingested += 1;
        summary.chunks += chunks.len();
        summary.embedded += embedded;
        summary.embedding_failed += failed;
    }

    Ok(summary)
}

/// CLI entry point for `devctx ingest`.
pub async fn run_ingest(config: &Config, root: &Path) -> Result<()> {
    let files = scan_directory(root, &config.ingest)?;
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let embedding = EmbeddingCapability::from_config(&config.embedding);

    let summary = ingest_files(
        &store,
        &embedding,
        &files,
        config.chunking.max_tokens,
        config.embedding.batch_size,
    )
    .await?;

    println!("ingest {}", root.display());
    println!("  files scanned: {}", summary.scanned);
    println!("  documents written: {}", summary.ingested);
    println!("  unchanged: {}", summary.unchanged);
    println!("  chunks written: {}", summary.chunks);
    if embedding.is_available() {
        println!("  embeddings written: {}", summary.embedded);
        println!("  embeddings failed: {}", summary.embedding_failed);
    }
    println!("ok");

    store.pool().close().await;
    Ok(())
}
