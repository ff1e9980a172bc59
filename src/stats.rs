//! `devctx stats`: what the store holds.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::models::StoreStats;
use crate::store::{SqliteStore, Store};

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn coverage(stats: &StoreStats) -> i64 {
    if stats.chunks > 0 {
        (stats.vectors * 100) / stats.chunks
    } else {
        0
    }
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);
    let stats = store.stats().await?;
    let dims = store.embedding_dims().await?;
    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("devctx store");
    println!("  database:   {}", config.db.path.display());
    println!("  size:       {}", format_bytes(db_size));
    println!("  documents:  {}", stats.documents);
    println!("  chunks:     {}", stats.chunks);
    println!(
        "  embedded:   {} / {} ({}%)",
        stats.vectors,
        stats.chunks,
        coverage(&stats)
    );
    match dims.as_slice() {
        [] => {}
        [d] => println!("  dims:       {}", d),
        many => println!("  dims:       {:?} (mixed, re-ingest to refresh)", many),
    }

    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_coverage_handles_empty_store() {
        assert_eq!(coverage(&StoreStats::default()), 0);
        let stats = StoreStats {
            documents: 1,
            chunks: 4,
            vectors: 1,
        };
        assert_eq!(coverage(&stats), 25);
    }
}
