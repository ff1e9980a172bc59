//! SQLite-backed [`Store`] implementation.
//!
//! Documents and chunks live in plain tables, keyword search goes through
//! the `chunks_fts` FTS5 table, and vectors are little-endian `f32` blobs
//! in `chunk_vectors` scored in Rust.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{Chunk, Document, SearchHit, SearchMethod, StoreStats};

use super::{query_terms, Store, StoredDocumentRef};

/// SQLite implementation of the [`Store`] trait.
///
/// Wraps a [`SqlitePool`]; the schema comes from
/// [`migrate_pool`](crate::migrate::migrate_pool).
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Build an FTS5 MATCH expression that ORs quoted terms together.
///
/// Returns `None` when the query has no searchable terms. Quoting every
/// term keeps FTS5 operators in user input from being interpreted.
fn fts_match_expr(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn hit_from_row(row: &SqliteRow, score: f64, method: SearchMethod) -> SearchHit {
    SearchHit {
        chunk_id: row.get("chunk_id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        source_path: row.get("source_path"),
        title: row.get("title"),
        text: row.get("text"),
        score,
        method,
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, source, source_path, title, body, created_at, content_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source, source_path) DO UPDATE SET
                title = excluded.title,
                body = excluded.body,
                content_hash = excluded.content_hash
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.source)
        .bind(&doc.source_path)
        .bind(&doc.title)
        .bind(&doc.body)
        .bind(doc.created_at)
        .bind(&doc.content_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_document_by_path(
        &self,
        source: &str,
        source_path: &str,
    ) -> Result<Option<StoredDocumentRef>> {
        let row = sqlx::query(
            "SELECT id, content_hash FROM documents WHERE source = ? AND source_path = ?",
        )
        .bind(source)
        .bind(source_path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| StoredDocumentRef {
            id: r.get("id"),
            content_hash: r.get("content_hash"),
        }))
    }

    async fn replace_chunks(
        &self,
        doc_id: &str,
        chunks: &[Chunk],
        vectors: Option<&[Vec<f32>]>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
        )
        .bind(doc_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        for (i, chunk) in chunks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.document_id)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await?;

            if let Some(vec) = vectors.and_then(|v| v.get(i)) {
                sqlx::query(
                    r#"
                    INSERT INTO chunk_vectors (chunk_id, document_id, dims, embedding)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(chunk_id) DO UPDATE SET
                        document_id = excluded.document_id,
                        dims = excluded.dims,
                        embedding = excluded.embedding
                    "#,
                )
                .bind(&chunk.id)
                .bind(doc_id)
                .bind(vec.len() as i64)
                .bind(vec_to_blob(vec))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_embedding(&self, chunk: &Chunk, vector: &[f32], model: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO embeddings (chunk_id, model, dims, created_at, hash)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                model = excluded.model,
                dims = excluded.dims,
                created_at = excluded.created_at,
                hash = excluded.hash
            "#,
        )
        .bind(&chunk.id)
        .bind(model)
        .bind(vector.len() as i64)
        .bind(now)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, document_id, dims, embedding)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                document_id = excluded.document_id,
                dims = excluded.dims,
                embedding = excluded.embedding
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, source, source_path, title, body, created_at, content_hash FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Document {
            id: r.get("id"),
            source: r.get("source"),
            source_path: r.get("source_path"),
            title: r.get("title"),
            body: r.get("body"),
            created_at: r.get("created_at"),
            content_hash: r.get("content_hash"),
        }))
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let Some(expr) = fts_match_expr(query) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT chunks_fts.chunk_id, chunks_fts.document_id, chunks_fts.rank,
                   c.chunk_index, c.text, d.source_path, d.title
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.chunk_id
            JOIN documents d ON d.id = chunks_fts.document_id
            WHERE chunks_fts MATCH ?
            ORDER BY chunks_fts.rank, chunks_fts.rowid
            LIMIT ?
            "#,
        )
        .bind(&expr)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                hit_from_row(row, -rank, SearchMethod::Lexical)
            })
            .collect())
    }

    async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<SearchHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT cv.chunk_id, cv.document_id, cv.embedding, c.chunk_index, c.text,
                   d.source_path, d.title
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            JOIN documents d ON d.id = cv.document_id
            WHERE cv.dims = ?
            "#,
        )
        .bind(query_vec.len() as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<SearchHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                hit_from_row(row, similarity, SearchMethod::Vector)
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
        let dims: Vec<i64> =
            sqlx::query_scalar("SELECT DISTINCT dims FROM chunk_vectors ORDER BY dims")
                .fetch_all(&self.pool)
                .await?;
        Ok(dims.into_iter().map(|d| d as usize).collect())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreStats {
            documents,
            chunks,
            vectors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fts_match_expr_quotes_terms() {
        assert_eq!(
            fts_match_expr("rust AND \"cargo\"").as_deref(),
            Some("\"rust\" OR \"and\" OR \"cargo\"")
        );
    }

    #[test]
    fn test_fts_match_expr_empty() {
        assert_eq!(fts_match_expr("  *() "), None);
    }
}
