//! SQLite-backed [`VectorStore`].
//!
//! Chunks live in `schema_chunks`, their vectors as little-endian f32 BLOBs
//! in `chunk_vectors`. Similarity is brute-force cosine over one domain's
//! vectors, which is plenty for catalogs of a few hundred tables.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{ChunkKind, RetrievedChunk, SchemaChunk};

use super::{check_compatible, rank, DomainIndexStats, VectorStore};

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

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<SchemaChunk> {
    let kind: String = row.get("kind");
    Ok(SchemaChunk {
        id: row.get("id"),
        domain: row.get("domain"),
        kind: ChunkKind::parse(&kind)
            .with_context(|| format!("Unknown chunk kind '{}' in index", kind))?,
        table: row.get("table_name"),
        text: row.get("text"),
        hash: row.get("hash"),
    })
}

/// Write one chunk and its vector inside the caller's transaction.
async fn write_chunk(
    conn: &mut SqliteConnection,
    chunk: &SchemaChunk,
    embedding: &[f32],
    model: &str,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO schema_chunks (id, domain, kind, table_name, text, hash, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            domain = excluded.domain,
            kind = excluded.kind,
            table_name = excluded.table_name,
            text = excluded.text,
            hash = excluded.hash,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.domain)
    .bind(chunk.kind.as_str())
    .bind(&chunk.table)
    .bind(&chunk.text)
    .bind(&chunk.hash)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, domain, model, dims, embedding)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            domain = excluded.domain,
            model = excluded.model,
            dims = excluded.dims,
            embedding = excluded.embedding
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.domain)
    .bind(model)
    .bind(embedding.len() as i64)
    .bind(vec_to_blob(embedding))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn upsert(&self, chunk: &SchemaChunk, embedding: &[f32], model: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        write_chunk(&mut tx, chunk, embedding, model, now).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        domain: &str,
        embedding: &[f32],
        model: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.domain, c.kind, c.table_name, c.text, c.hash,
                   cv.model, cv.dims, cv.embedding
            FROM chunk_vectors cv
            JOIN schema_chunks c ON c.id = cv.chunk_id
            WHERE c.domain = ?
            "#,
        )
        .bind(domain)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let stored_model: String = row.get("model");
            let dims: i64 = row.get("dims");
            let vector = blob_to_vec(&row.get::<Vec<u8>, _>("embedding"));
            check_compatible(domain, &stored_model, dims as usize, model, embedding.len())?;
            if vector.len() != dims as usize {
                bail!(
                    "corrupt vector for chunk '{}': {} values, expected {}",
                    row.get::<String, _>("id"),
                    vector.len(),
                    dims
                );
            }
            candidates.push(RetrievedChunk {
                chunk: row_to_chunk(row)?,
                score: cosine_similarity(embedding, &vector) as f64,
                pinned: false,
            });
        }

        Ok(rank(candidates, top_k))
    }

    async fn get(&self, chunk_id: &str) -> Result<Option<SchemaChunk>> {
        let row = sqlx::query(
            "SELECT id, domain, kind, table_name, text, hash FROM schema_chunks WHERE id = ?",
        )
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_chunk).transpose()
    }

    async fn replace_domain(
        &self,
        domain: &str,
        entries: &[(SchemaChunk, Vec<f32>)],
        model: &str,
    ) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunk_vectors WHERE domain = ?")
            .bind(domain)
            .execute(&mut *tx)
            .await?;

        let removed = sqlx::query("DELETE FROM schema_chunks WHERE domain = ?")
            .bind(domain)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for (chunk, embedding) in entries {
            if chunk.domain != domain {
                bail!(
                    "chunk '{}' belongs to domain '{}', not '{}'",
                    chunk.id,
                    chunk.domain,
                    domain
                );
            }
            write_chunk(&mut tx, chunk, embedding, model, now).await?;
        }

        tx.commit().await?;
        Ok(removed)
    }

    async fn stats(&self, domain: &str) -> Result<DomainIndexStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM schema_chunks WHERE domain = ?1) AS chunks,
                (SELECT COUNT(*) FROM chunk_vectors WHERE domain = ?1) AS embedded,
                (SELECT model FROM chunk_vectors WHERE domain = ?1 LIMIT 1) AS model,
                (SELECT MAX(updated_at) FROM schema_chunks WHERE domain = ?1) AS indexed_at
            "#,
        )
        .bind(domain)
        .fetch_one(&self.pool)
        .await?;

        Ok(DomainIndexStats {
            chunks: row.get("chunks"),
            embedded: row.get("embedded"),
            model: row.get("model"),
            indexed_at: row.get("indexed_at"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::create_tables;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        create_tables(&pool).await.unwrap();
        pool
    }

    fn chunk(domain: &str, table: &str) -> SchemaChunk {
        SchemaChunk {
            id: format!("{}::table::{}", domain, table),
            domain: domain.into(),
            kind: ChunkKind::Schema,
            table: Some(table.into()),
            text: format!("TABLE: {}", table),
            hash: "h".into(),
        }
    }

    #[tokio::test]
    async fn test_query_is_domain_scoped_and_ranked() {
        let store = SqliteStore::new(memory_pool().await);
        store
            .upsert(&chunk("chinook", "public.artist"), &[1.0, 0.0], "m")
            .await
            .unwrap();
        store
            .upsert(&chunk("chinook", "public.album"), &[0.7, 0.7], "m")
            .await
            .unwrap();
        store
            .upsert(&chunk("northwind", "public.orders"), &[1.0, 0.0], "m")
            .await
            .unwrap();

        let hits = store.query("chinook", &[1.0, 0.0], "m", 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, "chinook::table::public.artist");
        assert!(hits[0].score > hits[1].score);
        assert!(hits.iter().all(|h| h.chunk.domain == "chinook"));
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_replace_domain_swaps() {
        let store = SqliteStore::new(memory_pool().await);
        let mut c = chunk("chinook", "public.artist");
        store.upsert(&c, &[1.0, 0.0], "m").await.unwrap();
        c.text = "TABLE: public.artist\nCOLUMNS:".into();
        store.upsert(&c, &[0.0, 1.0], "m").await.unwrap();

        let stats = store.stats("chinook").await.unwrap();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.embedded, 1);
        assert_eq!(stats.model.as_deref(), Some("m"));
        assert_eq!(store.get(&c.id).await.unwrap().unwrap().text, c.text);

        let replacement = chunk("chinook", "public.album");
        let removed = store
            .replace_domain("chinook", &[(replacement.clone(), vec![1.0, 1.0])], "m2")
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&c.id).await.unwrap().is_none());
        let stats = store.stats("chinook").await.unwrap();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.model.as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn test_failed_replace_keeps_old_content() {
        let store = SqliteStore::new(memory_pool().await);
        let old = chunk("chinook", "public.artist");
        store.upsert(&old, &[1.0, 0.0], "m").await.unwrap();

        let err = store
            .replace_domain(
                "chinook",
                &[
                    (chunk("chinook", "public.album"), vec![1.0, 0.0]),
                    (chunk("northwind", "public.orders"), vec![1.0, 0.0]),
                ],
                "m",
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("belongs to domain 'northwind'"));
        assert!(store.get(&old.id).await.unwrap().is_some());
        assert!(store
            .get("chinook::table::public.album")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_query_rejects_other_model_or_dims() {
        let store = SqliteStore::new(memory_pool().await);
        store
            .upsert(&chunk("chinook", "public.artist"), &[1.0, 0.0, 0.0], "all-minilm-l6-v2")
            .await
            .unwrap();

        let err = store
            .query("chinook", &[1.0, 0.0, 0.0, 0.0, 0.0], "other-model", 3)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nlsql index --domain chinook"));

        let err = store
            .query("chinook", &[1.0, 0.0, 0.0], "other-model", 3)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'all-minilm-l6-v2'"));

        let err = store
            .query("chinook", &[1.0, 0.0], "all-minilm-l6-v2", 3)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("(3 dims)"));

        let hits = store
            .query("chinook", &[1.0, 0.0, 0.0], "all-minilm-l6-v2", 3)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
