//! Building a domain's vector index.
//!
//! Reindexing is all-or-nothing per domain: every chunk is embedded first,
//! then the domain's previous content is swapped out in one store
//! transaction. A failed embedding call or write leaves the old index
//! untouched.

use anyhow::{bail, Context, Result};

use crate::chunk::chunk_schema;
use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::migrate;
use crate::models::DomainSchema;
use crate::schema_extract;
use crate::store::{SqliteStore, VectorStore};

#[derive(Debug, Clone, PartialEq)]
pub struct IndexReport {
    pub domain: String,
    pub tables: usize,
    pub chunks: usize,
    pub removed: u64,
    pub model: String,
}

/// Chunk, embed and store one domain's schema.
pub async fn index_schema(
    schema: &DomainSchema,
    provider: &dyn EmbeddingProvider,
    store: &dyn VectorStore,
    batch_size: usize,
) -> Result<IndexReport> {
    let chunks = chunk_schema(schema);
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();

    let vectors = embedding::embed_batched(provider, &texts, batch_size)
        .await
        .with_context(|| format!("Failed to embed schema chunks for '{}'", schema.domain))?;

    let chunk_count = chunks.len();
    let entries: Vec<_> = chunks.into_iter().zip(vectors).collect();
    let removed = store
        .replace_domain(&schema.domain, &entries, provider.model_name())
        .await?;

    tracing::debug!(
        domain = %schema.domain,
        chunks = chunk_count,
        removed,
        "domain reindexed"
    );

    Ok(IndexReport {
        domain: schema.domain.clone(),
        tables: schema.tables.len(),
        chunks: chunk_count,
        removed,
        model: provider.model_name().to_string(),
    })
}

/// `nlsql index`: rebuild the index for each named domain, from the live
/// catalog or from JSON snapshots.
pub async fn run_index(config: &Config, domains: &[String], from_snapshot: bool) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let pool = db::connect_index(config).await?;
    migrate::create_tables(&pool).await?;
    let store = SqliteStore::new(pool);

    for domain in domains {
        config.domain(domain)?;
        let schema = if from_snapshot {
            schema_extract::read_snapshot(&config.snapshot_path(domain))?
        } else {
            let schema = schema_extract::extract_domain(config, domain).await?;
            schema_extract::write_snapshot(&config.snapshot_path(domain), &schema)?;
            schema
        };

        println!("[index] building domain={}", domain);
        let report = index_schema(
            &schema,
            provider.as_ref(),
            &store,
            config.embedding.batch_size,
        )
        .await?;

        println!("  tables: {}", report.tables);
        println!("  chunks written: {}", report.chunks);
        println!("  chunks replaced: {}", report.removed);
        println!("  model: {}", report.model);
    }

    store.pool().close().await;
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnInfo, TableSchema};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;

    struct LenEmbedder;

    #[async_trait]
    impl EmbeddingProvider for LenEmbedder {
        fn model_name(&self) -> &str {
            "len"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        fn model_name(&self) -> &str {
            "fail"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            bail!("connection refused")
        }
    }

    fn schema(tables: &[&str]) -> DomainSchema {
        DomainSchema {
            domain: "chinook".into(),
            tables: tables
                .iter()
                .map(|t| TableSchema {
                    table: t.to_string(),
                    columns: vec![ColumnInfo {
                        name: "id".into(),
                        data_type: "integer".into(),
                    }],
                    primary_key: vec![],
                    foreign_keys: vec![],
                    description: String::new(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_reindex_replaces_domain_content() {
        let store = InMemoryStore::new();
        let first = index_schema(&schema(&["public.a", "public.b"]), &LenEmbedder, &store, 1)
            .await
            .unwrap();
        assert_eq!(first.chunks, 3);
        assert_eq!(first.removed, 0);

        let second = index_schema(&schema(&["public.c"]), &LenEmbedder, &store, 8)
            .await
            .unwrap();
        assert_eq!(second.removed, 3);
        assert_eq!(store.stats("chinook").await.unwrap().chunks, 2);
        assert!(store.get("chinook::table::public.a").await.unwrap().is_none());
        assert!(store.get("chinook::relationships").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_embedding_failure_keeps_old_index() {
        let store = InMemoryStore::new();
        index_schema(&schema(&["public.a"]), &LenEmbedder, &store, 4)
            .await
            .unwrap();
        let err = index_schema(&schema(&["public.b"]), &FailingEmbedder, &store, 4)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("connection refused"));
        assert!(store.get("chinook::table::public.a").await.unwrap().is_some());
    }
}
