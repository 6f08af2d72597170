//! Vector storage for schema chunks.
//!
//! The [`VectorStore`] trait is the seam between indexing/retrieval and the
//! backing store, so the pipeline can run against the persistent SQLite
//! index or an in-memory store in tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::{RetrievedChunk, SchemaChunk};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Per-domain index status, for `nlsql domains`.
#[derive(Debug, Clone, Default)]
pub struct DomainIndexStats {
    pub chunks: i64,
    pub embedded: i64,
    /// Embedding model of the most recent vector, if any.
    pub model: Option<String>,
    /// Unix timestamp of the most recent upsert.
    pub indexed_at: Option<i64>,
}

/// Abstract vector store for schema chunks.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorStore::upsert) | Insert or replace a chunk and its vector |
/// | [`query`](VectorStore::query) | Top-K chunks of one domain by cosine similarity |
/// | [`get`](VectorStore::get) | Fetch a chunk by ID |
/// | [`replace_domain`](VectorStore::replace_domain) | Swap a domain's whole content atomically |
/// | [`stats`](VectorStore::stats) | Counts for a domain |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace a chunk and its embedding.
    async fn upsert(&self, chunk: &SchemaChunk, embedding: &[f32], model: &str) -> Result<()>;

    /// Return up to `top_k` chunks of `domain`, highest similarity first.
    ///
    /// Fails when the stored vectors were produced by a different model or
    /// have a different length than `embedding`.
    async fn query(
        &self,
        domain: &str,
        embedding: &[f32],
        model: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>>;

    async fn get(&self, chunk_id: &str) -> Result<Option<SchemaChunk>>;

    /// Drop every chunk of `domain` and store `entries` in its place, as
    /// one unit. Returns the number of chunks removed.
    async fn replace_domain(
        &self,
        domain: &str,
        entries: &[(SchemaChunk, Vec<f32>)],
        model: &str,
    ) -> Result<u64>;

    async fn stats(&self, domain: &str) -> Result<DomainIndexStats>;
}

/// Sort candidates by descending score and keep the first `top_k`.
pub(crate) fn rank(mut candidates: Vec<RetrievedChunk>, top_k: usize) -> Vec<RetrievedChunk> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    candidates.truncate(top_k);
    candidates
}

/// Check a stored vector was produced the way the query vector was.
pub(crate) fn check_compatible(
    domain: &str,
    stored_model: &str,
    stored_dims: usize,
    model: &str,
    dims: usize,
) -> Result<()> {
    if stored_model != model || stored_dims != dims {
        bail!(
            "index for domain '{}' was built with model '{}' ({} dims) but queries use '{}' ({} dims). \
             Run `nlsql index --domain {}` to rebuild it.",
            domain,
            stored_model,
            stored_dims,
            model,
            dims,
            domain
        );
    }
    Ok(())
}
