//! In-memory [`VectorStore`] for tests and throwaway sessions.
//!
//! Chunks are kept in a `HashMap` behind `std::sync::RwLock`. Query is
//! brute-force cosine similarity over the requested domain.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{RetrievedChunk, SchemaChunk};

use super::{check_compatible, rank, DomainIndexStats, VectorStore};

struct StoredChunk {
    chunk: SchemaChunk,
    vector: Vec<f32>,
    model: String,
    updated_at: i64,
}

#[derive(Default)]
pub struct InMemoryStore {
    chunks: RwLock<HashMap<String, StoredChunk>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn upsert(&self, chunk: &SchemaChunk, embedding: &[f32], model: &str) -> Result<()> {
        let mut chunks = self.chunks.write().map_err(poisoned)?;
        chunks.insert(
            chunk.id.clone(),
            StoredChunk {
                chunk: chunk.clone(),
                vector: embedding.to_vec(),
                model: model.to_string(),
                updated_at: chrono::Utc::now().timestamp(),
            },
        );
        Ok(())
    }

    async fn query(
        &self,
        domain: &str,
        embedding: &[f32],
        model: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let chunks = self.chunks.read().map_err(poisoned)?;
        let mut candidates = Vec::new();
        for s in chunks.values().filter(|s| s.chunk.domain == domain) {
            check_compatible(domain, &s.model, s.vector.len(), model, embedding.len())?;
            candidates.push(RetrievedChunk {
                chunk: s.chunk.clone(),
                score: cosine_similarity(embedding, &s.vector) as f64,
                pinned: false,
            });
        }
        Ok(rank(candidates, top_k))
    }

    async fn get(&self, chunk_id: &str) -> Result<Option<SchemaChunk>> {
        let chunks = self.chunks.read().map_err(poisoned)?;
        Ok(chunks.get(chunk_id).map(|s| s.chunk.clone()))
    }

    async fn replace_domain(
        &self,
        domain: &str,
        entries: &[(SchemaChunk, Vec<f32>)],
        model: &str,
    ) -> Result<u64> {
        if let Some((chunk, _)) = entries.iter().find(|(c, _)| c.domain != domain) {
            bail!(
                "chunk '{}' belongs to domain '{}', not '{}'",
                chunk.id,
                chunk.domain,
                domain
            );
        }

        let now = chrono::Utc::now().timestamp();
        let mut chunks = self.chunks.write().map_err(poisoned)?;
        let before = chunks.len();
        chunks.retain(|_, s| s.chunk.domain != domain);
        let removed = (before - chunks.len()) as u64;
        for (chunk, vector) in entries {
            chunks.insert(
                chunk.id.clone(),
                StoredChunk {
                    chunk: chunk.clone(),
                    vector: vector.clone(),
                    model: model.to_string(),
                    updated_at: now,
                },
            );
        }
        Ok(removed)
    }

    async fn stats(&self, domain: &str) -> Result<DomainIndexStats> {
        let chunks = self.chunks.read().map_err(poisoned)?;
        let mut stats = DomainIndexStats::default();
        for s in chunks.values().filter(|s| s.chunk.domain == domain) {
            stats.chunks += 1;
            stats.embedded += 1;
            stats.model = Some(s.model.clone());
            stats.indexed_at = Some(stats.indexed_at.unwrap_or(0).max(s.updated_at));
        }
        Ok(stats)
    }
}
