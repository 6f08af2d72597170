//! Top-K schema retrieval.
//!
//! The question is embedded with the same provider the index was built
//! with, the domain's chunks are ranked by cosine similarity, and the
//! domain's relationship map is pinned to the top of the context so the
//! model always sees the join paths. Any failure here is fatal for the
//! request.

use crate::chunk::relationship_chunk_id;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::PipelineError;
use crate::models::{ChunkKind, RetrievedChunk};
use crate::store::VectorStore;

pub async fn retrieve(
    provider: &dyn EmbeddingProvider,
    store: &dyn VectorStore,
    domain: &str,
    question: &str,
    top_k: usize,
    pin_relationships: bool,
) -> Result<Vec<RetrievedChunk>, PipelineError> {
    let query_vec = embed_query(provider, question)
        .await
        .map_err(|e| PipelineError::Retrieval(format!("{:#}", e)))?;

    let mut chunks = store
        .query(domain, &query_vec, provider.model_name(), top_k)
        .await
        .map_err(|e| PipelineError::Retrieval(format!("{:#}", e)))?;

    if chunks.is_empty() {
        return Err(PipelineError::Retrieval(format!(
            "no indexed schema for domain '{}'. Run `nlsql index --domain {}` first.",
            domain, domain
        )));
    }

    if pin_relationships {
        pin_relationship_chunk(store, domain, &mut chunks).await?;
    }

    tracing::debug!(domain, count = chunks.len(), "retrieved schema chunks");
    Ok(chunks)
}

/// Move (or fetch and insert) the relationship chunk to position 0.
async fn pin_relationship_chunk(
    store: &dyn VectorStore,
    domain: &str,
    chunks: &mut Vec<RetrievedChunk>,
) -> Result<(), PipelineError> {
    if let Some(pos) = chunks
        .iter()
        .position(|c| c.chunk.kind == ChunkKind::Relationships)
    {
        let mut rel = chunks.remove(pos);
        rel.pinned = true;
        chunks.insert(0, rel);
        return Ok(());
    }

    let rel = store
        .get(&relationship_chunk_id(domain))
        .await
        .map_err(|e| PipelineError::Retrieval(format!("{:#}", e)))?;

    if let Some(chunk) = rel {
        chunks.insert(
            0,
            RetrievedChunk {
                chunk,
                score: 0.0,
                pinned: true,
            },
        );
    }
    Ok(())
}

/// Print retrieved chunks for `nlsql retrieve`.
pub fn print_chunks(chunks: &[RetrievedChunk]) {
    if chunks.is_empty() {
        println!("No results.");
        return;
    }
    for (i, rc) in chunks.iter().enumerate() {
        let label = if rc.pinned {
            "pinned".to_string()
        } else {
            format!("{:.3}", rc.score)
        };
        println!("{}. [{}] {}", i + 1, label, rc.chunk.id);
        for line in rc.chunk.text.lines() {
            println!("    {}", line);
        }
        println!();
    }
}
