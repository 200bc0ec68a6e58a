//! Retrieval collaborator for RAG generation.
//!
//! Vector search lives outside this crate. The engine only asks a
//! [`Retriever`] for scored chunks and prepends the best of them to the
//! user's query.

use crate::config::{GeneratorRagConfig, RetrievalConfig};
use crate::error::Result;

/// One piece of retrieved context.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub content: String,
    /// Similarity in `[0, 1]`.
    pub score: f32,
}

impl RetrievedChunk {
    pub fn new(content: impl Into<String>, score: f32) -> Self {
        Self {
            content: content.into(),
            score,
        }
    }
}

/// Source of context chunks for a query within a scope.
pub trait Retriever: Send + Sync {
    fn retrieve(&self, query: &str, rag: &GeneratorRagConfig) -> Result<Vec<RetrievedChunk>>;
}

/// Retriever for deployments without a knowledge base. Finds nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetriever;

impl Retriever for NoRetriever {
    fn retrieve(&self, _query: &str, _rag: &GeneratorRagConfig) -> Result<Vec<RetrievedChunk>> {
        Ok(Vec::new())
    }
}

/// Prepend the best chunks to `query`.
///
/// Chunks under the score threshold are dropped, the rest are ordered by
/// score and capped at `top_k`. With nothing left the query is returned
/// unchanged.
pub fn compose_prompt(query: &str, mut chunks: Vec<RetrievedChunk>, retrieval: &RetrievalConfig) -> String {
    chunks.retain(|c| c.score >= retrieval.score_threshold && !c.content.trim().is_empty());
    chunks.sort_by(|a, b| b.score.total_cmp(&a.score));
    chunks.truncate(retrieval.top_k as usize);
    if chunks.is_empty() {
        return query.to_string();
    }

    let mut prompt = String::new();
    for chunk in &chunks {
        prompt.push_str(chunk.content.trim());
        prompt.push_str("\n\n");
    }
    prompt.push_str(query);
    prompt
}
