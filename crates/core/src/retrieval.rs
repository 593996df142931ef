//! Retrieval pipeline types
//!
//! A chunk moves through three shapes on the query path: a
//! `RetrievalCandidate` surfaced by one channel, a `FusedResult` after
//! reciprocal rank fusion, and a `RerankedContext` after cross-encoder
//! reranking. Text payload and source metadata are carried through unchanged;
//! each stage only reorders and rescores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::DocumentVersion;

/// Retrieval channel that surfaced a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Dense,
    Sparse,
}

/// A chunk surfaced by a single retrieval channel
#[derive(Debug, Clone)]
pub struct RetrievalCandidate {
    pub chunk_id: String,
    pub article_id: String,
    pub channel: Channel,
    /// 1-based rank within the channel's result list
    pub rank: usize,
    /// Raw channel score (similarity for dense, BM25 for sparse)
    pub raw_score: f32,
    pub text: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub document_version: DocumentVersion,
}

/// A chunk after reciprocal rank fusion
#[derive(Debug, Clone)]
pub struct FusedResult {
    pub chunk_id: String,
    pub article_id: String,
    /// RRF score summed over contributing channels
    pub fused_score: f64,
    pub channels: Vec<Channel>,
    /// Dense similarity, kept for tie-breaking
    pub dense_score: Option<f32>,
    pub text: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub document_version: DocumentVersion,
}

/// A chunk after cross-encoder reranking, ready for prompt assembly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankedContext {
    pub chunk_id: String,
    pub article_id: String,
    /// Cross-encoder relevance in [0,1], or the fused score when reranking
    /// was skipped
    pub score: f32,
    /// Final 1-based rank
    pub rank: usize,
    pub text: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub document_version: DocumentVersion,
}

impl FusedResult {
    /// Carry a fused result past a skipped rerank stage
    pub fn into_context(self, rank: usize) -> RerankedContext {
        RerankedContext {
            chunk_id: self.chunk_id,
            article_id: self.article_id,
            score: self.fused_score as f32,
            rank,
            text: self.text,
            title: self.title,
            url: self.url,
            published_at: self.published_at,
            document_version: self.document_version,
        }
    }
}
