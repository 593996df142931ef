//! Cross-encoder reranking
//!
//! The reranker service scores `(query, text)` pairs in [0,1]; results are
//! re-sorted by score and cut to the final context cap. Reranking only ever
//! mutates order and score. Any failure, including an out-of-range index in
//! the response, degrades to the fused order with a `rerank_skipped` flag;
//! degradation is never a request-level error.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use quarry_core::{FusedResult, RerankedContext};

use crate::RagError;

/// One reranker score, referring back to a candidate by input index
#[derive(Debug, Clone, Deserialize)]
pub struct RerankScore {
    pub index: usize,
    pub score: f32,
}

/// Reranker capability: `rerank(query, texts) -> [{index, score}]`
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<RerankScore>, RagError>;
}

/// HTTP reranker configuration
#[derive(Debug, Clone)]
pub struct HttpRerankerConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for HttpRerankerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".to_string(),
            model: "bge-reranker-v2-m3".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl HttpRerankerConfig {
    pub fn from_settings(cfg: &quarry_config::RerankConfig) -> Self {
        Self {
            endpoint: cfg.endpoint.clone(),
            model: cfg.model.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    candidates: &'a [String],
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankScore>,
}

/// Client for an HTTP cross-encoder service
pub struct HttpReranker {
    client: Client,
    config: HttpRerankerConfig,
}

impl HttpReranker {
    pub fn new(config: HttpRerankerConfig) -> Result<Self, RagError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RagError::Reranker(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<RerankScore>, RagError> {
        let request = RerankRequest {
            model: &self.config.model,
            query,
            candidates: texts,
        };
        let url = format!("{}/v1/rerank", self.config.endpoint);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::transport("reranker", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::Reranker(format!(
                "rerank request failed: {} - {}",
                status, body
            )));
        }

        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|e| RagError::Reranker(format!("failed to parse response: {}", e)))?;

        Ok(parsed.results)
    }
}

/// Rerank fused candidates down to `max_chunks` contexts.
///
/// Returns the contexts and whether reranking was skipped. With no reranker,
/// an empty candidate list, a transport failure, or an invalid index in the
/// response, the fused order is preserved as-is.
pub async fn apply_rerank(
    reranker: Option<&dyn Reranker>,
    query: &str,
    fused: Vec<FusedResult>,
    max_chunks: usize,
    batch_cap: usize,
) -> (Vec<RerankedContext>, bool) {
    if fused.is_empty() {
        return (Vec::new(), false);
    }

    let Some(reranker) = reranker else {
        return (fused_order(fused, max_chunks), true);
    };

    // Bound the cross-encoder batch; anything past the cap keeps fused order
    let batch: Vec<FusedResult> = fused.into_iter().take(batch_cap).collect();
    let texts: Vec<String> = batch.iter().map(|f| f.text.clone()).collect();

    let scores = match reranker.rerank(query, &texts).await {
        Ok(scores) => scores,
        Err(e) => {
            tracing::warn!(error = %e, "Reranker unavailable, keeping fused order");
            return (fused_order(batch, max_chunks), true);
        }
    };

    if scores.iter().any(|s| s.index >= batch.len()) {
        tracing::warn!("Reranker returned out-of-range index, keeping fused order");
        return (fused_order(batch, max_chunks), true);
    }

    let mut scored: Vec<(f32, &FusedResult)> = scores
        .iter()
        .map(|s| (s.score, &batch[s.index]))
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.chunk_id.cmp(&b.1.chunk_id))
    });

    let contexts = scored
        .into_iter()
        .take(max_chunks)
        .enumerate()
        .map(|(i, (score, fused))| RerankedContext {
            chunk_id: fused.chunk_id.clone(),
            article_id: fused.article_id.clone(),
            score,
            rank: i + 1,
            text: fused.text.clone(),
            title: fused.title.clone(),
            url: fused.url.clone(),
            published_at: fused.published_at,
            document_version: fused.document_version,
        })
        .collect();

    (contexts, false)
}

fn fused_order(fused: Vec<FusedResult>, max_chunks: usize) -> Vec<RerankedContext> {
    fused
        .into_iter()
        .take(max_chunks)
        .enumerate()
        .map(|(i, f)| f.into_context(i + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::Channel;

    fn fused(chunk_id: &str, score: f64) -> FusedResult {
        FusedResult {
            chunk_id: chunk_id.to_string(),
            article_id: format!("article-{}", chunk_id),
            fused_score: score,
            channels: vec![Channel::Dense],
            dense_score: Some(score as f32),
            text: format!("text {}", chunk_id),
            title: None,
            url: None,
            published_at: None,
            document_version: 1,
        }
    }

    struct FixedReranker {
        scores: Vec<RerankScore>,
    }

    #[async_trait]
    impl Reranker for FixedReranker {
        async fn rerank(&self, _: &str, _: &[String]) -> Result<Vec<RerankScore>, RagError> {
            Ok(self.scores.clone())
        }
    }

    struct BrokenReranker;

    #[async_trait]
    impl Reranker for BrokenReranker {
        async fn rerank(&self, _: &str, _: &[String]) -> Result<Vec<RerankScore>, RagError> {
            Err(RagError::Connection {
                dependency: "reranker",
                message: "500".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_empty_input_skips_the_service() {
        let reranker = BrokenReranker;
        let (contexts, skipped) = apply_rerank(Some(&reranker), "q", vec![], 5, 32).await;
        assert!(contexts.is_empty());
        assert!(!skipped);
    }

    #[tokio::test]
    async fn test_rerank_reorders_by_score() {
        let reranker = FixedReranker {
            scores: vec![
                RerankScore { index: 0, score: 0.2 },
                RerankScore { index: 1, score: 0.9 },
            ],
        };
        let input = vec![fused("c1", 0.9), fused("c2", 0.5)];
        let (contexts, skipped) = apply_rerank(Some(&reranker), "q", input, 5, 32).await;

        assert!(!skipped);
        assert_eq!(contexts[0].chunk_id, "c2");
        assert_eq!(contexts[0].rank, 1);
        assert!((contexts[0].score - 0.9).abs() < 1e-6);
        assert_eq!(contexts[1].chunk_id, "c1");
    }

    #[tokio::test]
    async fn test_failure_preserves_fused_order() {
        let input = vec![fused("c1", 0.9), fused("c2", 0.5)];
        let (contexts, skipped) = apply_rerank(Some(&BrokenReranker), "q", input, 5, 32).await;

        assert!(skipped);
        assert_eq!(contexts[0].chunk_id, "c1");
        assert_eq!(contexts[1].chunk_id, "c2");
    }

    #[tokio::test]
    async fn test_invalid_index_preserves_fused_order() {
        let reranker = FixedReranker {
            scores: vec![RerankScore { index: 7, score: 0.9 }],
        };
        let input = vec![fused("c1", 0.9), fused("c2", 0.5)];
        let (contexts, skipped) = apply_rerank(Some(&reranker), "q", input, 5, 32).await;

        assert!(skipped);
        assert_eq!(contexts[0].chunk_id, "c1");
    }

    #[tokio::test]
    async fn test_max_chunks_cap_applies() {
        let reranker = FixedReranker {
            scores: vec![
                RerankScore { index: 0, score: 0.1 },
                RerankScore { index: 1, score: 0.2 },
                RerankScore { index: 2, score: 0.3 },
            ],
        };
        let input = vec![fused("c1", 0.9), fused("c2", 0.5), fused("c3", 0.4)];
        let (contexts, _) = apply_rerank(Some(&reranker), "q", input, 2, 32).await;
        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts[0].chunk_id, "c3");
    }
}
