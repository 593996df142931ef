//! Embedding service client
//!
//! Dense vectors come from an external embedding service with a fixed
//! dimension per deployment. Every returned vector is checked against the
//! configured dimension; a mismatch is an invariant violation, not a
//! retryable failure.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::RagError;

/// Embedding capability: `encode(texts) -> vectors`
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;

    /// Fixed vector dimension D
    fn dim(&self) -> usize;

    fn model(&self) -> &str;
}

/// HTTP embedder configuration
#[derive(Debug, Clone)]
pub struct HttpEmbedderConfig {
    /// Ollama-compatible endpoint
    pub endpoint: String,
    pub model: String,
    pub vector_dim: usize,
    pub timeout: Duration,
}

impl Default for HttpEmbedderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "qwen3-embedding:0.6b".to_string(),
            vector_dim: 1024,
            timeout: Duration::from_secs(30),
        }
    }
}

impl HttpEmbedderConfig {
    pub fn from_settings(cfg: &quarry_config::EmbeddingConfig) -> Self {
        Self {
            endpoint: cfg.endpoint.clone(),
            model: cfg.model.clone(),
            vector_dim: cfg.vector_dim,
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }

    /// Same service shape at a different endpoint; used by the per-request
    /// embedder override on the upsert route
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embedder over an Ollama-compatible `/api/embed` endpoint
pub struct HttpEmbedder {
    client: Client,
    config: HttpEmbedderConfig,
}

impl HttpEmbedder {
    pub fn new(config: HttpEmbedderConfig) -> Result<Self, RagError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RagError::Embedding(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbedRequest {
            model: &self.config.model,
            input: texts,
        };
        let url = format!("{}/api/embed", self.config.endpoint);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::transport("embedder", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(RagError::Connection {
                    dependency: "embedder",
                    message: format!("server error {}: {}", status, body),
                });
            }
            return Err(RagError::Embedding(format!(
                "embedding request rejected: {} - {}",
                status, body
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| RagError::Embedding(format!("failed to parse response: {}", e)))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(RagError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        for vector in &parsed.embeddings {
            if vector.len() != self.config.vector_dim {
                return Err(RagError::DimensionMismatch {
                    expected: self.config.vector_dim,
                    actual: vector.len(),
                });
            }
        }

        Ok(parsed.embeddings)
    }

    fn dim(&self) -> usize {
        self.config.vector_dim
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = HttpEmbedderConfig::default();
        assert_eq!(config.vector_dim, 1024);
    }

    #[test]
    fn test_endpoint_override_keeps_model() {
        let config = HttpEmbedderConfig::default().with_endpoint("http://other:11434");
        assert_eq!(config.endpoint, "http://other:11434");
        assert_eq!(config.model, "qwen3-embedding:0.6b");
    }
}
