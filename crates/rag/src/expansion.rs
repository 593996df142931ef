//! Query expansion client
//!
//! The expansion service turns a query into Japanese and English variants
//! for the sparse channel. Expansion is best-effort: the planner degrades to
//! the original query on any failure.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::RagError;

/// Expansion capability: `expand(query, ja_count, en_count) -> variants`
#[async_trait]
pub trait QueryExpander: Send + Sync {
    async fn expand(
        &self,
        query: &str,
        ja_count: usize,
        en_count: usize,
    ) -> Result<Vec<String>, RagError>;
}

/// Expander that never produces variants; used when expansion is disabled
pub struct NoExpansion;

#[async_trait]
impl QueryExpander for NoExpansion {
    async fn expand(&self, _: &str, _: usize, _: usize) -> Result<Vec<String>, RagError> {
        Ok(Vec::new())
    }
}

/// HTTP expansion client configuration
#[derive(Debug, Clone)]
pub struct HttpExpansionConfig {
    pub endpoint: String,
    pub timeout: Duration,
}

impl Default for HttpExpansionConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9100".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl HttpExpansionConfig {
    pub fn from_settings(cfg: &quarry_config::ExpansionConfig) -> Self {
        Self {
            endpoint: cfg.endpoint.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }
}

#[derive(Debug, Serialize)]
struct ExpandRequest<'a> {
    query: &'a str,
    ja_count: usize,
    en_count: usize,
}

#[derive(Debug, Deserialize)]
struct ExpandResponse {
    variants: Vec<String>,
}

/// Expander over an HTTP expansion endpoint
pub struct HttpExpansion {
    client: Client,
    config: HttpExpansionConfig,
}

impl HttpExpansion {
    pub fn new(config: HttpExpansionConfig) -> Result<Self, RagError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RagError::Expansion(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl QueryExpander for HttpExpansion {
    async fn expand(
        &self,
        query: &str,
        ja_count: usize,
        en_count: usize,
    ) -> Result<Vec<String>, RagError> {
        let request = ExpandRequest {
            query,
            ja_count,
            en_count,
        };
        let url = format!("{}/v1/expand", self.config.endpoint);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::transport("expansion", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::Expansion(format!(
                "expansion request failed: {} - {}",
                status, body
            )));
        }

        let parsed: ExpandResponse = response
            .json()
            .await
            .map_err(|e| RagError::Expansion(format!("failed to parse response: {}", e)))?;

        Ok(parsed.variants)
    }
}
