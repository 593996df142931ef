//! Article provider
//!
//! Backfill jobs resolve article bodies through this capability; the
//! authoring backend is an external collaborator with a narrow read contract.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;

use quarry_core::Article;

use crate::RagError;

/// Article read capability
#[async_trait]
pub trait ArticleProvider: Send + Sync {
    /// Fetch an article by id; `None` when the backend does not know it
    async fn fetch(&self, article_id: &str) -> Result<Option<Article>, RagError>;
}

/// HTTP provider configuration
#[derive(Debug, Clone)]
pub struct HttpArticleProviderConfig {
    pub endpoint: String,
    pub timeout: Duration,
}

impl Default for HttpArticleProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8200".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Client for the article authoring backend
pub struct HttpArticleProvider {
    client: Client,
    config: HttpArticleProviderConfig,
}

impl HttpArticleProvider {
    pub fn new(config: HttpArticleProviderConfig) -> Result<Self, RagError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RagError::Index(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn from_endpoint(endpoint: &str) -> Result<Self, RagError> {
        Self::new(HttpArticleProviderConfig {
            endpoint: endpoint.to_string(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl ArticleProvider for HttpArticleProvider {
    async fn fetch(&self, article_id: &str) -> Result<Option<Article>, RagError> {
        let url = format!("{}/v1/articles/{}", self.config.endpoint, article_id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RagError::transport("articles", e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::Connection {
                dependency: "articles",
                message: format!("fetch failed: {} - {}", status, body),
            });
        }

        let article: Article = response
            .json()
            .await
            .map_err(|e| RagError::Index(format!("failed to parse article: {}", e)))?;
        Ok(Some(article))
    }
}

/// In-memory provider for tests
#[derive(Default)]
pub struct MemoryArticleProvider {
    articles: RwLock<HashMap<String, Article>>,
}

impl MemoryArticleProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, article: Article) {
        self.articles
            .write()
            .insert(article.article_id.clone(), article);
    }
}

#[async_trait]
impl ArticleProvider for MemoryArticleProvider {
    async fn fetch(&self, article_id: &str) -> Result<Option<Article>, RagError> {
        Ok(self.articles.read().get(article_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_provider_round_trip() {
        let provider = MemoryArticleProvider::new();
        provider.insert(Article::new("a1", "Title", "http://x", "body"));

        let fetched = provider.fetch("a1").await.unwrap().unwrap();
        assert_eq!(fetched.title, "Title");
        assert!(provider.fetch("missing").await.unwrap().is_none());
    }
}
