//! Article content as delivered by the authoring backend

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An article to index. Identity is the opaque `article_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub article_id: String,
    pub title: String,
    pub url: String,
    pub body: String,
    pub published_at: Option<DateTime<Utc>>,
    pub feed_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Optional user scope for per-user corpora
    pub user_id: Option<String>,
}

impl Article {
    pub fn new(
        article_id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            article_id: article_id.into(),
            title: title.into(),
            url: url.into(),
            body: body.into(),
            published_at: None,
            feed_id: None,
            tags: Vec::new(),
            user_id: None,
        }
    }

    pub fn with_published_at(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }
}
