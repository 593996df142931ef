//! Query planning
//!
//! Normalizes the raw question, expands it into multilingual variants for the
//! sparse channel, and embeds the primary query for the dense channel. A
//! single embedding call is made for the primary query only; variants never
//! hit the embedder.

use std::sync::Arc;

use crate::embeddings::Embedder;
use crate::expansion::QueryExpander;
use crate::RagError;

/// Planner configuration
#[derive(Debug, Clone)]
pub struct PlannerSettings {
    pub ja_count: usize,
    pub en_count: usize,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            ja_count: 2,
            en_count: 2,
        }
    }
}

impl PlannerSettings {
    pub fn from_settings(cfg: &quarry_config::ExpansionConfig) -> Self {
        Self {
            ja_count: cfg.ja_count,
            en_count: cfg.en_count,
        }
    }
}

/// A planned query ready for hybrid retrieval
#[derive(Debug, Clone)]
pub struct PlannedQuery {
    pub original: String,
    /// Trimmed, whitespace-collapsed form; always the first sparse query
    pub normalized: String,
    /// Expanded variants, deduplicated case-insensitively
    pub variants: Vec<String>,
    /// Dense embedding of the normalized query
    pub embedding: Vec<f32>,
    pub locale: Option<String>,
}

impl PlannedQuery {
    /// Queries for the sparse channel: the original first, then variants
    pub fn sparse_queries(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.normalized.as_str()).chain(self.variants.iter().map(|v| v.as_str()))
    }
}

/// Query planner
pub struct QueryPlanner {
    embedder: Arc<dyn Embedder>,
    expander: Arc<dyn QueryExpander>,
    settings: PlannerSettings,
}

impl QueryPlanner {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        expander: Arc<dyn QueryExpander>,
        settings: PlannerSettings,
    ) -> Self {
        Self {
            embedder,
            expander,
            settings,
        }
    }

    /// Plan a query. Expansion failures degrade to the original query;
    /// embedding failures are fatal because dense retrieval is impossible
    /// without a vector.
    pub async fn plan(&self, query: &str, locale: Option<&str>) -> Result<PlannedQuery, RagError> {
        let normalized = normalize(query);
        if normalized.is_empty() {
            return Err(RagError::InvalidArgument("empty query".to_string()));
        }

        let variants = match self
            .expander
            .expand(&normalized, self.settings.ja_count, self.settings.en_count)
            .await
        {
            Ok(raw) => dedupe_variants(&normalized, raw, self.settings.ja_count + self.settings.en_count),
            Err(e) => {
                tracing::warn!(error = %e, "Query expansion failed, using original query only");
                Vec::new()
            }
        };

        let mut vectors = self.embedder.encode(&[normalized.clone()]).await?;
        let embedding = vectors
            .pop()
            .ok_or_else(|| RagError::Embedding("no embedding returned".to_string()))?;

        tracing::debug!(
            query = %normalized,
            variant_count = variants.len(),
            "Query planned"
        );

        Ok(PlannedQuery {
            original: query.to_string(),
            normalized,
            variants,
            embedding,
            locale: locale.map(|l| l.to_string()),
        })
    }
}

/// Trim and collapse internal whitespace
fn normalize(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deduplicate case-insensitively against the original and each other,
/// preserving service order, capped at `max`
fn dedupe_variants(original: &str, raw: Vec<String>, max: usize) -> Vec<String> {
    let mut seen = vec![original.to_lowercase()];
    let mut out = Vec::new();
    for variant in raw {
        let normalized = normalize(&variant);
        if normalized.is_empty() {
            continue;
        }
        let key = normalized.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        out.push(normalized);
        if out.len() >= max {
            break;
        }
    }
    out
}
