//! Vector index
//!
//! Write side: chunks tagged with their document version. Read side: filtered
//! ANN search that excludes tombstoned points. The version registry, not this
//! index, decides which version of an article is current; retrieval filters
//! hits against the registry after the ANN query.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use qdrant_client::{
    qdrant::{
        value::Kind, Condition, CreateCollectionBuilder, Distance, Filter, PointStruct, Range,
        SearchPointsBuilder, SetPayloadPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
    },
    Qdrant,
};
use std::collections::HashMap;

use quarry_core::DocumentVersion;

use crate::RagError;

/// A chunk as written to the index
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// UUID string; also the point id
    pub chunk_id: String,
    pub article_id: String,
    pub ordinal: usize,
    pub text: String,
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub document_version: DocumentVersion,
    pub embedding: Vec<f32>,
}

/// A dense search hit
#[derive(Debug, Clone)]
pub struct DenseHit {
    pub chunk_id: String,
    pub article_id: String,
    /// Cosine similarity; Qdrant returns similarity directly for cosine
    /// collections, so no score transform is applied
    pub similarity: f32,
    pub text: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub document_version: DocumentVersion,
}

/// Vector store capability: versioned upsert, filtered ANN, tombstone
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection when missing
    async fn ensure_ready(&self) -> Result<(), RagError>;

    /// Write chunk points. Points are not visible as "current" until the
    /// version registry commit flips the article's version.
    async fn upsert_chunks(&self, records: &[ChunkRecord]) -> Result<(), RagError>;

    /// ANN query over non-tombstoned points, optionally restricted to a set
    /// of articles
    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        article_ids: Option<&[String]>,
    ) -> Result<Vec<DenseHit>, RagError>;

    /// Mark every point of `article_id` with version below `before` as
    /// tombstoned. Physical reclamation happens out-of-band.
    async fn tombstone(&self, article_id: &str, before: DocumentVersion) -> Result<(), RagError>;
}

// ---------------------------------------------------------------------------
// Qdrant adapter
// ---------------------------------------------------------------------------

/// Qdrant adapter configuration
#[derive(Debug, Clone)]
pub struct QdrantIndexConfig {
    pub endpoint: String,
    pub collection: String,
    pub vector_dim: usize,
    pub api_key: Option<String>,
}

impl QdrantIndexConfig {
    pub fn from_settings(store: &quarry_config::VectorStoreConfig, vector_dim: usize) -> Self {
        Self {
            endpoint: store.endpoint.clone(),
            collection: store.collection.clone(),
            vector_dim,
            api_key: store.api_key.clone(),
        }
    }
}

/// Qdrant-backed vector index
pub struct QdrantIndex {
    client: Qdrant,
    config: QdrantIndexConfig,
}

impl QdrantIndex {
    pub fn new(config: QdrantIndexConfig) -> Result<Self, RagError> {
        let mut builder = Qdrant::from_url(&config.endpoint);
        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
            tracing::info!("Qdrant connection using API key authentication");
        }

        let client = builder
            .build()
            .map_err(|e| RagError::Connection {
                dependency: "vector_store",
                message: e.to_string(),
            })?;

        Ok(Self { client, config })
    }

    fn base_filter(article_ids: Option<&[String]>) -> Filter {
        let mut conditions = vec![Condition::matches("tombstoned", false)];
        if let Some(ids) = article_ids {
            conditions.push(Condition::matches("article_id", ids.to_vec()));
        }
        Filter::must(conditions)
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_ready(&self) -> Result<(), RagError> {
        let exists = self
            .client
            .collection_exists(&self.config.collection)
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;

        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.config.collection).vectors_config(
                        VectorParamsBuilder::new(
                            self.config.vector_dim as u64,
                            Distance::Cosine,
                        ),
                    ),
                )
                .await
                .map_err(|e| RagError::VectorStore(e.to_string()))?;
            tracing::info!(collection = %self.config.collection, "Created Qdrant collection");
        }

        Ok(())
    }

    async fn upsert_chunks(&self, records: &[ChunkRecord]) -> Result<(), RagError> {
        if records.is_empty() {
            return Ok(());
        }

        let points: Vec<PointStruct> = records
            .iter()
            .map(|record| {
                let mut payload: HashMap<String, qdrant_client::qdrant::Value> = HashMap::new();
                payload.insert("article_id".to_string(), record.article_id.clone().into());
                payload.insert("ordinal".to_string(), (record.ordinal as i64).into());
                payload.insert("text".to_string(), record.text.clone().into());
                payload.insert("title".to_string(), record.title.clone().into());
                payload.insert("url".to_string(), record.url.clone().into());
                payload.insert("version".to_string(), record.document_version.into());
                payload.insert("tombstoned".to_string(), false.into());
                if let Some(at) = record.published_at {
                    payload.insert("published_at".to_string(), at.to_rfc3339().into());
                }

                PointStruct::new(record.chunk_id.clone(), record.embedding.clone(), payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.config.collection, points))
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;

        Ok(())
    }

    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        article_ids: Option<&[String]>,
    ) -> Result<Vec<DenseHit>, RagError> {
        let search_builder = SearchPointsBuilder::new(
            &self.config.collection,
            embedding.to_vec(),
            limit as u64,
        )
        .filter(Self::base_filter(article_ids))
        .with_payload(true);

        let results = self
            .client
            .search_points(search_builder)
            .await
            .map_err(|e| RagError::Connection {
                dependency: "vector_store",
                message: e.to_string(),
            })?;

        let hits = results
            .result
            .into_iter()
            .map(|point| {
                let mut text = String::new();
                let mut article_id = String::new();
                let mut title = None;
                let mut url = None;
                let mut published_at = None;
                let mut version = 0i64;

                for (key, value) in point.payload {
                    match (key.as_str(), value.kind) {
                        ("text", Some(Kind::StringValue(s))) => text = s,
                        ("article_id", Some(Kind::StringValue(s))) => article_id = s,
                        ("title", Some(Kind::StringValue(s))) => title = Some(s),
                        ("url", Some(Kind::StringValue(s))) => url = Some(s),
                        ("published_at", Some(Kind::StringValue(s))) => {
                            published_at = DateTime::parse_from_rfc3339(&s)
                                .ok()
                                .map(|dt| dt.with_timezone(&Utc));
                        }
                        ("version", Some(Kind::IntegerValue(v))) => version = v,
                        _ => {}
                    }
                }

                let chunk_id = point
                    .id
                    .and_then(|pid| match pid.point_id_options {
                        Some(qdrant_client::qdrant::point_id::PointIdOptions::Uuid(u)) => Some(u),
                        Some(qdrant_client::qdrant::point_id::PointIdOptions::Num(n)) => {
                            Some(n.to_string())
                        }
                        None => None,
                    })
                    .unwrap_or_default();

                DenseHit {
                    chunk_id,
                    article_id,
                    similarity: point.score,
                    text,
                    title,
                    url,
                    published_at,
                    document_version: version,
                }
            })
            .collect();

        Ok(hits)
    }

    async fn tombstone(&self, article_id: &str, before: DocumentVersion) -> Result<(), RagError> {
        let filter = Filter::must([
            Condition::matches("article_id", article_id.to_string()),
            Condition::range(
                "version",
                Range {
                    lt: Some(before as f64),
                    ..Default::default()
                },
            ),
        ]);

        let mut payload: HashMap<String, qdrant_client::qdrant::Value> = HashMap::new();
        payload.insert("tombstoned".to_string(), true.into());

        self.client
            .set_payload(
                SetPayloadPointsBuilder::new(&self.config.collection, payload)
                    .points_selector(filter),
            )
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory index
// ---------------------------------------------------------------------------

struct StoredPoint {
    record: ChunkRecord,
    tombstoned: bool,
}

/// Brute-force cosine index for tests and single-node development
#[derive(Default)]
pub struct MemoryIndex {
    points: RwLock<Vec<StoredPoint>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Visible (non-tombstoned) point count, for tests
    pub fn live_len(&self) -> usize {
        self.points.read().iter().filter(|p| !p.tombstoned).count()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_ready(&self) -> Result<(), RagError> {
        Ok(())
    }

    async fn upsert_chunks(&self, records: &[ChunkRecord]) -> Result<(), RagError> {
        let mut points = self.points.write();
        for record in records {
            if let Some(existing) = points
                .iter_mut()
                .find(|p| p.record.chunk_id == record.chunk_id)
            {
                existing.record = record.clone();
                existing.tombstoned = false;
            } else {
                points.push(StoredPoint {
                    record: record.clone(),
                    tombstoned: false,
                });
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        article_ids: Option<&[String]>,
    ) -> Result<Vec<DenseHit>, RagError> {
        let points = self.points.read();
        let mut hits: Vec<DenseHit> = points
            .iter()
            .filter(|p| !p.tombstoned)
            .filter(|p| {
                article_ids.map_or(true, |ids| ids.contains(&p.record.article_id))
            })
            .map(|p| DenseHit {
                chunk_id: p.record.chunk_id.clone(),
                article_id: p.record.article_id.clone(),
                similarity: cosine(embedding, &p.record.embedding),
                text: p.record.text.clone(),
                title: Some(p.record.title.clone()),
                url: Some(p.record.url.clone()),
                published_at: p.record.published_at,
                document_version: p.record.document_version,
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn tombstone(&self, article_id: &str, before: DocumentVersion) -> Result<(), RagError> {
        let mut points = self.points.write();
        for point in points.iter_mut() {
            if point.record.article_id == article_id && point.record.document_version < before {
                point.tombstoned = true;
            }
        }
        Ok(())
    }
}
