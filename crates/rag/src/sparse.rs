//! Sparse (keyword) search
//!
//! Two adapters behind one capability trait: an embedded Tantivy BM25 index
//! kept in sync by the indexer (the single-node default), and a client for an
//! external keyword search service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tantivy::{
    collector::TopDocs,
    query::QueryParser,
    schema::{Field, OwnedValue, Schema, TextFieldIndexing, TextOptions, STORED, STRING},
    tokenizer::{LowerCaser, RemoveLongFilter, SimpleTokenizer, TextAnalyzer},
    Index, IndexReader, IndexWriter, TantivyDocument, Term,
};

use quarry_core::DocumentVersion;

use crate::vector_store::ChunkRecord;
use crate::RagError;

/// A keyword search hit
#[derive(Debug, Clone)]
pub struct SparseHit {
    pub chunk_id: String,
    /// May be empty when the external service does not expose it
    pub article_id: String,
    /// BM25 score
    pub score: f32,
    pub text: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub document_version: DocumentVersion,
    pub tags: Vec<String>,
}

/// Sparse search capability: `search(query, user_id, limit) -> hits`
#[async_trait]
pub trait SparseSearcher: Send + Sync {
    async fn search(
        &self,
        query: &str,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SparseHit>, RagError>;
}

// ---------------------------------------------------------------------------
// Embedded Tantivy index
// ---------------------------------------------------------------------------

/// Tantivy index configuration
#[derive(Debug, Clone, Default)]
pub struct TantivySparseIndexConfig {
    /// On-disk index path; in-RAM when unset
    pub index_path: Option<String>,
}

struct SparseInner {
    index: Index,
    reader: IndexReader,
    writer: RwLock<Option<IndexWriter>>,
    chunk_id_field: Field,
    article_id_field: Field,
    text_field: Field,
    title_field: Field,
    url_field: Field,
    published_at_field: Field,
    version_field: Field,
    tags_field: Field,
}

/// Embedded BM25 index over chunk text and titles.
///
/// Searches run under `spawn_blocking`; Tantivy work is CPU-bound and must
/// not block the async executor.
#[derive(Clone)]
pub struct TantivySparseIndex {
    inner: Arc<SparseInner>,
}

impl TantivySparseIndex {
    pub fn new(config: TantivySparseIndexConfig) -> Result<Self, RagError> {
        let mut schema_builder = Schema::builder();

        let text_options = TextOptions::default()
            .set_indexing_options(
                TextFieldIndexing::default()
                    .set_tokenizer("multilingual")
                    .set_index_option(tantivy::schema::IndexRecordOption::WithFreqsAndPositions),
            )
            .set_stored();

        let chunk_id_field = schema_builder.add_text_field("chunk_id", STRING | STORED);
        let article_id_field = schema_builder.add_text_field("article_id", STRING | STORED);
        let text_field = schema_builder.add_text_field("text", text_options.clone());
        let title_field = schema_builder.add_text_field("title", text_options);
        let url_field = schema_builder.add_text_field("url", STRING | STORED);
        let published_at_field = schema_builder.add_text_field("published_at", STRING | STORED);
        let version_field = schema_builder.add_i64_field("version", STORED);
        let tags_field = schema_builder.add_text_field("tags", STRING | STORED);

        let schema = schema_builder.build();

        let index = if let Some(ref path) = config.index_path {
            let dir = tantivy::directory::MmapDirectory::open(Path::new(path))
                .map_err(|e| RagError::Index(e.to_string()))?;
            Index::open_or_create(dir, schema.clone())
                .map_err(|e| RagError::Index(e.to_string()))?
        } else {
            Index::create_in_ram(schema.clone())
        };

        // SimpleTokenizer keeps CJK runs intact between punctuation, which is
        // serviceable for short Japanese queries.
        // TODO: register a Lindera-based tokenizer for proper Japanese
        // segmentation.
        let tokenizer = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(100))
            .filter(LowerCaser)
            .build();
        index.tokenizers().register("multilingual", tokenizer);

        let reader = index.reader().map_err(|e| RagError::Index(e.to_string()))?;

        let writer = index
            .writer(50_000_000)
            .map_err(|e| RagError::Index(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(SparseInner {
                index,
                reader,
                writer: RwLock::new(Some(writer)),
                chunk_id_field,
                article_id_field,
                text_field,
                title_field,
                url_field,
                published_at_field,
                version_field,
                tags_field,
            }),
        })
    }

    /// Replace the indexed chunks of an article with a new set. Called by the
    /// indexer after the version registry commit.
    pub fn replace_article(
        &self,
        article_id: &str,
        records: &[ChunkRecord],
        tags: &[String],
    ) -> Result<(), RagError> {
        let inner = &self.inner;
        let mut guard = inner.writer.write();
        let writer = guard
            .as_mut()
            .ok_or_else(|| RagError::Index("writer not available".to_string()))?;

        writer.delete_term(Term::from_field_text(inner.article_id_field, article_id));

        for record in records {
            let mut doc = TantivyDocument::default();
            doc.add_text(inner.chunk_id_field, &record.chunk_id);
            doc.add_text(inner.article_id_field, &record.article_id);
            doc.add_text(inner.text_field, &record.text);
            doc.add_text(inner.title_field, &record.title);
            doc.add_text(inner.url_field, &record.url);
            if let Some(at) = record.published_at {
                doc.add_text(inner.published_at_field, at.to_rfc3339());
            }
            doc.add_i64(inner.version_field, record.document_version);
            for tag in tags {
                doc.add_text(inner.tags_field, tag);
            }

            writer
                .add_document(doc)
                .map_err(|e| RagError::Index(e.to_string()))?;
        }

        writer.commit().map_err(|e| RagError::Index(e.to_string()))?;
        inner
            .reader
            .reload()
            .map_err(|e| RagError::Index(e.to_string()))?;

        Ok(())
    }

    /// Drop every chunk of an article from the index
    pub fn delete_article(&self, article_id: &str) -> Result<(), RagError> {
        self.replace_article(article_id, &[], &[])
    }

    fn search_sync(&self, query: &str, limit: usize) -> Result<Vec<SparseHit>, RagError> {
        let inner = &self.inner;
        let searcher = inner.reader.searcher();
        let query_parser =
            QueryParser::for_index(&inner.index, vec![inner.text_field, inner.title_field]);

        // Lenient parsing: user questions routinely contain characters the
        // query grammar reserves
        let (parsed, errors) = query_parser.parse_query_lenient(query);
        if !errors.is_empty() {
            tracing::debug!(query, ?errors, "Lenient query parse");
        }

        let top_docs = searcher
            .search(&parsed, &TopDocs::with_limit(limit))
            .map_err(|e| RagError::Search(e.to_string()))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(doc_address)
                .map_err(|e| RagError::Search(e.to_string()))?;

            let text_of = |field: Field| -> Option<String> {
                doc.get_first(field).and_then(|v| match v {
                    OwnedValue::Str(s) => Some(s.clone()),
                    _ => None,
                })
            };

            let version = doc
                .get_first(inner.version_field)
                .and_then(|v| match v {
                    OwnedValue::I64(n) => Some(*n),
                    _ => None,
                })
                .unwrap_or(0);

            let tags = doc
                .get_all(inner.tags_field)
                .filter_map(|v| match v {
                    OwnedValue::Str(s) => Some(s.clone()),
                    _ => None,
                })
                .collect();

            hits.push(SparseHit {
                chunk_id: text_of(inner.chunk_id_field).unwrap_or_default(),
                article_id: text_of(inner.article_id_field).unwrap_or_default(),
                score,
                text: text_of(inner.text_field).unwrap_or_default(),
                title: text_of(inner.title_field),
                url: text_of(inner.url_field),
                published_at: text_of(inner.published_at_field)
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
                document_version: version,
                tags,
            });
        }

        Ok(hits)
    }
}

#[async_trait]
impl SparseSearcher for TantivySparseIndex {
    async fn search(
        &self,
        query: &str,
        _user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SparseHit>, RagError> {
        let this = self.clone();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || this.search_sync(&query, limit))
            .await
            .map_err(|e| RagError::Search(format!("sparse search task failed: {}", e)))?
    }
}

// ---------------------------------------------------------------------------
// External search service
// ---------------------------------------------------------------------------

/// HTTP sparse search configuration
#[derive(Debug, Clone)]
pub struct HttpSparseSearchConfig {
    pub endpoint: String,
    pub timeout: Duration,
}

impl Default for HttpSparseSearchConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:7700".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl HttpSparseSearchConfig {
    pub fn from_settings(cfg: &quarry_config::SparseConfig) -> Self {
        Self {
            endpoint: cfg.endpoint.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HttpSearchResponse {
    hits: Vec<HttpSearchHit>,
}

#[derive(Debug, Deserialize)]
struct HttpSearchHit {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    article_id: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    document_version: Option<i64>,
    #[serde(default)]
    score: Option<f32>,
}

/// Client for an external keyword search service
pub struct HttpSparseSearch {
    client: Client,
    config: HttpSparseSearchConfig,
}

impl HttpSparseSearch {
    pub fn new(config: HttpSparseSearchConfig) -> Result<Self, RagError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RagError::Search(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl SparseSearcher for HttpSparseSearch {
    async fn search(
        &self,
        query: &str,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SparseHit>, RagError> {
        let url = format!("{}/v1/search", self.config.endpoint);
        let body = serde_json::json!({
            "query": query,
            "user_id": user_id,
            "limit": limit,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::transport("sparse_search", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(RagError::Connection {
                    dependency: "sparse_search",
                    message: format!("server error {}: {}", status, text),
                });
            }
            return Err(RagError::Search(format!(
                "search request rejected: {} - {}",
                status, text
            )));
        }

        let parsed: HttpSearchResponse = response
            .json()
            .await
            .map_err(|e| RagError::Search(format!("failed to parse response: {}", e)))?;

        let hit_count = parsed.hits.len();
        let hits = parsed
            .hits
            .into_iter()
            .enumerate()
            .map(|(i, hit)| SparseHit {
                chunk_id: hit.id,
                article_id: hit.article_id.unwrap_or_default(),
                // Services without scores get rank-derived ones; fusion only
                // uses ranks anyway
                score: hit.score.unwrap_or((hit_count - i) as f32),
                text: hit.content,
                title: hit.title,
                url: hit.url,
                published_at: hit.published_at,
                document_version: hit.document_version.unwrap_or(0),
                tags: hit.tags,
            })
            .collect();

        Ok(hits)
    }
}
