//! Document version registry
//!
//! The metadata backing of the versioned upsert transaction: one row per
//! article holding the current document version. Readers filter retrieval
//! hits against this registry; writers commit a new version with a
//! compare-and-set, so a reader either sees the whole prior version or the
//! whole new one.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;

use quarry_core::{DocumentVersion, NO_VERSION};

use crate::client::ScyllaClient;
use crate::error::PersistenceError;

/// Version registry capability
#[async_trait]
pub trait VersionRegistry: Send + Sync {
    /// Current version for an article; `NO_VERSION` when none is current
    async fn current(&self, article_id: &str) -> Result<DocumentVersion, PersistenceError>;

    /// Current versions for a batch of articles; absent ids map to `NO_VERSION`
    async fn current_many(
        &self,
        article_ids: &[String],
    ) -> Result<HashMap<String, DocumentVersion>, PersistenceError>;

    /// Compare-and-set the current version. Returns false when the stored
    /// version no longer equals `expected` (a concurrent upsert won).
    async fn set_current(
        &self,
        article_id: &str,
        expected: DocumentVersion,
        new: DocumentVersion,
    ) -> Result<bool, PersistenceError>;
}

/// In-memory registry for tests and single-node development
#[derive(Default)]
pub struct MemoryVersionRegistry {
    versions: Mutex<HashMap<String, DocumentVersion>>,
}

impl MemoryVersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionRegistry for MemoryVersionRegistry {
    async fn current(&self, article_id: &str) -> Result<DocumentVersion, PersistenceError> {
        Ok(*self
            .versions
            .lock()
            .get(article_id)
            .unwrap_or(&NO_VERSION))
    }

    async fn current_many(
        &self,
        article_ids: &[String],
    ) -> Result<HashMap<String, DocumentVersion>, PersistenceError> {
        let versions = self.versions.lock();
        Ok(article_ids
            .iter()
            .map(|id| (id.clone(), *versions.get(id).unwrap_or(&NO_VERSION)))
            .collect())
    }

    async fn set_current(
        &self,
        article_id: &str,
        expected: DocumentVersion,
        new: DocumentVersion,
    ) -> Result<bool, PersistenceError> {
        let mut versions = self.versions.lock();
        let stored = *versions.get(article_id).unwrap_or(&NO_VERSION);
        if stored != expected {
            return Ok(false);
        }
        versions.insert(article_id.to_string(), new);
        Ok(true)
    }
}

/// ScyllaDB registry; the CAS is a lightweight transaction
#[derive(Clone)]
pub struct ScyllaVersionRegistry {
    client: ScyllaClient,
}

impl ScyllaVersionRegistry {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VersionRegistry for ScyllaVersionRegistry {
    async fn current(&self, article_id: &str) -> Result<DocumentVersion, PersistenceError> {
        let query = format!(
            "SELECT current_version FROM {}.article_versions WHERE article_id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (article_id,))
            .await?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                let (version,): (i64,) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                return Ok(version);
            }
        }
        Ok(NO_VERSION)
    }

    async fn current_many(
        &self,
        article_ids: &[String],
    ) -> Result<HashMap<String, DocumentVersion>, PersistenceError> {
        let mut out: HashMap<String, DocumentVersion> = article_ids
            .iter()
            .map(|id| (id.clone(), NO_VERSION))
            .collect();
        if article_ids.is_empty() {
            return Ok(out);
        }

        let query = format!(
            "SELECT article_id, current_version FROM {}.article_versions WHERE article_id IN ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (article_ids.to_vec(),))
            .await?;

        if let Some(rows) = result.rows {
            for row in rows {
                let (article_id, version): (String, i64) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                out.insert(article_id, version);
            }
        }
        Ok(out)
    }

    async fn set_current(
        &self,
        article_id: &str,
        expected: DocumentVersion,
        new: DocumentVersion,
    ) -> Result<bool, PersistenceError> {
        let now_ms = Utc::now().timestamp_millis();

        // An article seen for the first time has no row yet; the conditional
        // update cannot apply against a missing row, so fall through to an
        // insert-if-not-exists.
        let update = format!(
            "UPDATE {}.article_versions
             SET current_version = ?, updated_at = ?
             WHERE article_id = ? IF current_version = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(update, (new, now_ms, article_id, expected))
            .await?;
        if ScyllaClient::lwt_applied(&result) {
            return Ok(true);
        }

        if expected == NO_VERSION {
            let insert = format!(
                "INSERT INTO {}.article_versions (article_id, current_version, updated_at)
                 VALUES (?, ?, ?) IF NOT EXISTS",
                self.client.keyspace()
            );
            let result = self
                .client
                .session()
                .query_unpaged(insert, (article_id, new, now_ms))
                .await?;
            return Ok(ScyllaClient::lwt_applied(&result));
        }

        Ok(false)
    }
}
