//! Durable job queue
//!
//! `Claim` atomically hands the oldest eligible job (new, or in-progress with
//! an expired lease) to exactly one worker. Completion is idempotent; failure
//! re-queues the job until the attempt budget is exhausted, then parks it in
//! the dead-letter table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use quarry_core::{JobStatus, JobType, RagJob};

use crate::client::ScyllaClient;
use crate::error::PersistenceError;

/// Job queue capability
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: &RagJob) -> Result<(), PersistenceError>;

    /// Claim the oldest eligible job of one of `types`, holding it under a
    /// lease. Returns `None` when nothing is eligible.
    async fn claim(
        &self,
        worker_id: &str,
        types: &[JobType],
        lease: Duration,
    ) -> Result<Option<RagJob>, PersistenceError>;

    /// Mark a job done. Idempotent on `job_id`.
    async fn complete(&self, job_id: Uuid) -> Result<(), PersistenceError>;

    /// Record a failure. The job re-enters the queue until `attempts`
    /// reaches the store's budget, then transitions to dead.
    async fn fail(&self, job_id: Uuid, err: &str) -> Result<(), PersistenceError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Mutex-guarded job store with exact queue semantics; used by tests and when
/// persistence is disabled.
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, RagJob>>,
    max_attempts: u32,
}

impl MemoryJobStore {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            max_attempts,
        }
    }

    /// Snapshot a job, for tests and diagnostics
    pub fn get(&self, job_id: Uuid) -> Option<RagJob> {
        self.jobs.lock().get(&job_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: &RagJob) -> Result<(), PersistenceError> {
        self.jobs.lock().insert(job.id, job.clone());
        Ok(())
    }

    async fn claim(
        &self,
        worker_id: &str,
        types: &[JobType],
        lease: Duration,
    ) -> Result<Option<RagJob>, PersistenceError> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock();

        let eligible = |job: &RagJob| -> bool {
            if !types.contains(&job.job_type) {
                return false;
            }
            match job.status {
                JobStatus::New => true,
                JobStatus::InProgress => job.lease_until.map_or(false, |until| until < now),
                _ => false,
            }
        };

        // FIFO by created_at, ties by id
        let next = jobs
            .values()
            .filter(|j| eligible(j))
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let job = jobs.get_mut(&id).ok_or_else(|| {
            PersistenceError::InvalidData("claimed job vanished".to_string())
        })?;
        job.status = JobStatus::InProgress;
        job.lease_until = Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
        job.updated_at = now;

        tracing::debug!(job_id = %id, worker_id, "Job claimed");
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), PersistenceError> {
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.get_mut(&job_id) {
            job.status = JobStatus::Done;
            job.lease_until = None;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, err: &str) -> Result<(), PersistenceError> {
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.get_mut(&job_id) {
            job.attempts += 1;
            job.last_error = Some(err.to_string());
            job.lease_until = None;
            job.updated_at = Utc::now();
            job.status = if job.attempts >= self.max_attempts {
                JobStatus::Dead
            } else {
                JobStatus::New
            };
            if job.status == JobStatus::Dead {
                tracing::warn!(job_id = %job_id, attempts = job.attempts, "Job dead");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScyllaDB implementation
// ---------------------------------------------------------------------------

/// ScyllaDB job store. One queue partition clustered by `(created_at, id)`;
/// claims race through LWT conditional updates keyed on the observed
/// `(status, updated_at)` of the row.
#[derive(Clone)]
pub struct ScyllaJobStore {
    client: ScyllaClient,
    max_attempts: u32,
}

/// Single queue partition; FIFO needs one clustering dimension
const QUEUE_SHARD: i32 = 0;

/// Rows examined per claim attempt
const CLAIM_WINDOW: i32 = 64;

impl ScyllaJobStore {
    pub fn new(client: ScyllaClient, max_attempts: u32) -> Self {
        Self {
            client,
            max_attempts,
        }
    }

    async fn created_at_for(&self, job_id: Uuid) -> Result<Option<i64>, PersistenceError> {
        let query = format!(
            "SELECT created_at FROM {}.rag_jobs_by_id WHERE id = ?",
            self.client.keyspace()
        );
        let result = self.client.session().query_unpaged(query, (job_id,)).await?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                let (created_at,): (i64,) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                return Ok(Some(created_at));
            }
        }
        Ok(None)
    }

    #[allow(clippy::type_complexity)]
    fn row_to_job(
        row: scylla::frame::response::result::Row,
    ) -> Result<RagJob, PersistenceError> {
        let (created_at, id, job_type, payload, status, attempts, last_error, updated_at, lease_until): (
            i64,
            Uuid,
            String,
            String,
            String,
            i32,
            Option<String>,
            i64,
            Option<i64>,
        ) = row
            .into_typed()
            .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;

        Ok(RagJob {
            id,
            job_type: JobType::parse(&job_type)
                .ok_or_else(|| PersistenceError::InvalidData(format!("bad job_type {}", job_type)))?,
            payload: serde_json::from_str(&payload)
                .map_err(|e| PersistenceError::InvalidData(e.to_string()))?,
            status: JobStatus::parse(&status)
                .ok_or_else(|| PersistenceError::InvalidData(format!("bad status {}", status)))?,
            attempts: attempts.max(0) as u32,
            last_error,
            created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
            updated_at: DateTime::from_timestamp_millis(updated_at).unwrap_or_else(Utc::now),
            lease_until: lease_until.filter(|ms| *ms > 0).and_then(DateTime::from_timestamp_millis),
        })
    }
}

#[async_trait]
impl JobStore for ScyllaJobStore {
    async fn enqueue(&self, job: &RagJob) -> Result<(), PersistenceError> {
        let created_ms = job.created_at.timestamp_millis();

        let insert = format!(
            "INSERT INTO {}.rag_jobs (
                shard, created_at, id, job_type, payload, status,
                attempts, last_error, updated_at, lease_until, lease_owner
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(
                insert,
                (
                    QUEUE_SHARD,
                    created_ms,
                    job.id,
                    job.job_type.as_str(),
                    job.payload.to_string(),
                    job.status.as_str(),
                    job.attempts as i32,
                    &job.last_error,
                    job.updated_at.timestamp_millis(),
                    0i64,
                    "",
                ),
            )
            .await?;

        let lookup = format!(
            "INSERT INTO {}.rag_jobs_by_id (id, created_at) VALUES (?, ?)",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(lookup, (job.id, created_ms))
            .await?;

        tracing::info!(job_id = %job.id, job_type = %job.job_type.as_str(), "Job enqueued");
        Ok(())
    }

    async fn claim(
        &self,
        worker_id: &str,
        types: &[JobType],
        lease: Duration,
    ) -> Result<Option<RagJob>, PersistenceError> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();

        let select = format!(
            "SELECT created_at, id, job_type, payload, status, attempts,
                    last_error, updated_at, lease_until
             FROM {}.rag_jobs WHERE shard = ? LIMIT {}",
            self.client.keyspace(),
            CLAIM_WINDOW
        );
        let result = self
            .client
            .session()
            .query_unpaged(select, (QUEUE_SHARD,))
            .await?;

        let rows = match result.rows {
            Some(rows) => rows,
            None => return Ok(None),
        };

        for row in rows {
            let job = Self::row_to_job(row)?;
            if !types.contains(&job.job_type) {
                continue;
            }
            let reclaimable = job.status == JobStatus::InProgress
                && job.lease_until.map_or(false, |until| until < now);
            if job.status != JobStatus::New && !reclaimable {
                continue;
            }

            // Conditional update keyed on the observed row state; only one
            // competing claimant can apply it.
            let update = format!(
                "UPDATE {}.rag_jobs
                 SET status = ?, lease_until = ?, lease_owner = ?, updated_at = ?
                 WHERE shard = ? AND created_at = ? AND id = ?
                 IF status = ? AND updated_at = ?",
                self.client.keyspace()
            );
            let lease_until_ms = now_ms + lease.as_millis() as i64;
            let applied = self
                .client
                .session()
                .query_unpaged(
                    update,
                    (
                        JobStatus::InProgress.as_str(),
                        lease_until_ms,
                        worker_id,
                        now_ms,
                        QUEUE_SHARD,
                        job.created_at.timestamp_millis(),
                        job.id,
                        job.status.as_str(),
                        job.updated_at.timestamp_millis(),
                    ),
                )
                .await
                .map(|r| ScyllaClient::lwt_applied(&r))?;

            if applied {
                let mut claimed = job;
                claimed.status = JobStatus::InProgress;
                claimed.lease_until = DateTime::from_timestamp_millis(lease_until_ms);
                claimed.updated_at = now;
                tracing::debug!(job_id = %claimed.id, worker_id, "Job claimed");
                return Ok(Some(claimed));
            }
            // Lost the race for this row; try the next eligible one
        }

        Ok(None)
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), PersistenceError> {
        let Some(created_ms) = self.created_at_for(job_id).await? else {
            // Already completed and reclaimed; idempotent no-op
            return Ok(());
        };

        let delete = format!(
            "DELETE FROM {}.rag_jobs WHERE shard = ? AND created_at = ? AND id = ?",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(delete, (QUEUE_SHARD, created_ms, job_id))
            .await?;

        let delete_lookup = format!(
            "DELETE FROM {}.rag_jobs_by_id WHERE id = ?",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(delete_lookup, (job_id,))
            .await?;

        tracing::info!(job_id = %job_id, "Job completed");
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, err: &str) -> Result<(), PersistenceError> {
        let Some(created_ms) = self.created_at_for(job_id).await? else {
            return Ok(());
        };

        let select = format!(
            "SELECT created_at, id, job_type, payload, status, attempts,
                    last_error, updated_at, lease_until
             FROM {}.rag_jobs WHERE shard = ? AND created_at = ? AND id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(select, (QUEUE_SHARD, created_ms, job_id))
            .await?;

        let Some(row) = result.rows.and_then(|rows| rows.into_iter().next()) else {
            return Ok(());
        };
        let job = Self::row_to_job(row)?;
        let attempts = job.attempts + 1;
        let now_ms = Utc::now().timestamp_millis();

        if attempts >= self.max_attempts {
            // Park in the dead-letter table and drop from the queue
            let dead = format!(
                "INSERT INTO {}.rag_jobs_dead (
                    id, job_type, payload, attempts, last_error, created_at, died_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)",
                self.client.keyspace()
            );
            self.client
                .session()
                .query_unpaged(
                    dead,
                    (
                        job.id,
                        job.job_type.as_str(),
                        job.payload.to_string(),
                        attempts as i32,
                        err,
                        created_ms,
                        now_ms,
                    ),
                )
                .await?;

            let delete = format!(
                "DELETE FROM {}.rag_jobs WHERE shard = ? AND created_at = ? AND id = ?",
                self.client.keyspace()
            );
            self.client
                .session()
                .query_unpaged(delete, (QUEUE_SHARD, created_ms, job_id))
                .await?;
            let delete_lookup = format!(
                "DELETE FROM {}.rag_jobs_by_id WHERE id = ?",
                self.client.keyspace()
            );
            self.client
                .session()
                .query_unpaged(delete_lookup, (job_id,))
                .await?;

            tracing::warn!(job_id = %job_id, attempts, error = err, "Job dead");
            return Ok(());
        }

        let update = format!(
            "UPDATE {}.rag_jobs
             SET status = ?, attempts = ?, last_error = ?, lease_until = ?, updated_at = ?
             WHERE shard = ? AND created_at = ? AND id = ?",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(
                update,
                (
                    JobStatus::New.as_str(),
                    attempts as i32,
                    err,
                    0i64,
                    now_ms,
                    QUEUE_SHARD,
                    created_ms,
                    job_id,
                ),
            )
            .await?;

        tracing::info!(job_id = %job_id, attempts, error = err, "Job failed, re-queued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn job(article: &str) -> RagJob {
        RagJob::new(
            JobType::BackfillArticle,
            serde_json::json!({ "article_id": article }),
        )
    }

    const ALL_TYPES: &[JobType] = &[
        JobType::BackfillArticle,
        JobType::ReembedArticle,
        JobType::DeleteArticle,
    ];

    #[tokio::test]
    async fn test_claim_is_fifo() {
        let store = MemoryJobStore::new(5);
        let mut first = job("a1");
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = job("a2");

        store.enqueue(&second).await.unwrap();
        store.enqueue(&first).await.unwrap();

        let claimed = store
            .claim("w1", ALL_TYPES, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first.id);
    }

    #[tokio::test]
    async fn test_claimed_job_is_exclusive() {
        let store = MemoryJobStore::new(5);
        store.enqueue(&job("a1")).await.unwrap();

        let first = store
            .claim("w1", ALL_TYPES, Duration::from_secs(30))
            .await
            .unwrap();
        let second = store
            .claim("w2", ALL_TYPES, Duration::from_secs(30))
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_deliver_each_job_once() {
        let store = Arc::new(MemoryJobStore::new(5));
        for i in 0..10 {
            store.enqueue(&job(&format!("a{}", i))).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..4 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let worker_id = format!("w{}", w);
                let mut claimed = Vec::new();
                while let Some(job) = store
                    .claim(&worker_id, ALL_TYPES, Duration::from_secs(30))
                    .await
                    .unwrap()
                {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 10, "every job delivered");
        assert_eq!(all.len(), 10, "no job delivered twice");
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let store = MemoryJobStore::new(5);
        store.enqueue(&job("a1")).await.unwrap();

        let first = store
            .claim("w1", ALL_TYPES, Duration::from_millis(5))
            .await
            .unwrap();
        assert!(first.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = store
            .claim("w2", ALL_TYPES, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(second.is_some());
        assert_eq!(second.unwrap().id, first.unwrap().id);
    }

    #[tokio::test]
    async fn test_fail_requeues_until_dead() {
        let store = MemoryJobStore::new(2);
        let j = job("a1");
        store.enqueue(&j).await.unwrap();

        store
            .claim("w1", ALL_TYPES, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        store.fail(j.id, "boom").await.unwrap();
        assert_eq!(store.get(j.id).unwrap().status, JobStatus::New);

        store
            .claim("w1", ALL_TYPES, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        store.fail(j.id, "boom again").await.unwrap();

        let dead = store.get(j.id).unwrap();
        assert_eq!(dead.status, JobStatus::Dead);
        assert_eq!(dead.attempts, 2);
        assert_eq!(dead.last_error.as_deref(), Some("boom again"));

        // Dead jobs are not claimable
        let claimed = store
            .claim("w1", ALL_TYPES, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let store = MemoryJobStore::new(5);
        let j = job("a1");
        store.enqueue(&j).await.unwrap();
        store
            .claim("w1", ALL_TYPES, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        store.complete(j.id).await.unwrap();
        store.complete(j.id).await.unwrap();
        assert_eq!(store.get(j.id).unwrap().status, JobStatus::Done);
    }

    #[tokio::test]
    async fn test_claim_filters_by_type() {
        let store = MemoryJobStore::new(5);
        store.enqueue(&job("a1")).await.unwrap();

        let claimed = store
            .claim("w1", &[JobType::DeleteArticle], Duration::from_secs(30))
            .await
            .unwrap();
        assert!(claimed.is_none());

        let claimed = store
            .claim("w1", &[JobType::BackfillArticle], Duration::from_secs(30))
            .await
            .unwrap();
        assert!(claimed.is_some());
    }
}
