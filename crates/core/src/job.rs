//! Background job types
//!
//! Jobs are enqueued at the HTTP boundary and claimed by workers under a
//! lease. A job's effective status transitions `new -> in_progress ->
//! done | failed`; `failed` re-enters `new` until the attempt budget is
//! exhausted, then the job is `dead`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of background work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    BackfillArticle,
    ReembedArticle,
    DeleteArticle,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BackfillArticle => "backfill_article",
            Self::ReembedArticle => "reembed_article",
            Self::DeleteArticle => "delete_article",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backfill_article" => Some(Self::BackfillArticle),
            "reembed_article" => Some(Self::ReembedArticle),
            "delete_article" => Some(Self::DeleteArticle),
            _ => None,
        }
    }
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    New,
    InProgress,
    Done,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }
}

/// A queued background task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagJob {
    pub id: Uuid,
    pub job_type: JobType,
    /// Opaque payload; indexing jobs carry `{"article_id": ...}`
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Exclusive hold; a job with an expired lease is reclaimable
    pub lease_until: Option<DateTime<Utc>>,
}

impl RagJob {
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type,
            payload,
            status: JobStatus::New,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            lease_until: None,
        }
    }

    /// Article id for the indexing job types
    pub fn article_id(&self) -> Option<&str> {
        self.payload.get("article_id").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_type_round_trip() {
        for t in [
            JobType::BackfillArticle,
            JobType::ReembedArticle,
            JobType::DeleteArticle,
        ] {
            assert_eq!(JobType::parse(t.as_str()), Some(t));
        }
        assert_eq!(JobType::parse("unknown"), None);
    }

    #[test]
    fn test_new_job_defaults() {
        let job = RagJob::new(
            JobType::BackfillArticle,
            serde_json::json!({"article_id": "a1"}),
        );
        assert_eq!(job.status, JobStatus::New);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.article_id(), Some("a1"));
    }
}
