//! ScyllaDB bootstrap for the job queue and version registry
//!
//! One session serves both stores. Everything they share lives here: the
//! connect-and-migrate startup path (workers start claiming immediately, so
//! the queue and registry tables must exist before any store is handed out)
//! and the decoding of lightweight-transaction results, which both the claim
//! conditional update and the version compare-and-set branch on.

use crate::error::PersistenceError;
use crate::schema;
use scylla::frame::response::result::CqlValue;
use scylla::{QueryResult, Session, SessionBuilder};
use std::sync::Arc;

/// Connection settings for the queue-and-registry keyspace
#[derive(Debug, Clone)]
pub struct ScyllaConfig {
    pub hosts: Vec<String>,
    pub keyspace: String,
    pub replication_factor: u8,
}

/// Shared session handle for `ScyllaJobStore` and `ScyllaVersionRegistry`
#[derive(Clone)]
pub struct ScyllaClient {
    session: Arc<Session>,
    config: ScyllaConfig,
}

impl ScyllaClient {
    /// Connect to the cluster and migrate the persistence schema: the
    /// `rag_jobs` queue partition with its id lookup and dead-letter tables,
    /// and the `article_versions` registry. Stores built on this client
    /// assume the schema exists.
    pub async fn bootstrap(config: ScyllaConfig) -> Result<Self, PersistenceError> {
        tracing::info!(
            hosts = ?config.hosts,
            keyspace = %config.keyspace,
            "Bootstrapping job queue and version registry on ScyllaDB"
        );

        let session = SessionBuilder::new()
            .known_nodes(&config.hosts)
            .build()
            .await?;

        schema::create_keyspace(&session, &config.keyspace, config.replication_factor).await?;
        schema::create_tables(&session, &config.keyspace).await?;

        Ok(Self {
            session: Arc::new(session),
            config,
        })
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn keyspace(&self) -> &str {
        &self.config.keyspace
    }

    /// Decode the `[applied]` column a conditional statement prepends to its
    /// result row. A job claim that lost the race and a version CAS beaten by
    /// a concurrent upsert both come back here as `false`.
    pub(crate) fn lwt_applied(result: &QueryResult) -> bool {
        result
            .rows
            .as_ref()
            .and_then(|rows| rows.first())
            .and_then(|row| row.columns.first())
            .map_or(false, |col| matches!(col, Some(CqlValue::Boolean(true))))
    }
}
