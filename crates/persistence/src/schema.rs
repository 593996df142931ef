//! ScyllaDB schema creation

use crate::error::PersistenceError;
use scylla::Session;

/// Create the keyspace if it doesn't exist
pub async fn create_keyspace(
    session: &Session,
    keyspace: &str,
    replication_factor: u8,
) -> Result<(), PersistenceError> {
    let query = format!(
        "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
        keyspace, replication_factor
    );

    session
        .query_unpaged(query, &[])
        .await
        .map_err(|e| PersistenceError::Schema(format!("Failed to create keyspace: {}", e)))?;

    Ok(())
}

/// Create all required tables
pub async fn create_tables(session: &Session, keyspace: &str) -> Result<(), PersistenceError> {
    // Job queue. One queue partition clustered FIFO by (created_at, id);
    // claims are LWT conditional updates against the observed row state.
    let jobs_table = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.rag_jobs (
            shard INT,
            created_at BIGINT,
            id UUID,
            job_type TEXT,
            payload TEXT,
            status TEXT,
            attempts INT,
            last_error TEXT,
            updated_at BIGINT,
            lease_until BIGINT,
            lease_owner TEXT,
            PRIMARY KEY ((shard), created_at, id)
        ) WITH CLUSTERING ORDER BY (created_at ASC, id ASC)
    "#,
        keyspace
    );

    session
        .query_unpaged(jobs_table, &[])
        .await
        .map_err(|e| PersistenceError::Schema(format!("Failed to create rag_jobs table: {}", e)))?;

    // Clustering-key lookup so complete/fail can address a job by id alone
    let jobs_by_id_table = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.rag_jobs_by_id (
            id UUID,
            created_at BIGINT,
            PRIMARY KEY (id)
        )
    "#,
        keyspace
    );

    session
        .query_unpaged(jobs_by_id_table, &[])
        .await
        .map_err(|e| {
            PersistenceError::Schema(format!("Failed to create rag_jobs_by_id table: {}", e))
        })?;

    // Dead-letter record of jobs that exhausted their attempt budget
    let dead_table = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.rag_jobs_dead (
            id UUID,
            job_type TEXT,
            payload TEXT,
            attempts INT,
            last_error TEXT,
            created_at BIGINT,
            died_at BIGINT,
            PRIMARY KEY (id)
        )
    "#,
        keyspace
    );

    session
        .query_unpaged(dead_table, &[])
        .await
        .map_err(|e| {
            PersistenceError::Schema(format!("Failed to create rag_jobs_dead table: {}", e))
        })?;

    // Document version registry: article_id -> current version.
    // Upsert commits flip this row with an LWT compare-and-set.
    let versions_table = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.article_versions (
            article_id TEXT,
            current_version BIGINT,
            updated_at BIGINT,
            PRIMARY KEY (article_id)
        )
    "#,
        keyspace
    );

    session
        .query_unpaged(versions_table, &[])
        .await
        .map_err(|e| {
            PersistenceError::Schema(format!("Failed to create article_versions table: {}", e))
        })?;

    tracing::info!("All tables created successfully");
    Ok(())
}
