//! Persistence layer for the Quarry RAG orchestrator
//!
//! Provides the two pieces of cross-request shared state, each behind a
//! capability trait with a ScyllaDB implementation and an in-memory
//! implementation for tests and single-node development:
//! - The durable job queue (`JobStore`)
//! - The document version registry (`VersionRegistry`), the metadata backing
//!   of the vector store's versioned upsert transaction

mod client;
mod error;
mod job_store;
mod schema;
mod versions;

pub use client::{ScyllaClient, ScyllaConfig};
pub use error::PersistenceError;
pub use job_store::{JobStore, MemoryJobStore, ScyllaJobStore};
pub use versions::{MemoryVersionRegistry, ScyllaVersionRegistry, VersionRegistry};

/// Combined persistence layer with all ScyllaDB-backed stores
pub struct PersistenceLayer {
    pub jobs: ScyllaJobStore,
    pub versions: ScyllaVersionRegistry,
}

/// Initialize the persistence layer: connect, migrate schema, build stores
pub async fn init(
    config: ScyllaConfig,
    job_max_attempts: u32,
) -> Result<PersistenceLayer, PersistenceError> {
    let client = ScyllaClient::bootstrap(config).await?;

    Ok(PersistenceLayer {
        jobs: ScyllaJobStore::new(client.clone(), job_max_attempts),
        versions: ScyllaVersionRegistry::new(client),
    })
}
