use thiserror::Error;

/// Persistence errors
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("connection error: {0}")]
    Connection(#[from] scylla::transport::errors::NewSessionError),

    #[error("query error: {0}")]
    Query(#[from] scylla::transport::errors::QueryError),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl From<PersistenceError> for quarry_core::Error {
    fn from(err: PersistenceError) -> Self {
        quarry_core::Error::Internal(err.to_string())
    }
}
