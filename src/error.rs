//! Error types for taskcast.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Distinct from a stale value: expired and never-written ids both land here.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("no route for task kind {0:?}")]
    UnknownKind(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("result store error: {0}")]
    Store(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
