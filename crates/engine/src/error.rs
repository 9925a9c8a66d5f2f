//! Engine error types

use persistence::DbError;
use thiserror::Error;

use crate::cache::CacheError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: &'static str, seconds: u64 },

    #[error("{0} cancelled by shutdown")]
    Cancelled(&'static str),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Unknown archetype: {0}")]
    UnknownArchetype(String),

    #[error("Invalid strategy record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },

    #[error("Strategy not found: {0}")]
    NotFound(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
