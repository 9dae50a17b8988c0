//! Error types for the hub's collaborators.

use thiserror::Error;

/// Shared membership store and event bus failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed stored value for {key}: {value}")]
    Malformed { key: String, value: String },

    #[error("Event encoding error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Persistence failures.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Bearer token verification failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Malformed token")]
    Malformed,

    #[error("Invalid token signature")]
    BadSignature,

    #[error("Token expired")]
    Expired,
}

/// Membership service failures, mapped to HTTP statuses by the web layer.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
