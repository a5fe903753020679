//! Error types for the CRM caches and sync registry.

use thiserror::Error;

/// Result type alias for cache and sync operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("no cache registered for object kind {0}")]
    UnknownKind(String),

    #[error("object kind {0} is owned by the CRM and cannot be received")]
    NotAccepted(String),

    #[error("not found: {0}")]
    NotFound(String),
}
