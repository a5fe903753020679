//! High-availability error types.

use thiserror::Error;

/// Result type alias for HA operations.
pub type HaResult<T> = Result<T, HaError>;

#[derive(Debug, Error)]
pub enum HaError {
    /// The lease store answered with an error.
    #[error("lease store error: {0}")]
    Store(String),

    /// The lease store could not be reached at all.
    #[error("lease store unreachable: {0}")]
    Unreachable(String),

    /// This instance can no longer guarantee it is the only active one.
    /// The supervisor must restart the process.
    #[error("fatal high availability failure: {0}")]
    Fatal(String),

    #[error("HighAvailabilityManagerDisabled")]
    Disabled,
}

impl HaError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, HaError::Fatal(_))
    }
}
