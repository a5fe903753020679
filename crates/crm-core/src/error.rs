//! Error types shared by the CRM core crate.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid {kind} yaml, {reason}")]
    InvalidManifest { kind: &'static str, reason: String },

    #[error("invalid port spec: {0}")]
    InvalidPort(String),
}
