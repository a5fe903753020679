//! Orchestrator error types.

use thiserror::Error;

/// Result type alias for orchestration operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Platform(#[from] crm_platform::PlatformError),

    #[error(transparent)]
    Core(#[from] crm_core::CoreError),

    #[error("{0}")]
    NotFound(String),

    /// A deployment variable was referenced but not supplied.
    #[error("unresolved deployment variable {0:?}")]
    UnresolvedVar(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("{0}")]
    Invalid(String),

    #[error("timed out {0}")]
    Timeout(String),

    /// A pod reached a state it cannot recover from.
    #[error("Run container failed, pod state: {state} - {output}")]
    PodFailed { state: String, output: String },

    #[error("ExecRequestIgnoredPlatformInactive")]
    Inactive,

    #[error("certificate error: {0}")]
    Cert(String),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Whether a failed command's output contains `needle`.
    pub fn output_contains(&self, needle: &str) -> bool {
        match self {
            OrchestratorError::Platform(e) => e.output_contains(needle),
            _ => false,
        }
    }
}
