//! Platform error types.

use thiserror::Error;

/// Result type alias for platform operations.
pub type PlatformResult<T> = Result<T, PlatformError>;

#[derive(Debug, Error)]
pub enum PlatformError {
    /// A command ran and failed. Carries the command and its combined output.
    #[error("command failed, {cmd}: {output}, {reason}")]
    Command {
        cmd: String,
        output: String,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Unsupported(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("unknown platform {name:?}, expected one of: {known}")]
    UnknownPlatform { name: String, known: String },

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Core(#[from] crm_core::CoreError),
}

impl PlatformError {
    /// Output of a failed command, empty for other errors.
    pub fn output(&self) -> &str {
        match self {
            PlatformError::Command { output, .. } => output,
            _ => "",
        }
    }

    /// Whether a failed command's output contains `needle`.
    pub fn output_contains(&self, needle: &str) -> bool {
        self.output().contains(needle)
    }
}
