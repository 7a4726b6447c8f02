//! Error types for Skypevault

use thiserror::Error;

/// Main error type for Skypevault
#[derive(Debug, Error)]
pub enum Error {
    /// Extraction errors (malformed input, unreadable archives)
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Transformation errors (per-message and per-conversation)
    #[error("Transformation error: {0}")]
    Transformation(String),

    /// Loading errors (database constraint, connectivity)
    #[error("Load error: {0}")]
    Load(String),

    /// Contract violations at component boundaries
    #[error("Validation error: {0}")]
    Validation(String),

    /// Checkpoint serialize/deserialize failures
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Run was cancelled before completion
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A phase was started while another was still active
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Multiple JSON entries in an archive without auto-select
    #[error("Ambiguous archive: {0}")]
    AmbiguousArchive(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQL errors
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error should abort the current phase.
    ///
    /// Transformation errors default to non-fatal: the offending message
    /// or conversation is recorded and skipped while the run continues.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Transformation(_))
    }
}

/// Result type alias for Skypevault operations
pub type Result<T> = std::result::Result<T, Error>;
