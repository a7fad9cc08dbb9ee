use thiserror::Error;

/// Main error type for ragsync
#[derive(Error, Debug)]
pub enum RagsyncError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Store could not be reached (connection open failed, worker task died)
    #[error("Store connectivity error: {0}")]
    Connectivity(String),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Embedding service errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Rejected input: wrong embedding dimension, malformed registry, bad arguments
    #[error("Validation error: {0}")]
    Validation(String),

    /// A single file could not be chunked, embedded or stored
    #[error("Failed to process {path}: {reason}")]
    FileProcessing { path: String, reason: String },

    /// Search store rebuild did not complete
    #[error("Rebuild error: {0}")]
    Rebuild(String),

    /// Run stopped at a batch boundary on request
    #[error("Operation cancelled")]
    Cancelled,
}

impl RagsyncError {
    /// Errors that end the current run instead of being recorded per file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RagsyncError::Database(_) | RagsyncError::Connectivity(_) | RagsyncError::Cancelled
        )
    }
}

/// Convenient Result type using RagsyncError
pub type Result<T> = std::result::Result<T, RagsyncError>;
