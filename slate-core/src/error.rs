//! Error types for core operations.

use thiserror::Error;
use uuid::Uuid;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Queue entry not found.
    #[error("Queue entry not found: {0}")]
    EntryNotFound(Uuid),

    /// Queue persistence I/O failure.
    #[error("Queue I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
