//! Coordination-store error types.

use thiserror::Error;

/// Result type for coordination-store operations.
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors produced by a [`CoordinationStore`](crate::CoordinationStore) backend.
#[derive(Debug, Error)]
pub enum CoordError {
    /// The backend could not be reached or rejected the request.
    #[error("coordination backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An optimistic update lost the race too many times in a row.
    #[error("atomic update on '{key}' gave up after {attempts} conflicting attempts")]
    Contention { key: String, attempts: u32 },

    /// The operation did not complete within its deadline.
    #[error("coordination operation timed out")]
    Timeout,
}
