//! Lock error types.

use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors returned by [`DistributedLock`](crate::DistributedLock) and the
/// patterns built on it.
#[derive(Debug, Error)]
pub enum LockError {
    /// No quorum could be reached within the configured retries.
    #[error("lock '{resource}' is held elsewhere (gave up after {attempts} attempts)")]
    Contended { resource: String, attempts: u32 },

    /// The caller's token no longer matches the stored token.
    #[error("lock '{0}' is not held by this token")]
    NotHeld(String),

    /// Auto-renewal failed; the lock can no longer be assumed held.
    #[error("lost lock '{resource}': {reason}")]
    Lost { resource: String, reason: String },

    /// A zero TTL was requested.
    #[error("lock ttl must be greater than zero")]
    InvalidTtl,

    /// The manager was built without any store replicas.
    #[error("no coordination stores configured")]
    NoStores,

    /// Underlying store failure.
    #[error("coordination store error: {0}")]
    Store(#[from] coord::CoordError),
}

impl LockError {
    /// Contention and lost renewals can be retried by the caller; the rest cannot.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contended { .. } | Self::Lost { .. } | Self::Store(_))
    }
}
