use std::time::Duration;

use thiserror::Error;

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection became available within the acquire timeout.
    #[error("timed out after {0:?} waiting for a pooled connection")]
    Timeout(Duration),

    /// The pool is draining and no longer hands out connections.
    #[error("connection pool is draining")]
    Draining,

    /// The factory could not open a new connection.
    #[error("failed to create connection: {0}")]
    Create(String),

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Timeouts and factory failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Create(_))
    }
}
