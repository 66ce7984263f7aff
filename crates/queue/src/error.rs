use coord::CoordError;
use thiserror::Error;
use uuid::Uuid;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("message {0} not found")]
    UnknownMessage(Uuid),

    #[error("queue store error: {0}")]
    Store(#[from] CoordError),
}
