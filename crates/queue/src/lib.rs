//! `queue` crate: durable priority work queue on the coordination store.
//!
//! One list per priority class holds message ids; message bodies live under
//! their own key. A dequeued id moves to the class's processing list and gets
//! a visibility lease. `ack` deletes the message, `nack` requeues it with an
//! incremented retry count or parks it on the dead-letter list.

pub mod error;
pub mod message;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use message::{MessageMetadata, Priority, QueueMessage};
pub use queue::{MessageQueue, NackOutcome, QueueConfig, QueueStats};
