//! `locks` crate: cross-process mutual exclusion over the coordination store.
//!
//! - [`DistributedLock`]: quorum acquire / release / extend with random
//!   ownership tokens, plus `with_lock` and `try_acquire`.
//! - [`LockHandle`]: a lock renewed at a third of its TTL that reports loss.
//! - [`LeaderElection`] and [`DistributedSemaphore`]: patterns built on top.

pub mod error;
pub mod handle;
pub mod manager;
pub mod patterns;

pub use error::{LockError, LockResult};
pub use handle::LockHandle;
pub use manager::{DistributedLock, Lock, LockConfig};
pub use patterns::{DistributedSemaphore, LeaderElection, SemaphorePermit};
