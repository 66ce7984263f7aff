//! `breaker` crate: circuit breaker whose state is shared by every engine
//! instance through the coordination store.
//!
//! ```text
//!   Closed --failures >= threshold--> Open
//!   Open   --reset timeout elapsed--> HalfOpen
//!   HalfOpen --success_threshold successes--> Closed (counters reset)
//!   HalfOpen --any failure--> Open
//! ```
//!
//! Every transition is a single [`coord::atomic_update`]. A short-lived
//! local shadow of the state may answer admission reads, never writes.

pub mod circuit_breaker;
pub mod registry;

pub use circuit_breaker::{
    BreakerConfig, BreakerError, CircuitBreakerState, CircuitState, DistributedCircuitBreaker,
};
pub use registry::BreakerRegistry;
