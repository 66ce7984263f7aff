//! `pool` crate: bounded pool of homogeneous connections.
//!
//! The pool is generic over a [`ConnectionFactory`] that knows how to create,
//! validate and destroy one connection. Callers borrow a [`PooledConn`]
//! guard which goes back to the pool when released or dropped.

pub mod error;
pub mod pool;

pub use error::{PoolError, PoolResult};
pub use pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolStats, PooledConn, PooledConnection};
