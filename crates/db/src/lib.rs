//! `db` crate: pure persistence layer.
//!
//! [`WorkflowStore`] is the engine's contract with durable storage. Two
//! implementations ship: [`PgStorage`] over a sqlx Postgres pool and
//! [`InMemoryStorage`] for tests and single-node runs. No business logic
//! lives here beyond refusing to move an execution out of a terminal status.

pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod store;

pub use error::DbError;
pub use memory::InMemoryStorage;
pub use models::{is_terminal, ExecutionFilter, ExecutionRow, WorkflowRow, TERMINAL_STATUSES};
pub use pool::{create_pool, run_migrations, DbPool};
pub use postgres::PgStorage;
pub use store::WorkflowStore;
