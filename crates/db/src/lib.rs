//! `db` crate — pure persistence layer.
//!
//! Defines the [`WorkflowRepo`] contract the engine runs against, the row and
//! parameter models for the two workflow tables, and two implementations: an
//! in-process [`MemoryRepo`] (tests, embedding without a database) and a
//! Postgres-backed [`PgRepo`]. No business logic lives here.

pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod repo;

pub use error::DbError;
pub use memory::MemoryRepo;
pub use pool::DbPool;
pub use postgres::PgRepo;
pub use repo::{TxFn, WorkflowRepo};

/// Current wall-clock time as Unix seconds — the timestamp format of every
/// persisted row.
pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
