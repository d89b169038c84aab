//! Typed error type for the db crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Error surfaced by a transaction closure; the transaction was rolled
    /// back. The payload is the closure's own error, preserved so callers can
    /// downcast it back to their domain type.
    #[error("transaction rolled back: {0}")]
    Tx(#[source] Box<dyn std::error::Error + Send + Sync>),
}
