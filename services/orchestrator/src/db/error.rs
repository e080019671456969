//! Store error types.

use thiserror::Error;

/// Queue and flow event store errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// A stored row could not be mapped onto its domain type.
    #[error("invalid row in {table}: {message}")]
    InvalidRow { table: &'static str, message: String },

    /// Project identity could not be derived for a run.
    #[error("project id derivation failed: {0}")]
    ProjectId(#[from] runbay_id::IdError),

    /// The store refused the operation (in-memory failure injection).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        DbError::Query(e)
    }
}
