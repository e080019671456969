//! Run queue and flow event storage.
//!
//! [`QueueStore`] and [`FlowEventStore`] are the contracts the orchestrator
//! works against; Postgres backs them in production and the memory stores
//! back them in tests.

mod error;
mod flow_events;
mod memory;
mod postgres;
mod queue;

pub use error::DbError;
pub use flow_events::{FlowEventStore, PgFlowEventStore};
pub use memory::{
    MemoryFlowEventStore, MemoryQueueStore, ProjectRecord, RunRecord, SlotRecord, SlotState,
};
pub use postgres::PgQueueStore;
pub use queue::{
    resolve_project, ClaimRequest, ClaimedRun, ExtendLease, FinishRun, NewRun, ProjectSettings,
    QueueStore, ResolvedProject, RunningRun,
};

use std::path::PathBuf;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Where the queue lives and how many connections the orchestrator holds.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub migrations_dir: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/runbay".to_string(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
            migrations_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        }
    }
}

/// Handle to the orchestrator's Postgres database.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    migrations_dir: PathBuf,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(max_connections = config.max_connections, "Connecting to queue database");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self {
            pool,
            migrations_dir: config.migrations_dir.clone(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the queue schema (projects, runs, slots, flow events).
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let migrator = Migrator::new(self.migrations_dir.clone())
            .await
            .map_err(DbError::Migration)?;
        info!(
            migrations_dir = %self.migrations_dir.display(),
            migrations = migrator.iter().count(),
            "Applying queue schema migrations"
        );
        migrator.run(&self.pool).await.map_err(DbError::Migration)
    }

    pub fn queue_store(&self) -> PgQueueStore {
        PgQueueStore::new(self.pool.clone())
    }

    pub fn flow_event_store(&self) -> PgFlowEventStore {
        PgFlowEventStore::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_migrations_dir_holds_queue_schema() {
        let config = DbConfig::default();
        assert!(config.migrations_dir.join("0001_init.sql").is_file());
    }

    #[tokio::test]
    async fn test_missing_migrations_dir_is_an_error() {
        let db = Database {
            pool: PgPoolOptions::new()
                .connect_lazy("postgres://localhost/runbay")
                .unwrap(),
            migrations_dir: PathBuf::from("/nonexistent/runbay/migrations"),
        };
        assert!(matches!(
            db.run_migrations().await,
            Err(DbError::Migration(_))
        ));
    }
}
