//! Append-only flow event log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runbay_events::{ActorType, FlowEvent, StoredFlowEvent};
use runbay_id::{EventId, ProjectId, RunId};
use sqlx::{
    postgres::{PgPool, PgRow},
    Row,
};
use uuid::Uuid;

use super::DbError;

/// Store for run lifecycle events.
#[async_trait]
pub trait FlowEventStore: Send + Sync {
    /// Append one event and return its assigned id.
    async fn insert(&self, event: &FlowEvent) -> Result<i64, DbError>;
}

/// A row from the flow_events table.
#[derive(Debug, Clone)]
struct FlowEventRow {
    event_id: i64,
    correlation_id: String,
    run_id: Option<Uuid>,
    project_id: Option<Uuid>,
    actor_type: String,
    actor_id: String,
    event_type: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for FlowEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            event_id: row.try_get("event_id")?,
            correlation_id: row.try_get("correlation_id")?,
            run_id: row.try_get("run_id")?,
            project_id: row.try_get("project_id")?,
            actor_type: row.try_get("actor_type")?,
            actor_id: row.try_get("actor_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl FlowEventRow {
    fn into_stored(self) -> Result<StoredFlowEvent, DbError> {
        let actor_type = match self.actor_type.as_str() {
            "user" => ActorType::User,
            "system" => ActorType::System,
            "agent" => ActorType::Agent,
            other => {
                return Err(DbError::InvalidRow {
                    table: "flow_events",
                    message: format!("unknown actor_type '{other}'"),
                })
            }
        };

        Ok(StoredFlowEvent {
            event_id: EventId::new(self.event_id),
            event: FlowEvent {
                correlation_id: self.correlation_id,
                run_id: self.run_id.map(RunId::from_uuid),
                project_id: self.project_id.map(ProjectId::from_uuid),
                actor_type,
                actor_id: self.actor_id,
                event_type: self.event_type,
                payload: self.payload,
                created_at: self.created_at,
            },
        })
    }
}

/// Postgres flow event store.
#[derive(Clone)]
pub struct PgFlowEventStore {
    pool: PgPool,
}

impl PgFlowEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Events for a run in append order.
    pub async fn list_for_run(&self, run_id: RunId) -> Result<Vec<StoredFlowEvent>, DbError> {
        let rows: Vec<FlowEventRow> = sqlx::query_as(
            r#"
            SELECT event_id, correlation_id, run_id, project_id, actor_type, actor_id,
                   event_type, payload, created_at
            FROM flow_events
            WHERE run_id = $1
            ORDER BY event_id
            "#,
        )
        .bind(run_id.uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FlowEventRow::into_stored).collect()
    }
}

#[async_trait]
impl FlowEventStore for PgFlowEventStore {
    async fn insert(&self, event: &FlowEvent) -> Result<i64, DbError> {
        let event_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO flow_events (
                correlation_id, run_id, project_id, actor_type, actor_id,
                event_type, payload, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING event_id
            "#,
        )
        .bind(&event.correlation_id)
        .bind(event.run_id.map(|id| id.uuid()))
        .bind(event.project_id.map(|id| id.uuid()))
        .bind(event.actor_type.to_string())
        .bind(&event.actor_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(event_id)
    }
}
