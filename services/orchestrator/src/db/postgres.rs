//! Postgres-backed queue store.
//!
//! Claims lock pending rows with `FOR UPDATE SKIP LOCKED` so concurrent
//! orchestrators never block on each other's candidates. Each candidate is
//! tried inside its own savepoint: when a project has no free slot the
//! savepoint is rolled back and the next candidate is tried, leaving the
//! skipped run pending with no partial effects.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runbay_id::{ProjectId, RunId};
use runbay_reconcile::lease_deadline;
use sqlx::{
    postgres::{PgPool, PgRow},
    Connection, PgConnection, Row,
};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::queue::{
    resolve_project, ClaimRequest, ClaimedRun, ExtendLease, FinishRun, NewRun, ProjectSettings,
    QueueStore, RunningRun,
};
use super::DbError;
use runbay_events::RunStatus;

/// Pending candidate as locked by the claim scan.
#[derive(Debug, Clone)]
struct PendingRow {
    run_id: Uuid,
    correlation_id: String,
    project_id: Option<Uuid>,
    learning_mode: Option<bool>,
    payload: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, PgRow> for PendingRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            correlation_id: row.try_get("correlation_id")?,
            project_id: row.try_get("project_id")?,
            learning_mode: row.try_get("learning_mode")?,
            payload: row.try_get("run_payload")?,
        })
    }
}

/// Running row as returned by `claim_running`.
#[derive(Debug, Clone)]
struct RunningRow {
    run_id: Uuid,
    correlation_id: String,
    project_id: Option<Uuid>,
    learning_mode: Option<bool>,
    payload: serde_json::Value,
    slot_no: Option<i32>,
    started_at: Option<DateTime<Utc>>,
    lease_until: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for RunningRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            correlation_id: row.try_get("correlation_id")?,
            project_id: row.try_get("project_id")?,
            learning_mode: row.try_get("learning_mode")?,
            payload: row.try_get("run_payload")?,
            slot_no: row.try_get("slot_no")?,
            started_at: row.try_get("started_at")?,
            lease_until: row.try_get("lease_until")?,
        })
    }
}

impl RunningRow {
    fn into_running(self) -> Result<RunningRun, DbError> {
        let project_id = self.project_id.ok_or_else(|| DbError::InvalidRow {
            table: "agent_runs",
            message: format!("running run {} has no project_id", self.run_id),
        })?;

        Ok(RunningRun {
            run_id: RunId::from_uuid(self.run_id),
            correlation_id: self.correlation_id,
            project_id: ProjectId::from_uuid(project_id),
            learning_mode: self.learning_mode.unwrap_or(false),
            payload: self.payload,
            slot_no: self.slot_no,
            started_at: self.started_at,
            lease_until: self.lease_until,
        })
    }
}

/// Queue store backed by the `agent_runs`, `projects` and `slots` tables.
#[derive(Clone)]
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a pending run. Used by ingestion-side tooling and tests.
    pub async fn enqueue(&self, run: &NewRun) -> Result<RunId, DbError> {
        sqlx::query(
            r#"
            INSERT INTO agent_runs (run_id, correlation_id, project_id, learning_mode, run_payload, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            "#,
        )
        .bind(run.run_id.uuid())
        .bind(&run.correlation_id)
        .bind(run.project_id.map(|p| p.uuid()))
        .bind(run.learning_mode)
        .bind(&run.payload)
        .execute(&self.pool)
        .await?;

        Ok(run.run_id)
    }

    /// Current status of a run, if it exists.
    pub async fn run_status(&self, run_id: RunId) -> Result<Option<RunStatus>, DbError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM agent_runs WHERE run_id = $1")
                .bind(run_id.uuid())
                .fetch_optional(&self.pool)
                .await?;

        status
            .map(|s| {
                RunStatus::parse(&s).ok_or_else(|| DbError::InvalidRow {
                    table: "agent_runs",
                    message: format!("unknown status '{s}'"),
                })
            })
            .transpose()
    }

    /// Number of leased slots for a project.
    pub async fn leased_slot_count(&self, project_id: ProjectId) -> Result<i64, DbError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM slots WHERE project_id = $1 AND state = 'leased'",
        )
        .bind(project_id.uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Try to claim one locked candidate inside the caller's savepoint.
    async fn try_claim(
        conn: &mut PgConnection,
        candidate: &PendingRow,
        request: &ClaimRequest,
    ) -> Result<Option<ClaimedRun>, DbError> {
        let project = resolve_project(
            candidate.project_id.map(ProjectId::from_uuid),
            &candidate.payload,
            &candidate.correlation_id,
        )?;
        let project_uuid = project.project_id.uuid();

        sqlx::query(
            r#"
            INSERT INTO projects (project_id, slug, name)
            VALUES ($1, $2, $3)
            ON CONFLICT (project_id) DO NOTHING
            "#,
        )
        .bind(project_uuid)
        .bind(&project.slug)
        .bind(&project.name)
        .execute(&mut *conn)
        .await?;

        // Locking the project row serializes slot bookkeeping per project.
        let settings: serde_json::Value =
            sqlx::query_scalar("SELECT settings FROM projects WHERE project_id = $1 FOR UPDATE")
                .bind(project_uuid)
                .fetch_one(&mut *conn)
                .await?;
        let settings = ProjectSettings::from_value(&settings);
        let slots = settings.slots(request.slots_per_project);

        sqlx::query(
            r#"
            INSERT INTO slots (project_id, slot_no, state)
            SELECT $1, g, 'free' FROM generate_series(1, $2::INTEGER) AS g
            ON CONFLICT (project_id, slot_no) DO NOTHING
            "#,
        )
        .bind(project_uuid)
        .bind(slots as i32)
        .execute(&mut *conn)
        .await?;

        // Expired slots of runs that are still running stay leased; the
        // running run is re-leased through claim_running instead.
        let released = sqlx::query(
            r#"
            UPDATE slots s
            SET state = 'free', run_id = NULL, lease_owner = NULL, lease_until = NULL
            WHERE s.project_id = $1
              AND s.state <> 'free'
              AND (s.lease_until IS NULL OR s.lease_until < $2)
              AND NOT EXISTS (
                  SELECT 1 FROM agent_runs r
                  WHERE r.run_id = s.run_id AND r.status = 'running'
              )
            "#,
        )
        .bind(project_uuid)
        .bind(request.now)
        .execute(&mut *conn)
        .await?;

        if released.rows_affected() > 0 {
            debug!(
                project_id = %project.project_id,
                released = released.rows_affected(),
                "released expired slot leases"
            );
        }

        let slot_lease_until = lease_deadline(request.now, request.slot_lease_ttl);
        let slot_no: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE slots
            SET state = 'leased', run_id = $2, lease_owner = $3, lease_until = $4
            WHERE (project_id, slot_no) = (
                SELECT project_id, slot_no FROM slots
                WHERE project_id = $1 AND state = 'free'
                ORDER BY slot_no
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING slot_no
            "#,
        )
        .bind(project_uuid)
        .bind(candidate.run_id)
        .bind(&request.worker_id)
        .bind(slot_lease_until)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(slot_no) = slot_no else {
            return Ok(None);
        };

        let learning_mode = candidate
            .learning_mode
            .or(settings.learning_mode_default)
            .unwrap_or(request.learning_mode_default);
        let run_lease_until = lease_deadline(request.now, request.run_lease_ttl);

        sqlx::query(
            r#"
            UPDATE agent_runs
            SET status = 'running',
                project_id = $2,
                learning_mode = $3,
                started_at = $4,
                slot_no = $5,
                lease_owner = $6,
                lease_until = $7
            WHERE run_id = $1
            "#,
        )
        .bind(candidate.run_id)
        .bind(project_uuid)
        .bind(learning_mode)
        .bind(request.now)
        .bind(slot_no)
        .bind(&request.worker_id)
        .bind(run_lease_until)
        .execute(&mut *conn)
        .await?;

        Ok(Some(ClaimedRun {
            run_id: RunId::from_uuid(candidate.run_id),
            correlation_id: candidate.correlation_id.clone(),
            project_id: project.project_id,
            learning_mode,
            payload: candidate.payload.clone(),
            slot_no,
            started_at: request.now,
            lease_until: run_lease_until,
        }))
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    #[instrument(skip(self, request), fields(worker_id = %request.worker_id))]
    async fn claim_next_pending(
        &self,
        request: &ClaimRequest,
    ) -> Result<Option<ClaimedRun>, DbError> {
        let mut tx = self.pool.begin().await?;

        let candidates: Vec<PendingRow> = sqlx::query_as(
            r#"
            SELECT run_id, correlation_id, project_id, learning_mode, run_payload
            FROM agent_runs
            WHERE status = 'pending'
            ORDER BY created_at, run_id
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(i64::from(request.scan_limit.max(1)))
        .fetch_all(&mut *tx)
        .await?;

        for candidate in &candidates {
            let mut savepoint = Connection::begin(&mut *tx).await?;
            match Self::try_claim(&mut savepoint, candidate, request).await {
                Ok(Some(claimed)) => {
                    savepoint.commit().await?;
                    tx.commit().await?;
                    return Ok(Some(claimed));
                }
                Ok(None) => {
                    savepoint.rollback().await?;
                    debug!(run_id = %candidate.run_id, "no free slot for candidate");
                }
                Err(e) => {
                    savepoint.rollback().await?;
                    debug!(run_id = %candidate.run_id, error = %e, "candidate claim aborted");
                }
            }
        }

        tx.commit().await?;
        Ok(None)
    }

    #[instrument(skip(self))]
    async fn claim_running(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<RunningRun>, DbError> {
        let rows: Vec<RunningRow> = sqlx::query_as(
            r#"
            UPDATE agent_runs
            SET lease_owner = $1, lease_until = $2
            WHERE run_id IN (
                SELECT run_id FROM agent_runs
                WHERE status = 'running'
                  AND (lease_owner = $1 OR lease_until IS NULL OR lease_until < $3)
                ORDER BY started_at NULLS FIRST, run_id
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING run_id, correlation_id, project_id, learning_mode, run_payload,
                      slot_no, started_at, lease_until
            "#,
        )
        .bind(worker_id)
        .bind(lease_deadline(now, lease_ttl))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunningRow::into_running).collect()
    }

    #[instrument(skip(self, finish), fields(run_id = %finish.run_id, status = ?finish.status))]
    async fn finish_run(&self, finish: &FinishRun) -> Result<bool, DbError> {
        let mut tx = self.pool.begin().await?;

        let status: runbay_events::RunStatus = finish.status.into();
        let finished: Option<Option<Uuid>> = sqlx::query_scalar(
            r#"
            UPDATE agent_runs
            SET status = $2, finished_at = $3, lease_owner = NULL, lease_until = NULL
            WHERE run_id = $1
              AND status = 'running'
              AND (lease_owner = $4 OR lease_owner IS NULL OR lease_until < $3)
            RETURNING project_id
            "#,
        )
        .bind(finish.run_id.uuid())
        .bind(status.as_str())
        .bind(finish.finished_at)
        .bind(&finish.worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(project_id) = finished else {
            tx.rollback().await?;
            return Ok(false);
        };

        if let Some(project_id) = project_id {
            sqlx::query(
                r#"
                UPDATE slots
                SET state = 'free', run_id = NULL, lease_owner = NULL, lease_until = NULL
                WHERE project_id = $1 AND run_id = $2
                "#,
            )
            .bind(project_id)
            .bind(finish.run_id.uuid())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    #[instrument(skip(self, extend), fields(run_id = %extend.run_id))]
    async fn extend_lease(&self, extend: &ExtendLease) -> Result<bool, DbError> {
        let mut tx = self.pool.begin().await?;
        let lease_until = lease_deadline(extend.now, extend.lease_ttl);

        let updated = sqlx::query(
            r#"
            UPDATE agent_runs
            SET lease_until = $3
            WHERE run_id = $1 AND status = 'running' AND lease_owner = $2
            "#,
        )
        .bind(extend.run_id.uuid())
        .bind(&extend.worker_id)
        .bind(lease_until)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE slots
            SET state = 'leased', lease_owner = $3, lease_until = $4
            WHERE project_id = $1 AND run_id = $2
            "#,
        )
        .bind(extend.project_id.uuid())
        .bind(extend.run_id.uuid())
        .bind(&extend.worker_id)
        .bind(lease_until)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}
