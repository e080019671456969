//! Queue store contract shared by the Postgres and in-memory stores.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runbay_events::RunTerminalStatus;
use runbay_id::{IdError, ProjectId, RunId};
use serde::Deserialize;

use super::DbError;
use crate::payload::RunPayload;

/// Parameters for one atomic claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub worker_id: String,
    /// Slot pool size when the project settings do not say otherwise.
    pub slots_per_project: u32,
    pub slot_lease_ttl: Duration,
    pub run_lease_ttl: Duration,
    /// Learning mode when neither the run nor the project sets it.
    pub learning_mode_default: bool,
    /// Maximum pending candidates tried before giving up.
    pub scan_limit: u32,
    pub now: DateTime<Utc>,
}

/// A run that was just moved from pending to running.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedRun {
    pub run_id: RunId,
    pub correlation_id: String,
    pub project_id: ProjectId,
    pub learning_mode: bool,
    pub payload: serde_json::Value,
    pub slot_no: i32,
    pub started_at: DateTime<Utc>,
    pub lease_until: DateTime<Utc>,
}

/// A running run handed to this worker for reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningRun {
    pub run_id: RunId,
    pub correlation_id: String,
    pub project_id: ProjectId,
    pub learning_mode: bool,
    pub payload: serde_json::Value,
    pub slot_no: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub lease_until: Option<DateTime<Utc>>,
}

impl From<ClaimedRun> for RunningRun {
    fn from(run: ClaimedRun) -> Self {
        Self {
            run_id: run.run_id,
            correlation_id: run.correlation_id,
            project_id: run.project_id,
            learning_mode: run.learning_mode,
            payload: run.payload,
            slot_no: Some(run.slot_no),
            started_at: Some(run.started_at),
            lease_until: Some(run.lease_until),
        }
    }
}

/// Terminal transition for a running run.
#[derive(Debug, Clone)]
pub struct FinishRun {
    pub run_id: RunId,
    pub worker_id: String,
    pub status: RunTerminalStatus,
    pub finished_at: DateTime<Utc>,
}

/// Renewal of a run's own lease and its slot lease.
#[derive(Debug, Clone)]
pub struct ExtendLease {
    pub run_id: RunId,
    pub project_id: ProjectId,
    pub worker_id: String,
    pub lease_ttl: Duration,
    pub now: DateTime<Utc>,
}

/// A pending run as written by ingestion.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub run_id: RunId,
    pub correlation_id: String,
    pub project_id: Option<ProjectId>,
    pub learning_mode: Option<bool>,
    pub payload: serde_json::Value,
}

impl NewRun {
    pub fn new(correlation_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            run_id: RunId::new(),
            correlation_id: correlation_id.into(),
            project_id: None,
            learning_mode: None,
            payload,
        }
    }

    #[must_use]
    pub fn with_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }
}

/// Durable run queue with atomic claim semantics.
///
/// Implementations must tolerate several orchestrator instances calling
/// concurrently: a run is claimed by at most one caller, a slot holds at
/// most one run, and finishing a run twice reports `false` the second time.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Claim one pending run and lease it a slot. `None` when nothing is
    /// claimable.
    async fn claim_next_pending(&self, request: &ClaimRequest)
        -> Result<Option<ClaimedRun>, DbError>;

    /// Running runs owned by `worker_id` or whose run lease lapsed, re-leased
    /// to `worker_id`.
    async fn claim_running(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<RunningRun>, DbError>;

    /// Move a running run to its terminal status and free its slot. Returns
    /// whether the row changed.
    async fn finish_run(&self, finish: &FinishRun) -> Result<bool, DbError>;

    /// Renew the run and slot leases. Returns false if the run is no longer
    /// running under this worker.
    async fn extend_lease(&self, extend: &ExtendLease) -> Result<bool, DbError>;
}

// =============================================================================
// Project Resolution
// =============================================================================

/// Per-project settings stored as JSON on the project row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    pub slots_per_project: Option<u32>,
    pub learning_mode_default: Option<bool>,
}

impl ProjectSettings {
    /// Parse settings leniently; unknown shapes fall back to defaults.
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn slots(&self, fallback: u32) -> u32 {
        self.slots_per_project.filter(|n| *n > 0).unwrap_or(fallback).max(1)
    }
}

/// Identity of the project a pending run belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProject {
    pub project_id: ProjectId,
    pub slug: String,
    pub name: String,
}

/// Resolve a run's project: the row value, then `project_id` in the
/// payload, then a hash of the repository name or correlation id.
pub fn resolve_project(
    explicit: Option<ProjectId>,
    payload: &serde_json::Value,
    correlation_id: &str,
) -> Result<ResolvedProject, IdError> {
    let parsed = RunPayload::from_value(payload);
    let repository = parsed.repository_full_name();

    let project_id = match explicit.or_else(|| {
        parsed
            .project_id
            .as_deref()
            .and_then(runbay_id::parse_uuid)
            .map(ProjectId::from_uuid)
    }) {
        Some(id) => id,
        None => ProjectId::derive_for_run(repository, correlation_id)?,
    };

    let (slug, name) = match repository {
        Some(repo) => (repo.to_ascii_lowercase().replace('/', "-"), repo.to_string()),
        None => {
            let slug = format!("project-{}", project_id.compact(12));
            (slug.clone(), slug)
        }
    };

    Ok(ResolvedProject {
        project_id,
        slug,
        name,
    })
}
