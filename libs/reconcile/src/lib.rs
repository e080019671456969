//! Reconciliation loop primitives.
//!
//! This library provides the pure decision logic the orchestrator uses to
//! converge external job state back into the run queue. Key concepts:
//!
//! - **Job state**: What the workload launcher reports for a run's job.
//! - **Reconcile action**: What the orchestrator does about that state.
//! - **Recovery window**: How long a running run may legitimately have no
//!   job before it is treated as lost.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - Nothing here performs I/O or reads the clock; callers pass `now`
//! - A run is never judged lost while it is inside its grace window

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A duration bound was configured inconsistently.
    #[error("invalid window: {0}")]
    InvalidWindow(String),
}

/// Observed state of a run's external job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job exists but no pod has started yet.
    Pending,

    /// Job has an active pod.
    Running,

    /// Job completed successfully.
    Succeeded,

    /// Job exhausted its backoff or reported failure.
    Failed,

    /// No job exists for the reference.
    NotFound,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What reconciliation does with a running run, given its job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Job is still working; renew the run's leases.
    KeepAlive,

    /// Job completed; finalize the run as succeeded.
    FinalizeSucceeded,

    /// Job failed; finalize the run as failed.
    FinalizeFailed,

    /// No job exists; run the not-found recovery path.
    RecoverMissingJob,
}

impl ReconcileAction {
    /// Map an observed job state onto the action to take.
    pub fn for_state(state: JobState) -> Self {
        match state {
            JobState::Pending | JobState::Running => ReconcileAction::KeepAlive,
            JobState::Succeeded => ReconcileAction::FinalizeSucceeded,
            JobState::Failed => ReconcileAction::FinalizeFailed,
            JobState::NotFound => ReconcileAction::RecoverMissingJob,
        }
    }
}

/// Where a run without a job sits relative to its recovery window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    /// Still inside the grace period; the job may simply not exist yet.
    Grace,

    /// Past grace; recovery should be attempted.
    Recoverable,

    /// Past the overall lease budget; stop waiting for preparation.
    Exhausted,
}

/// Grace and budget bounds for runs that have no job yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryWindow {
    /// Time after `started_at` during which a missing job is expected.
    pub grace: Duration,

    /// Time after `started_at` after which a still-preparing run is lost.
    pub budget: Duration,
}

impl RecoveryWindow {
    /// Build a window from the preparation retry timeout, a fixed buffer,
    /// and the run lease budget.
    pub fn new(
        retry_timeout: Duration,
        buffer: Duration,
        budget: Duration,
    ) -> Result<Self, ReconcileError> {
        let grace = retry_timeout + buffer;
        if budget < grace {
            return Err(ReconcileError::InvalidWindow(format!(
                "budget {budget:?} is shorter than grace {grace:?}"
            )));
        }
        Ok(Self { grace, budget })
    }

    /// Classify a run by its age. A missing `started_at` counts as fresh.
    pub fn phase(&self, started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> RecoveryPhase {
        let Some(started_at) = started_at else {
            return RecoveryPhase::Grace;
        };

        // Clock skew between instances can put started_at in the future.
        let age = (now - started_at).to_std().unwrap_or(Duration::ZERO);
        if age < self.grace {
            RecoveryPhase::Grace
        } else if age < self.budget {
            RecoveryPhase::Recoverable
        } else {
            RecoveryPhase::Exhausted
        }
    }
}

/// Lower bound for a single preparation poll.
pub const MIN_PREPARATION_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for a single preparation poll.
pub const MAX_PREPARATION_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for one environment preparation poll: four retry intervals,
/// clamped to `[5s, 30s]`.
pub fn preparation_call_timeout(retry_interval: Duration) -> Duration {
    retry_interval
        .saturating_mul(4)
        .clamp(MIN_PREPARATION_CALL_TIMEOUT, MAX_PREPARATION_CALL_TIMEOUT)
}

/// Returns true if a lease that runs until `lease_until` has lapsed.
pub fn lease_expired(lease_until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match lease_until {
        Some(until) => until < now,
        None => true,
    }
}

/// Absolute deadline for a lease of `ttl` taken at `now`.
///
/// TTLs too large for chrono saturate at one year.
pub fn lease_deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
    now.checked_add_signed(ttl).unwrap_or(now)
}

/// Default reconciliation interval.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Default buffer added to the preparation retry timeout for the grace window.
pub const DEFAULT_NOT_FOUND_GRACE_BUFFER: Duration = Duration::from_secs(15);
