//! The orchestrator tick.
//!
//! Each tick runs three independent phases:
//!
//! 1. Sweep expired namespace leases.
//! 2. Reconcile running runs against their jobs.
//! 3. Claim pending runs and launch them.
//!
//! A tick holds no state across calls. Several orchestrators may tick
//! against the same store; the store's claim operations keep them apart.

mod finalize;
mod reconcile;
mod service;
mod worker;

pub use finalize::Finalization;
pub use service::{build_job_env, JobEnvInput, RunOutcome};
pub use worker::OrchestratorWorker;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use runbay_events::EventError;
use runbay_reconcile::{ReconcileError, RecoveryWindow};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::credentials::{McpTokenIssuer, RunAccessKeyIssuer, RunStatusNotifier};
use crate::db::{ClaimRequest, DbError, FlowEventStore, QueueStore, RunningRun};
use crate::image::ImageChecker;
use crate::launcher::{Launcher, LauncherError};
use crate::preparer::EnvironmentPreparer;

/// Orchestrator errors. Per-run failures become terminal run states; these
/// are the errors that abort processing of a run or a tick.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("store error: {0}")]
    Store(#[from] DbError),

    #[error("event error: {0}")]
    Event(#[from] EventError),

    #[error("launcher error: {0}")]
    Launcher(#[from] LauncherError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ReconcileError),
}

/// External collaborators of the orchestrator.
#[derive(Clone)]
pub struct Collaborators {
    pub queue: Arc<dyn QueueStore>,
    pub events: Arc<dyn FlowEventStore>,
    pub launcher: Arc<dyn Launcher>,
    pub preparer: Arc<dyn EnvironmentPreparer>,
    /// Without a checker the primary image is used unchecked.
    pub image_checker: Option<Arc<dyn ImageChecker>>,
    pub mcp_tokens: Arc<dyn McpTokenIssuer>,
    pub access_keys: Arc<dyn RunAccessKeyIssuer>,
    pub notifier: Arc<dyn RunStatusNotifier>,
}

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub namespaces_cleaned: u32,
    pub reconciled: u32,
    pub kept_alive: u32,
    pub recovered: u32,
    pub claimed: u32,
    pub launched: u32,
    /// Runs waiting on environment preparation.
    pub deferred: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub canceled: u32,
    pub errors: u32,
}

impl TickStats {
    pub fn is_idle(&self) -> bool {
        *self == TickStats::default()
    }

    fn record(&mut self, outcome: RunOutcome) {
        match outcome {
            RunOutcome::Launched { recovered } => {
                self.launched += 1;
                if recovered {
                    self.recovered += 1;
                }
            }
            RunOutcome::KeptAlive => self.kept_alive += 1,
            RunOutcome::Deferred { .. } => self.deferred += 1,
            RunOutcome::Waiting => {}
            RunOutcome::Finalized(finalization) => match finalization {
                runbay_events::RunTerminalStatus::Succeeded => self.succeeded += 1,
                runbay_events::RunTerminalStatus::Failed => self.failed += 1,
                runbay_events::RunTerminalStatus::Canceled => self.canceled += 1,
            },
            RunOutcome::AlreadyFinal => {}
        }
    }
}

/// Run scheduler and reconciler.
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    deps: Collaborators,
    recovery: RecoveryWindow,
}

impl Orchestrator {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        deps: Collaborators,
    ) -> Result<Self, OrchestratorError> {
        let recovery = config.recovery_window()?;
        Ok(Self {
            config,
            deps,
            recovery,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run one tick at the current time.
    pub async fn tick(&self) -> Result<TickStats, OrchestratorError> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as of `now`.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickStats, OrchestratorError> {
        let mut stats = TickStats::default();

        self.sweep_namespaces(now, &mut stats).await;
        self.reconcile_running(now, &mut stats).await?;
        self.claim_pending(now, &mut stats).await?;

        if !stats.is_idle() {
            info!(
                namespaces_cleaned = stats.namespaces_cleaned,
                reconciled = stats.reconciled,
                kept_alive = stats.kept_alive,
                recovered = stats.recovered,
                claimed = stats.claimed,
                launched = stats.launched,
                deferred = stats.deferred,
                succeeded = stats.succeeded,
                failed = stats.failed,
                canceled = stats.canceled,
                errors = stats.errors,
                "orchestrator tick complete"
            );
        }

        Ok(stats)
    }

    /// Claim up to `max_claims_per_tick` pending runs and start each one.
    async fn claim_pending(
        &self,
        now: DateTime<Utc>,
        stats: &mut TickStats,
    ) -> Result<(), OrchestratorError> {
        let request = ClaimRequest {
            worker_id: self.config.worker_id.clone(),
            slots_per_project: self.config.slots_per_project,
            slot_lease_ttl: self.config.slot_lease_ttl,
            run_lease_ttl: self.config.run_lease_ttl,
            learning_mode_default: self.config.learning_mode_default,
            scan_limit: self.config.claim_scan_limit,
            now,
        };

        for _ in 0..self.config.max_claims_per_tick {
            let Some(claimed) = self.deps.queue.claim_next_pending(&request).await? else {
                break;
            };
            stats.claimed += 1;

            let run: RunningRun = claimed.into();
            match self.start_run(&run, now).await {
                Ok(outcome) => stats.record(outcome),
                Err(e) => {
                    stats.errors += 1;
                    warn!(run_id = %run.run_id, error = %e, "failed to start claimed run");
                }
            }
        }

        Ok(())
    }
}

/// Await `call`, mapping an elapsed `timeout` through `on_timeout`.
pub(crate) async fn bounded<T, E>(
    timeout: Duration,
    call: impl Future<Output = Result<T, E>>,
    on_timeout: impl FnOnce(Duration) -> E,
) -> Result<T, E> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(timeout)),
    }
}
