//! Reconciling running runs against their jobs.

use chrono::{DateTime, Utc};
use runbay_events::FailureReason;
use runbay_reconcile::{JobState, ReconcileAction, RecoveryPhase};
use tracing::{debug, info, instrument, warn};

use super::{bounded, Finalization, Orchestrator, OrchestratorError, RunOutcome, TickStats};
use crate::agent_context::resolve_agent_context;
use crate::db::{ExtendLease, RunningRun};
use crate::execution_context::resolve_execution_context;
use crate::launcher::LauncherError;
use crate::payload::RunPayload;

impl Orchestrator {
    /// Take over this worker's running runs (and any with expired leases)
    /// and drive each one through a reconcile step.
    pub(super) async fn reconcile_running(
        &self,
        now: DateTime<Utc>,
        stats: &mut TickStats,
    ) -> Result<(), OrchestratorError> {
        let runs = self
            .deps
            .queue
            .claim_running(
                &self.config.worker_id,
                self.config.run_lease_ttl,
                self.config.reconcile_limit,
                now,
            )
            .await?;

        for run in runs {
            stats.reconciled += 1;
            match self.reconcile_run(&run, now).await {
                Ok(outcome) => stats.record(outcome),
                Err(e) => {
                    stats.errors += 1;
                    warn!(run_id = %run.run_id, error = %e, "failed to reconcile run");
                }
            }
        }

        Ok(())
    }

    #[instrument(skip_all, fields(run_id = %run.run_id, project_id = %run.project_id))]
    async fn reconcile_run(
        &self,
        run: &RunningRun,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, OrchestratorError> {
        let state = self.observe_job(run).await?;
        debug!(state = state.as_str(), "observed job state");

        match ReconcileAction::for_state(state) {
            ReconcileAction::KeepAlive => {
                let extended = self
                    .deps
                    .queue
                    .extend_lease(&ExtendLease {
                        run_id: run.run_id,
                        project_id: run.project_id,
                        worker_id: self.config.worker_id.clone(),
                        lease_ttl: self.config.run_lease_ttl,
                        now,
                    })
                    .await?;
                if !extended {
                    debug!("lease no longer held by this worker");
                }
                Ok(RunOutcome::KeptAlive)
            }
            ReconcileAction::FinalizeSucceeded => {
                self.finalize(run, Finalization::Succeeded { deploy_only: false }, now)
                    .await
            }
            ReconcileAction::FinalizeFailed => {
                self.finalize(
                    run,
                    Finalization::failed(
                        FailureReason::KubernetesJobFailed,
                        "agent job finished with failure",
                    ),
                    now,
                )
                .await
            }
            ReconcileAction::RecoverMissingJob => self.recover_missing_job(run, now).await,
        }
    }

    /// Job state of `run`. A job missing at its expected reference is
    /// looked up again by its run-id label, since reused and preparer-chosen
    /// namespaces differ from the derived one.
    async fn observe_job(&self, run: &RunningRun) -> Result<JobState, OrchestratorError> {
        let payload = RunPayload::from_value(&run.payload);
        let context = resolve_execution_context(
            run.run_id,
            run.project_id,
            &payload,
            &self.config.namespace_prefix,
        );
        let expected = self
            .deps
            .launcher
            .job_ref(run.run_id, context.namespace.as_deref());

        let state = self.job_status(&expected).await?;
        if state != JobState::NotFound {
            return Ok(state);
        }

        let found = bounded(
            self.config.cluster_call_timeout,
            self.deps.launcher.find_run_job_ref_by_run_id(run.run_id),
            LauncherError::Timeout,
        )
        .await?;

        match found {
            Some(job_ref) if job_ref != expected => {
                debug!(expected = %expected, found = %job_ref, "job found by run-id label");
                self.job_status(&job_ref).await
            }
            _ => Ok(JobState::NotFound),
        }
    }

    async fn job_status(
        &self,
        job_ref: &crate::launcher::JobRef,
    ) -> Result<JobState, OrchestratorError> {
        Ok(bounded(
            self.config.cluster_call_timeout,
            self.deps.launcher.status(job_ref),
            LauncherError::Timeout,
        )
        .await?)
    }

    /// Handle a running run whose job does not exist.
    async fn recover_missing_job(
        &self,
        run: &RunningRun,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, OrchestratorError> {
        let phase = self.recovery.phase(run.started_at, now);
        if phase == RecoveryPhase::Grace {
            debug!("job missing inside grace window");
            return Ok(RunOutcome::Waiting);
        }

        let payload = RunPayload::from_value(&run.payload);
        let context = resolve_execution_context(
            run.run_id,
            run.project_id,
            &payload,
            &self.config.namespace_prefix,
        );

        if !context.is_full_env() {
            return self.fail_not_found(run, "agent job not found", now).await;
        }

        let agent = match resolve_agent_context(run.run_id, &payload, &self.config.agent_defaults)
        {
            Ok(agent) => agent,
            Err(e) => {
                return self
                    .finalize(run, Finalization::failed(e.failure_reason(), e.to_string()), now)
                    .await
            }
        };

        info!(?phase, "job missing, re-polling environment preparation");
        let outcome = self
            .prepare_and_launch(run, &payload, &agent, now, true)
            .await?;

        // Past grace, a preparer that answers without a namespace means the
        // job is not coming back. An unreachable preparer is retried until
        // the run lease budget runs out.
        match (outcome, phase) {
            (RunOutcome::Deferred { transient: false }, _) => {
                self.fail_not_found(
                    run,
                    "agent job not found and environment not ready after grace window",
                    now,
                )
                .await
            }
            (RunOutcome::Deferred { transient: true }, RecoveryPhase::Exhausted) => {
                self.fail_not_found(
                    run,
                    "environment preparer unavailable for the whole run lease budget",
                    now,
                )
                .await
            }
            (outcome, _) => Ok(outcome),
        }
    }

    async fn fail_not_found(
        &self,
        run: &RunningRun,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, OrchestratorError> {
        self.finalize(
            run,
            Finalization::failed(FailureReason::KubernetesJobNotFound, message),
            now,
        )
        .await
    }
}
