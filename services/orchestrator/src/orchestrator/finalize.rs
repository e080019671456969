//! Terminal transitions and event emission.

use chrono::{DateTime, Utc};
use runbay_events::{
    event_types, FailureReason, FlowEvent, RunFinishedPayload, RunStatus, RunTerminalStatus,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{bounded, Orchestrator, OrchestratorError, RunOutcome};
use crate::credentials::{CredentialError, RunStatusNotification};
use crate::db::{FinishRun, RunningRun};

/// How a run ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalization {
    Succeeded { deploy_only: bool },
    Failed { reason: FailureReason, message: String },
    Canceled { message: Option<String> },
}

impl Finalization {
    pub fn failed(reason: FailureReason, message: impl Into<String>) -> Self {
        Finalization::Failed {
            reason,
            message: message.into(),
        }
    }

    pub fn status(&self) -> RunTerminalStatus {
        match self {
            Finalization::Succeeded { .. } => RunTerminalStatus::Succeeded,
            Finalization::Failed { .. } => RunTerminalStatus::Failed,
            Finalization::Canceled { .. } => RunTerminalStatus::Canceled,
        }
    }

    pub fn event_type(&self) -> String {
        match self {
            Finalization::Succeeded { .. } => event_types::RUN_SUCCEEDED.to_string(),
            Finalization::Failed { reason, .. } => reason.event_type(),
            Finalization::Canceled { .. } => event_types::RUN_CANCELED.to_string(),
        }
    }

    fn payload(&self) -> RunFinishedPayload {
        match self {
            Finalization::Succeeded { deploy_only } => RunFinishedPayload {
                status: RunTerminalStatus::Succeeded,
                reason: None,
                message: None,
                deploy_only: *deploy_only,
            },
            Finalization::Failed { reason, message } => RunFinishedPayload {
                status: RunTerminalStatus::Failed,
                reason: Some(*reason),
                message: Some(message.clone()),
                deploy_only: false,
            },
            Finalization::Canceled { message } => RunFinishedPayload {
                status: RunTerminalStatus::Canceled,
                reason: None,
                message: message.clone(),
                deploy_only: false,
            },
        }
    }

    fn summary(&self) -> String {
        match self {
            Finalization::Succeeded { deploy_only: true } => "deploy-only run succeeded".to_string(),
            Finalization::Succeeded { deploy_only: false } => "run succeeded".to_string(),
            Finalization::Failed { reason, message } => format!("run failed ({reason}): {message}"),
            Finalization::Canceled { message: Some(message) } => {
                format!("run canceled: {message}")
            }
            Finalization::Canceled { message: None } => "run canceled".to_string(),
        }
    }
}

impl Orchestrator {
    /// Move a run to its terminal state.
    ///
    /// The status update happens first and is conditional; the terminal
    /// event is written only by the caller whose update took effect, so a
    /// run never gets two terminal events.
    pub(super) async fn finalize(
        &self,
        run: &RunningRun,
        finalization: Finalization,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, OrchestratorError> {
        let status = finalization.status();
        let updated = self
            .deps
            .queue
            .finish_run(&FinishRun {
                run_id: run.run_id,
                worker_id: self.config.worker_id.clone(),
                status,
                finished_at: now,
            })
            .await?;

        if !updated {
            debug!(run_id = %run.run_id, ?status, "run already finalized elsewhere");
            return Ok(RunOutcome::AlreadyFinal);
        }

        self.emit(run, &finalization.event_type(), &finalization.payload(), now)
            .await?;

        match &finalization {
            Finalization::Failed { reason, message } => {
                warn!(run_id = %run.run_id, %reason, %message, "run failed");
            }
            other => info!(run_id = %run.run_id, ?status, summary = %other.summary(), "run finalized"),
        }

        self.notify(run, Some(status.into()), finalization.summary())
            .await;

        Ok(RunOutcome::Finalized(status))
    }

    /// Event attributed to this worker for `run`.
    pub(super) fn run_event(
        &self,
        run: &RunningRun,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> FlowEvent {
        FlowEvent::system(event_type, &run.correlation_id, &self.config.worker_id)
            .for_run(run.run_id, Some(run.project_id))
            .at(now)
    }

    /// Append an event for `run`. Store errors are returned, never dropped.
    pub(super) async fn emit<P: Serialize + Sync>(
        &self,
        run: &RunningRun,
        event_type: &str,
        payload: &P,
        now: DateTime<Utc>,
    ) -> Result<i64, OrchestratorError> {
        let event = self.run_event(run, event_type, now).with_payload(payload)?;
        let event_id = self.deps.events.insert(&event).await?;
        debug!(run_id = %run.run_id, event_type, event_id, "flow event recorded");
        Ok(event_id)
    }

    /// Best-effort status notification.
    pub(super) async fn notify(&self, run: &RunningRun, status: Option<RunStatus>, message: String) {
        let notification = RunStatusNotification {
            run_id: Some(run.run_id),
            project_id: run.project_id,
            correlation_id: run.correlation_id.clone(),
            status,
            message,
        };
        self.send_notification(&notification).await;
    }

    pub(super) async fn send_notification(&self, notification: &RunStatusNotification) {
        if let Err(e) = bounded(
            self.config.cluster_call_timeout,
            self.deps.notifier.notify(notification),
            CredentialError::Timeout,
        )
        .await
        {
            warn!(
                run_id = ?notification.run_id,
                error = %e,
                "failed to send run status notification"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_types() {
        assert_eq!(
            Finalization::Succeeded { deploy_only: false }.event_type(),
            "run.succeeded"
        );
        assert_eq!(
            Finalization::Canceled { message: None }.event_type(),
            "run.canceled"
        );
        assert_eq!(
            Finalization::failed(FailureReason::FailedPrecondition, "x").event_type(),
            "run.failed.precondition"
        );
        assert_eq!(
            Finalization::failed(FailureReason::KubernetesJobNotFound, "x").event_type(),
            "run.failed.kubernetes_job_not_found"
        );
    }

    #[test]
    fn test_payload_carries_reason() {
        let payload = Finalization::failed(FailureReason::JobLaunchFailed, "quota").payload();
        assert_eq!(payload.status, RunTerminalStatus::Failed);
        assert_eq!(payload.reason, Some(FailureReason::JobLaunchFailed));
        assert_eq!(payload.message.as_deref(), Some("quota"));

        let payload = Finalization::Succeeded { deploy_only: true }.payload();
        assert!(payload.deploy_only);
        assert_eq!(payload.reason, None);
    }
}
