//! Starting a claimed run: profile, namespace lease, environment, job.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use runbay_events::{
    event_types, format_lease_ttl, CleanupSkippedPayload, FailureReason, NamespaceCleanedPayload,
    NamespaceLeasePayload, RunStartedPayload, RunStatus, RunTerminalStatus, RuntimeMode,
};
use tracing::{debug, info, instrument, warn};

use super::{bounded, Finalization, Orchestrator, OrchestratorError, TickStats};
use crate::agent_context::{resolve_agent_context, AgentContext};
use crate::credentials::{CredentialError, McpToken, RunAccessKey, RunStatusNotification};
use crate::db::RunningRun;
use crate::execution_context::{resolve_execution_context, ExecutionContext, FALLBACK_NAMESPACE};
use crate::image::select_job_image;
use crate::launcher::{JobSpec, LaunchOutcome, LauncherError};
use crate::namespace_policy::{LeaseRequest, NamespaceLease};
use crate::payload::RunPayload;
use crate::preparer::{prepare_runtime_environment_poll, PrepareRequest, PreparationPoll};

/// What processing a run did this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Launched { recovered: bool },
    /// Job still active; leases renewed.
    KeptAlive,
    /// Environment not ready; retried on a later tick. `transient` marks a
    /// preparer that could not be reached rather than one still building.
    Deferred { transient: bool },
    /// Job missing but still inside the grace window.
    Waiting,
    Finalized(RunTerminalStatus),
    /// Another worker finalized the run first.
    AlreadyFinal,
}

/// Whether the environment step produced a namespace to launch into.
enum Environment {
    Ready { namespace: String },
    Pending { transient: bool },
    Done(RunOutcome),
}

impl Orchestrator {
    /// Start a freshly claimed run.
    #[instrument(skip_all, fields(run_id = %run.run_id, project_id = %run.project_id))]
    pub(super) async fn start_run(
        &self,
        run: &RunningRun,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, OrchestratorError> {
        info!(slot_no = ?run.slot_no, "claimed run");

        let payload = RunPayload::from_value(&run.payload);
        let agent = match resolve_agent_context(run.run_id, &payload, &self.config.agent_defaults)
        {
            Ok(agent) => agent,
            Err(e) => {
                return self
                    .finalize(run, Finalization::failed(e.failure_reason(), e.to_string()), now)
                    .await
            }
        };

        self.emit(
            run,
            event_types::RUN_PROFILE_RESOLVED,
            &agent.profile_payload(),
            now,
        )
        .await?;

        self.prepare_and_launch(run, &payload, &agent, now, false)
            .await
    }

    /// Bring up the environment (full-env runs) and launch the job.
    ///
    /// On a recovery pass the namespace lease is re-acquired silently: the
    /// lease events were recorded when the run was claimed.
    pub(super) async fn prepare_and_launch(
        &self,
        run: &RunningRun,
        payload: &RunPayload,
        agent: &AgentContext,
        now: DateTime<Utc>,
        recovered: bool,
    ) -> Result<RunOutcome, OrchestratorError> {
        let context = resolve_execution_context(
            run.run_id,
            run.project_id,
            payload,
            &self.config.namespace_prefix,
        );

        let namespace = if context.is_full_env() {
            match self
                .prepare_environment(run, payload, agent, &context, now, !recovered)
                .await?
            {
                Environment::Ready { namespace } => Some(namespace),
                Environment::Pending { transient } => {
                    return Ok(RunOutcome::Deferred { transient })
                }
                Environment::Done(outcome) => return Ok(outcome),
            }
        } else {
            None
        };

        if payload.is_deploy_only() {
            return self
                .finalize(run, Finalization::Succeeded { deploy_only: true }, now)
                .await;
        }

        self.launch_job(run, payload, agent, &context, namespace.as_deref(), now, recovered)
            .await
    }

    async fn prepare_environment(
        &self,
        run: &RunningRun,
        payload: &RunPayload,
        agent: &AgentContext,
        context: &ExecutionContext,
        now: DateTime<Utc>,
        announce: bool,
    ) -> Result<Environment, OrchestratorError> {
        let policy = &self.config.namespace_policy;
        let request = LeaseRequest {
            run_id: run.run_id,
            project_id: run.project_id,
            issue_number: context.issue_number,
            agent_key: &agent.agent_key,
            is_revise: agent.trigger_kind.is_revise(),
            explicit_namespace: payload.explicit_namespace().is_some(),
            namespace: context.namespace.as_deref().unwrap_or(FALLBACK_NAMESPACE),
            cleanup_skip: policy.cleanup_skip_reason(payload),
            now,
        };

        let lease = match bounded(
            self.config.cluster_call_timeout,
            policy.acquire(self.deps.launcher.as_ref(), &request),
            LauncherError::Timeout,
        )
        .await
        {
            Ok(lease) => lease,
            Err(e) => {
                let outcome = self
                    .finalize(
                        run,
                        Finalization::failed(FailureReason::NamespacePrepareFailed, e.to_string()),
                        now,
                    )
                    .await?;
                return Ok(Environment::Done(outcome));
            }
        };

        if announce {
            self.announce_lease(run, &lease, now).await?;
        }

        let prepare = PrepareRequest {
            run_id: run.run_id,
            project_id: run.project_id,
            runtime_mode: context.runtime_mode,
            namespace: Some(lease.namespace.clone()),
            target_env: payload.runtime.target_env.clone(),
            slot_no: run.slot_no.unwrap_or(0),
            repository: Some(agent.repository.clone()),
            services_path: payload.repository.services_path.clone(),
            build_ref: payload.runtime.build_ref.clone(),
            deploy_only: payload.is_deploy_only(),
        };

        let poll = prepare_runtime_environment_poll(
            self.deps.preparer.as_ref(),
            &prepare,
            self.config.prepare_retry_interval,
        )
        .await;

        let finalization = match poll {
            PreparationPoll::Ready(response) => {
                debug!(namespace = %response.namespace, "environment ready");
                return Ok(Environment::Ready {
                    namespace: response.namespace,
                });
            }
            PreparationPoll::NotReady { reason } => {
                info!(namespace = %lease.namespace, %reason, "environment not ready yet");
                return Ok(Environment::Pending { transient: false });
            }
            PreparationPoll::Unavailable { reason } => {
                warn!(namespace = %lease.namespace, %reason, "environment preparer unavailable");
                return Ok(Environment::Pending { transient: true });
            }
            PreparationPoll::Canceled { message } => Finalization::Canceled {
                message: Some(message),
            },
            PreparationPoll::Failed { message } => {
                Finalization::failed(FailureReason::RuntimePrepareFailed, message)
            }
        };

        Ok(Environment::Done(
            self.finalize(run, finalization, now).await?,
        ))
    }

    /// Record the lease events for a freshly acquired namespace.
    async fn announce_lease(
        &self,
        run: &RunningRun,
        lease: &NamespaceLease,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        let payload = NamespaceLeasePayload {
            namespace: lease.namespace.clone(),
            project_id: run.project_id,
            issue_number: lease.issue_number,
            agent_key: lease.agent_key.clone(),
            lease_ttl: format_lease_ttl(lease.ttl),
            expires_at: lease.expires_at,
            reused: lease.reused,
        };

        if lease.reused {
            self.emit(run, event_types::RUN_NAMESPACE_TTL_EXTENDED, &payload, now)
                .await?;
        } else {
            self.emit(run, event_types::RUN_NAMESPACE_PREPARED, &payload, now)
                .await?;
            self.emit(run, event_types::RUN_NAMESPACE_TTL_SCHEDULED, &payload, now)
                .await?;
        }

        if let Some(reason) = lease.cleanup_skip {
            self.emit(
                run,
                event_types::RUN_NAMESPACE_CLEANUP_SKIPPED,
                &CleanupSkippedPayload {
                    namespace: lease.namespace.clone(),
                    reason,
                },
                now,
            )
            .await?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn launch_job(
        &self,
        run: &RunningRun,
        payload: &RunPayload,
        agent: &AgentContext,
        context: &ExecutionContext,
        namespace: Option<&str>,
        now: DateTime<Utc>,
        recovered: bool,
    ) -> Result<RunOutcome, OrchestratorError> {
        let selection = match select_job_image(
            self.deps.image_checker.as_deref(),
            &self.config.job_image,
            self.config.job_image_fallback.as_deref(),
            self.config.cluster_call_timeout,
        )
        .await
        {
            Ok(selection) => selection,
            Err(e) => {
                return self
                    .finalize(
                        run,
                        Finalization::failed(
                            FailureReason::JobImageUnavailable,
                            format!("{}: {e}", e.code()),
                        ),
                        now,
                    )
                    .await
            }
        };

        let token = match bounded(
            self.config.cluster_call_timeout,
            self.deps
                .mcp_tokens
                .issue(run.run_id, run.project_id, self.config.mcp_token_ttl),
            CredentialError::Timeout,
        )
        .await
        {
            Ok(token) => token,
            Err(e) => {
                return self
                    .finalize(
                        run,
                        Finalization::failed(FailureReason::McpTokenIssueFailed, e.to_string()),
                        now,
                    )
                    .await
            }
        };

        let access_key = match bounded(
            self.config.cluster_call_timeout,
            self.deps.access_keys.issue(run.run_id, run.project_id),
            CredentialError::Timeout,
        )
        .await
        {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "run access key unavailable, launching without it");
                None
            }
        };

        let job_ref = self.deps.launcher.job_ref(run.run_id, namespace);
        let env = build_job_env(&JobEnvInput {
            run,
            payload,
            agent,
            runtime_mode: context.runtime_mode,
            namespace,
            mcp_token: &token,
            access_key: access_key.as_ref(),
        });
        let spec = JobSpec::new(
            job_ref.clone(),
            run.run_id,
            run.project_id,
            selection.image.clone(),
        )
        .with_env(env);

        match bounded(
            self.config.cluster_call_timeout,
            self.deps.launcher.launch(&spec),
            LauncherError::Timeout,
        )
        .await
        {
            Ok(LaunchOutcome::Created) => {}
            Ok(LaunchOutcome::AlreadyExists) => {
                debug!(job = %job_ref, "job already exists, adopting it");
            }
            Err(e) => {
                return self
                    .finalize(
                        run,
                        Finalization::failed(FailureReason::JobLaunchFailed, e.to_string()),
                        now,
                    )
                    .await
            }
        }

        self.emit(
            run,
            event_types::RUN_STARTED,
            &RunStartedPayload {
                runtime_mode: context.runtime_mode,
                namespace: namespace.map(str::to_string),
                job_namespace: job_ref.namespace.clone(),
                job_name: job_ref.name.clone(),
                image: selection.image.clone(),
                image_source: selection.source.as_str().to_string(),
                slot_no: run.slot_no.unwrap_or(0),
                recovered,
            },
            now,
        )
        .await?;

        info!(
            run_id = %run.run_id,
            job = %job_ref,
            image = %selection.image,
            image_source = selection.source.as_str(),
            recovered,
            "run job launched"
        );
        self.notify(run, Some(RunStatus::Running), format!("job {job_ref} launched"))
            .await;

        Ok(RunOutcome::Launched { recovered })
    }

    /// Delete expired namespaces. Sweep failures never fail the tick.
    pub(super) async fn sweep_namespaces(&self, now: DateTime<Utc>, stats: &mut TickStats) {
        let cleaned = match bounded(
            self.config.cluster_call_timeout,
            self.deps
                .launcher
                .cleanup_expired_namespaces(now, self.config.namespace_sweep_limit),
            LauncherError::Timeout,
        )
        .await
        {
            Ok(cleaned) => cleaned,
            Err(e) => {
                stats.errors += 1;
                warn!(error = %e, "namespace sweep failed");
                return;
            }
        };

        for namespace in cleaned {
            stats.namespaces_cleaned += 1;
            info!(
                namespace = %namespace.name,
                project_id = %namespace.project_id,
                expired_at = %namespace.expired_at,
                "expired namespace cleaned"
            );

            let correlation_id = format!("namespace:{}", namespace.name);
            let event = runbay_events::FlowEvent::system(
                event_types::RUN_NAMESPACE_CLEANED,
                correlation_id.clone(),
                self.config.worker_id.clone(),
            )
            .at(now)
            .with_payload(&NamespaceCleanedPayload {
                namespace: namespace.name.clone(),
                issue_number: namespace.issue_number,
                agent_key: namespace.agent_key.clone(),
                expired_at: namespace.expired_at,
            });

            let recorded = match event {
                Ok(mut event) => {
                    event.project_id = Some(namespace.project_id);
                    self.deps.events.insert(&event).await.map(|_| ()).map_err(OrchestratorError::from)
                }
                Err(e) => Err(e.into()),
            };
            if let Err(e) = recorded {
                stats.errors += 1;
                warn!(namespace = %namespace.name, error = %e, "failed to record namespace cleanup");
            }

            self.send_notification(&RunStatusNotification {
                run_id: None,
                project_id: namespace.project_id,
                correlation_id,
                status: None,
                message: format!("namespace {} expired and was deleted", namespace.name),
            })
            .await;
        }
    }
}

/// Inputs to [`build_job_env`].
pub struct JobEnvInput<'a> {
    pub run: &'a RunningRun,
    pub payload: &'a RunPayload,
    pub agent: &'a AgentContext,
    pub runtime_mode: RuntimeMode,
    pub namespace: Option<&'a str>,
    pub mcp_token: &'a McpToken,
    pub access_key: Option<&'a RunAccessKey>,
}

/// Environment variables handed to the agent job.
pub fn build_job_env(input: &JobEnvInput<'_>) -> BTreeMap<String, String> {
    let JobEnvInput {
        run,
        payload,
        agent,
        runtime_mode,
        namespace,
        mcp_token,
        access_key,
    } = input;

    let mut env = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        env.insert(key.to_string(), value);
    };

    set("RUNBAY_RUN_ID", run.run_id.to_string());
    set("RUNBAY_PROJECT_ID", run.project_id.to_string());
    set("RUNBAY_CORRELATION_ID", run.correlation_id.clone());
    set("RUNBAY_TRIGGER_KIND", agent.trigger_kind.as_str().to_string());
    set("RUNBAY_AGENT_KEY", agent.agent_key.clone());
    set("RUNBAY_REPOSITORY", agent.repository.clone());
    set("RUNBAY_RUNTIME_MODE", runtime_mode.as_str().to_string());
    set("RUNBAY_MODEL", agent.model.clone());
    set("RUNBAY_REASONING_EFFORT", agent.reasoning_effort.clone());
    set("RUNBAY_TEMPLATE_KIND", agent.template_kind.as_str().to_string());
    set("RUNBAY_TARGET_BRANCH", agent.target_branch.clone());
    set("RUNBAY_LEARNING_MODE", run.learning_mode.to_string());
    set(
        "RUNBAY_MARKDOWN_ONLY",
        agent.trigger_kind.is_markdown_only().to_string(),
    );
    set(
        "RUNBAY_WRITE_SCOPE",
        agent.trigger_kind.write_scope().as_str().to_string(),
    );
    set("RUNBAY_MCP_TOKEN", mcp_token.token.clone());

    if let Some(namespace) = namespace {
        set("RUNBAY_NAMESPACE", namespace.to_string());
    }
    if let Some(target_env) = payload.runtime.target_env.as_deref() {
        set("RUNBAY_TARGET_ENV", target_env.to_string());
    }
    if let Some(issue) = payload.issue_number() {
        set("RUNBAY_ISSUE_NUMBER", issue.to_string());
    }
    if let Some(pr) = agent.existing_pr_number {
        set("RUNBAY_PR_NUMBER", pr.to_string());
    }
    if let Some(key) = access_key {
        set("RUNBAY_ACCESS_KEY", key.0.clone());
    }

    env
}
