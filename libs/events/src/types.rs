//! Flow event type definitions and payloads.
//!
//! Each event type has a corresponding payload struct with the event-specific
//! data. Payload fields are additive; consumers ignore unknown fields.

use chrono::{DateTime, Utc};
use runbay_id::ProjectId;
use serde::{Deserialize, Serialize};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Run lifecycle
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_SUCCEEDED: &str = "run.succeeded";
    pub const RUN_CANCELED: &str = "run.canceled";
    pub const RUN_FAILED_PREFIX: &str = "run.failed.";

    // Agent profile
    pub const RUN_PROFILE_RESOLVED: &str = "run.profile.resolved";

    // Namespace lease
    pub const RUN_NAMESPACE_PREPARED: &str = "run.namespace.prepared";
    pub const RUN_NAMESPACE_TTL_SCHEDULED: &str = "run.namespace.ttl_scheduled";
    pub const RUN_NAMESPACE_TTL_EXTENDED: &str = "run.namespace.ttl_extended";
    pub const RUN_NAMESPACE_CLEANUP_SKIPPED: &str = "run.namespace.cleanup_skipped";
    pub const RUN_NAMESPACE_CLEANED: &str = "run.namespace.cleaned";

    /// Returns true if the event type marks a terminal run transition.
    pub fn is_terminal(event_type: &str) -> bool {
        event_type == RUN_SUCCEEDED
            || event_type == RUN_CANCELED
            || event_type.starts_with(RUN_FAILED_PREFIX)
    }
}

// =============================================================================
// Status Enums
// =============================================================================

/// Run lifecycle status as stored in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "canceled" => Some(RunStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTerminalStatus {
    Succeeded,
    Failed,
    Canceled,
}

impl From<RunTerminalStatus> for RunStatus {
    fn from(status: RunTerminalStatus) -> Self {
        match status {
            RunTerminalStatus::Succeeded => RunStatus::Succeeded,
            RunTerminalStatus::Failed => RunStatus::Failed,
            RunTerminalStatus::Canceled => RunStatus::Canceled,
        }
    }
}

/// Why a run was finalized as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Conflicting labels, missing identity fields, reviewer-mode violations.
    FailedPrecondition,
    AgentContextResolveFailed,
    NamespacePrepareFailed,
    RuntimePrepareFailed,
    McpTokenIssueFailed,
    JobImageUnavailable,
    JobLaunchFailed,
    KubernetesJobNotFound,
    KubernetesJobFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::FailedPrecondition => "failed_precondition",
            FailureReason::AgentContextResolveFailed => "agent_context_resolve_failed",
            FailureReason::NamespacePrepareFailed => "namespace_prepare_failed",
            FailureReason::RuntimePrepareFailed => "runtime_prepare_failed",
            FailureReason::McpTokenIssueFailed => "mcp_token_issue_failed",
            FailureReason::JobImageUnavailable => "job_image_unavailable",
            FailureReason::JobLaunchFailed => "job_launch_failed",
            FailureReason::KubernetesJobNotFound => "kubernetes_job_not_found",
            FailureReason::KubernetesJobFailed => "kubernetes_job_failed",
        }
    }

    /// The `run.failed.*` event type for this reason.
    pub fn event_type(&self) -> String {
        match self {
            FailureReason::FailedPrecondition => {
                format!("{}precondition", event_types::RUN_FAILED_PREFIX)
            }
            other => format!("{}{}", event_types::RUN_FAILED_PREFIX, other.as_str()),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime mode of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeMode {
    /// The agent works on the repository only; no environment stack.
    #[serde(rename = "code-only")]
    CodeOnly,
    /// The run gets an isolated namespace with a deployed environment.
    #[serde(rename = "full-env")]
    FullEnv,
}

impl RuntimeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeMode::CodeOnly => "code-only",
            RuntimeMode::FullEnv => "full-env",
        }
    }

    /// Lenient parse accepting `-` / `_` spellings.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "code-only" => Some(RuntimeMode::CodeOnly),
            "full-env" => Some(RuntimeMode::FullEnv),
            _ => None,
        }
    }
}

impl std::fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a resolved agent profile value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileSource {
    PullRequestLabel,
    IssueLabel,
    LastRun,
    Default,
}

/// Why namespace cleanup is skipped for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupSkipReason {
    CleanupDisabled,
    DebugLabel,
}

impl CleanupSkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupSkipReason::CleanupDisabled => "cleanup_disabled",
            CleanupSkipReason::DebugLabel => "debug_label",
        }
    }
}

// =============================================================================
// Run Payloads
// =============================================================================

/// Payload for `run.started`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub runtime_mode: RuntimeMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub job_namespace: String,
    pub job_name: String,
    pub image: String,
    pub image_source: String,
    pub slot_no: i32,
    /// True when the job was launched by the not-found recovery path.
    #[serde(default)]
    pub recovered: bool,
}

/// Payload for `run.succeeded`, `run.failed.*` and `run.canceled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFinishedPayload {
    pub status: RunTerminalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub deploy_only: bool,
}

/// Payload for `run.profile.resolved`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileResolvedPayload {
    pub model: String,
    pub model_source: ProfileSource,
    pub reasoning_effort: String,
    pub reasoning_source: ProfileSource,
    pub template_kind: String,
    pub target_branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_pr_number: Option<i64>,
}

// =============================================================================
// Namespace Payloads
// =============================================================================

/// Payload for `run.namespace.prepared`, `ttl_scheduled` and `ttl_extended`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceLeasePayload {
    pub namespace: String,
    pub project_id: ProjectId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<i64>,
    pub agent_key: String,
    /// Lease TTL rendered as seconds, e.g. `"86400s"`.
    pub lease_ttl: String,
    pub expires_at: DateTime<Utc>,
    pub reused: bool,
}

/// Payload for `run.namespace.cleanup_skipped`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupSkippedPayload {
    pub namespace: String,
    pub reason: CleanupSkipReason,
}

/// Payload for `run.namespace.cleaned`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceCleanedPayload {
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<i64>,
    pub agent_key: String,
    pub expired_at: DateTime<Utc>,
}

/// Render a TTL the way lease payloads carry it.
pub fn format_lease_ttl(ttl: std::time::Duration) -> String {
    format!("{}s", ttl.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(FailureReason::FailedPrecondition, "run.failed.precondition")]
    #[case(FailureReason::KubernetesJobNotFound, "run.failed.kubernetes_job_not_found")]
    #[case(FailureReason::KubernetesJobFailed, "run.failed.kubernetes_job_failed")]
    #[case(FailureReason::McpTokenIssueFailed, "run.failed.mcp_token_issue_failed")]
    fn test_failure_event_types(#[case] reason: FailureReason, #[case] expected: &str) {
        assert_eq!(reason.event_type(), expected);
        assert!(event_types::is_terminal(&reason.event_type()));
    }

    #[rstest]
    #[case("code-only", Some(RuntimeMode::CodeOnly))]
    #[case("FULL_ENV", Some(RuntimeMode::FullEnv))]
    #[case("full-env", Some(RuntimeMode::FullEnv))]
    #[case("sandbox", None)]
    fn test_runtime_mode_parse(#[case] input: &str, #[case] expected: Option<RuntimeMode>) {
        assert_eq!(RuntimeMode::parse(input), expected);
    }

    #[test]
    fn test_run_status_roundtrip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Canceled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_non_terminal_event_types() {
        assert!(!event_types::is_terminal(event_types::RUN_STARTED));
        assert!(!event_types::is_terminal(event_types::RUN_NAMESPACE_TTL_EXTENDED));
    }

    #[test]
    fn test_runtime_mode_serde() {
        let json = serde_json::to_string(&RuntimeMode::FullEnv).unwrap();
        assert_eq!(json, "\"full-env\"");
    }

    #[test]
    fn test_format_lease_ttl() {
        assert_eq!(
            format_lease_ttl(std::time::Duration::from_secs(86_400)),
            "86400s"
        );
    }
}
