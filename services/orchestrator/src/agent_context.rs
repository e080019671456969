//! Agent context: model, reasoning effort, template and target branch.
//!
//! Label overrides use the forms `[ai-model-<model>]` and
//! `[ai-reasoning-<effort>]`. Precedence, highest first: pull request labels
//! (revise runs only), issue labels, hints from the last run, configured
//! defaults.

use std::collections::BTreeSet;

use runbay_events::{FailureReason, ProfileResolvedPayload, ProfileSource};
use runbay_id::RunId;
use thiserror::Error;
use tracing::warn;

use crate::payload::{RunPayload, TemplateKind, TriggerKind};

const MODEL_LABEL_PREFIX: &str = "[ai-model-";
const REASONING_LABEL_PREFIX: &str = "[ai-reasoning-";

/// Reasoning efforts the agent runtime accepts.
pub const SUPPORTED_REASONING_EFFORTS: [&str; 4] = ["low", "medium", "high", "xhigh"];

/// Which label family a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Model,
    Reasoning,
}

impl std::fmt::Display for LabelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelKind::Model => f.write_str("ai-model"),
            LabelKind::Reasoning => f.write_str("ai-reasoning"),
        }
    }
}

/// Agent context resolution errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentContextError {
    #[error("conflicting {kind} labels on {level:?}: {values:?}")]
    ConflictingLabels {
        kind: LabelKind,
        level: ProfileSource,
        values: Vec<String>,
    },

    #[error("unsupported reasoning effort '{value}' from {origin:?}")]
    UnsupportedReasoning { value: String, origin: ProfileSource },

    #[error("run payload has no repository full name")]
    MissingRepository,

    #[error("{trigger} run requires a pull request number")]
    MissingPullRequest { trigger: TriggerKind },

    #[error("invalid agent defaults: {0}")]
    InvalidDefaults(String),
}

impl AgentContextError {
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            AgentContextError::InvalidDefaults(_) => FailureReason::AgentContextResolveFailed,
            AgentContextError::ConflictingLabels { .. }
            | AgentContextError::UnsupportedReasoning { .. }
            | AgentContextError::MissingRepository
            | AgentContextError::MissingPullRequest { .. } => FailureReason::FailedPrecondition,
        }
    }
}

/// Configured fallbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDefaults {
    pub model: String,
    pub reasoning_effort: String,
    pub branch_prefix: String,
}

/// Resolved agent configuration for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentContext {
    pub trigger_kind: TriggerKind,
    pub agent_key: String,
    pub repository: String,
    pub model: String,
    pub model_source: ProfileSource,
    pub reasoning_effort: String,
    pub reasoning_source: ProfileSource,
    pub template_kind: TemplateKind,
    pub target_branch: String,
    pub existing_pr_number: Option<i64>,
}

impl AgentContext {
    pub fn profile_payload(&self) -> ProfileResolvedPayload {
        ProfileResolvedPayload {
            model: self.model.clone(),
            model_source: self.model_source,
            reasoning_effort: self.reasoning_effort.clone(),
            reasoning_source: self.reasoning_source,
            template_kind: self.template_kind.as_str().to_string(),
            target_branch: self.target_branch.clone(),
            existing_pr_number: self.existing_pr_number,
        }
    }
}

/// Distinct values of one label family in a label set.
fn label_values<'a>(labels: impl IntoIterator<Item = &'a str>, prefix: &str) -> BTreeSet<String> {
    labels
        .into_iter()
        .filter_map(|label| {
            let label = label.trim();
            let head = label.get(..prefix.len())?;
            if !head.eq_ignore_ascii_case(prefix) {
                return None;
            }
            let value = label[prefix.len()..].strip_suffix(']')?.trim();
            (!value.is_empty()).then(|| value.to_string())
        })
        .collect()
}

fn single_value<'a>(
    labels: impl IntoIterator<Item = &'a str>,
    kind: LabelKind,
    level: ProfileSource,
) -> Result<Option<String>, AgentContextError> {
    let prefix = match kind {
        LabelKind::Model => MODEL_LABEL_PREFIX,
        LabelKind::Reasoning => REASONING_LABEL_PREFIX,
    };
    let values = match kind {
        LabelKind::Model => label_values(labels, prefix),
        LabelKind::Reasoning => label_values(labels, prefix)
            .into_iter()
            .map(|v| v.to_ascii_lowercase())
            .collect(),
    };

    let mut values = values.into_iter();
    match (values.next(), values.next()) {
        (None, _) => Ok(None),
        (Some(only), None) => Ok(Some(only)),
        (Some(first), Some(second)) => {
            let mut all = vec![first, second];
            all.extend(values);
            Err(AgentContextError::ConflictingLabels {
                kind,
                level,
                values: all,
            })
        }
    }
}

/// Resolve one label family across the precedence levels.
fn resolve_from_labels(
    payload: &RunPayload,
    kind: LabelKind,
    hint: Option<&str>,
    default: &str,
) -> Result<(String, ProfileSource), AgentContextError> {
    let pr_value = if payload.trigger_kind().is_revise() {
        single_value(
            payload.pull_request_labels().iter().map(String::as_str),
            kind,
            ProfileSource::PullRequestLabel,
        )?
    } else {
        None
    };
    let issue_value = single_value(
        payload.issue_labels().iter().map(String::as_str),
        kind,
        ProfileSource::IssueLabel,
    )?;

    if let Some(value) = pr_value {
        return Ok((value, ProfileSource::PullRequestLabel));
    }
    if let Some(value) = issue_value {
        return Ok((value, ProfileSource::IssueLabel));
    }
    if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
        return Ok((hint.to_string(), ProfileSource::LastRun));
    }
    Ok((default.to_string(), ProfileSource::Default))
}

/// Model from labels and hints. Errors on conflicting labels.
pub fn resolve_model_from_labels(
    payload: &RunPayload,
    default_model: &str,
) -> Result<(String, ProfileSource), AgentContextError> {
    resolve_from_labels(
        payload,
        LabelKind::Model,
        payload.profile_hints.last_run_model.as_deref(),
        default_model,
    )
}

fn is_supported_reasoning(value: &str) -> bool {
    SUPPORTED_REASONING_EFFORTS.contains(&value)
}

/// Reasoning effort from labels and hints. Label values must be supported;
/// an unsupported last-run hint is ignored.
pub fn resolve_reasoning_from_labels(
    payload: &RunPayload,
    default_effort: &str,
) -> Result<(String, ProfileSource), AgentContextError> {
    let hint = payload
        .profile_hints
        .last_run_reasoning_effort
        .as_deref()
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty());
    let hint = match hint {
        Some(h) if is_supported_reasoning(&h) => Some(h),
        Some(h) => {
            warn!(hint = %h, "ignoring unsupported last-run reasoning effort");
            None
        }
        None => None,
    };

    let (value, source) =
        resolve_from_labels(payload, LabelKind::Reasoning, hint.as_deref(), default_effort)?;
    if !is_supported_reasoning(&value) {
        return Err(match source {
            ProfileSource::Default => AgentContextError::InvalidDefaults(format!(
                "default reasoning effort '{value}' is not supported"
            )),
            origin => AgentContextError::UnsupportedReasoning { value, origin },
        });
    }
    Ok((value, source))
}

/// Resolve the full agent context of a run.
pub fn resolve_agent_context(
    run_id: RunId,
    payload: &RunPayload,
    defaults: &AgentDefaults,
) -> Result<AgentContext, AgentContextError> {
    let trigger_kind = payload.trigger_kind();

    let repository = payload
        .repository_full_name()
        .ok_or(AgentContextError::MissingRepository)?
        .to_string();

    if trigger_kind == TriggerKind::Reviewer && payload.pull_request_number().is_none() {
        return Err(AgentContextError::MissingPullRequest {
            trigger: trigger_kind,
        });
    }

    if defaults.model.trim().is_empty() {
        return Err(AgentContextError::InvalidDefaults(
            "default model is empty".to_string(),
        ));
    }

    let (model, model_source) = resolve_model_from_labels(payload, &defaults.model)?;
    let (reasoning_effort, reasoning_source) =
        resolve_reasoning_from_labels(payload, &defaults.reasoning_effort)?;

    Ok(AgentContext {
        trigger_kind,
        agent_key: payload.agent_key(),
        repository,
        model,
        model_source,
        reasoning_effort,
        reasoning_source,
        template_kind: trigger_kind.template_kind(),
        target_branch: target_branch(run_id, payload, &defaults.branch_prefix),
        existing_pr_number: payload.pull_request_number(),
    })
}

/// Branch the agent pushes to.
pub fn target_branch(run_id: RunId, payload: &RunPayload, branch_prefix: &str) -> String {
    if let Some(explicit) = payload
        .agent
        .target_branch
        .as_deref()
        .map(str::trim)
        .filter(|b| !b.is_empty())
    {
        return explicit.to_string();
    }
    if payload.trigger_kind().is_revise() {
        if let Some(head_ref) = payload.pull_request_head_ref() {
            return head_ref.to_string();
        }
    }
    let prefix = branch_prefix.trim_end_matches('/');
    match payload.issue_number() {
        Some(issue) => format!("{prefix}/issue-{issue}"),
        None => format!("{prefix}/run-{}", run_id.compact(12)),
    }
}
