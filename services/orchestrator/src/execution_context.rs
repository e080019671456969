//! Execution context: runtime mode and namespace identity for a run.
//!
//! Recomputed from the payload on every tick and never persisted, so two
//! orchestrators looking at the same run always agree on its namespace.

use runbay_events::RuntimeMode;
use runbay_id::{ProjectId, RunId};

use crate::payload::RunPayload;

/// Maximum length of a namespace name (DNS label).
pub const MAX_NAMESPACE_LEN: usize = 63;

/// Used when sanitization leaves nothing.
pub const FALLBACK_NAMESPACE: &str = "runbay-run";

/// Length of the id fragments embedded in derived names.
const ID_FRAGMENT_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub runtime_mode: RuntimeMode,
    /// Set for full-env runs only.
    pub namespace: Option<String>,
    pub issue_number: Option<i64>,
}

impl ExecutionContext {
    pub fn is_full_env(&self) -> bool {
        self.runtime_mode == RuntimeMode::FullEnv
    }
}

/// Resolve the execution context of a run.
///
/// An explicit runtime mode or namespace in the payload wins; otherwise the
/// trigger kind decides the mode and full-env runs get a derived namespace.
pub fn resolve_execution_context(
    run_id: RunId,
    project_id: ProjectId,
    payload: &RunPayload,
    namespace_prefix: &str,
) -> ExecutionContext {
    let runtime_mode = payload
        .explicit_runtime_mode()
        .unwrap_or_else(|| payload.trigger_kind().runtime_mode());
    let issue_number = payload.issue_number();

    let namespace = match runtime_mode {
        RuntimeMode::CodeOnly => None,
        RuntimeMode::FullEnv => Some(match payload.explicit_namespace() {
            Some(explicit) => sanitize_namespace(explicit),
            None => derive_namespace(namespace_prefix, project_id, run_id, issue_number),
        }),
    };

    ExecutionContext {
        runtime_mode,
        namespace,
        issue_number,
    }
}

/// Derive the namespace name for a full-env run.
pub fn derive_namespace(
    prefix: &str,
    project_id: ProjectId,
    run_id: RunId,
    issue_number: Option<i64>,
) -> String {
    let raw = match issue_number {
        Some(issue) => format!(
            "{prefix}-{}-i{issue}-r{}",
            project_id.compact(ID_FRAGMENT_LEN),
            run_id.compact(ID_FRAGMENT_LEN)
        ),
        None => format!("{prefix}-run-{}", run_id.compact(ID_FRAGMENT_LEN)),
    };
    sanitize_namespace(&raw)
}

/// Normalize a string into a valid namespace name.
pub fn sanitize_namespace(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_hyphen = false;

    for c in raw.chars().map(|c| c.to_ascii_lowercase()) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c);
        } else {
            pending_hyphen = true;
        }
    }

    out.truncate(MAX_NAMESPACE_LEN);
    let trimmed = out.trim_end_matches('-');

    if trimmed.is_empty() {
        FALLBACK_NAMESPACE.to_string()
    } else {
        trimmed.to_string()
    }
}
