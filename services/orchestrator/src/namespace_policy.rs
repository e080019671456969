//! Namespace lease policy: TTLs, reuse for revise runs, cleanup skips.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use runbay_events::CleanupSkipReason;
use runbay_id::{ProjectId, RunId};
use tracing::debug;

use crate::launcher::{Launcher, LauncherError, NamespaceSpec};
use crate::payload::RunPayload;

/// Policy inputs, built once from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceLeasePolicy {
    pub default_ttl: Duration,
    /// Per agent role TTL overrides, keyed by lower-case agent key.
    pub ttl_by_role: HashMap<String, Duration>,
    pub cleanup_disabled: bool,
    /// Label that keeps a run's namespace around for debugging.
    pub debug_label: Option<String>,
}

/// What the lease step needs to know about a run.
#[derive(Debug, Clone)]
pub struct LeaseRequest<'a> {
    pub run_id: RunId,
    pub project_id: ProjectId,
    pub issue_number: Option<i64>,
    pub agent_key: &'a str,
    pub is_revise: bool,
    /// True when the namespace came from an explicit payload override.
    pub explicit_namespace: bool,
    /// Derived or explicit namespace name.
    pub namespace: &'a str,
    pub cleanup_skip: Option<CleanupSkipReason>,
    pub now: DateTime<Utc>,
}

/// A namespace lease held by a run.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceLease {
    pub namespace: String,
    pub issue_number: Option<i64>,
    pub agent_key: String,
    pub ttl: Duration,
    pub expires_at: DateTime<Utc>,
    /// True when an existing namespace from an earlier run was taken over.
    pub reused: bool,
    pub cleanup_skip: Option<CleanupSkipReason>,
}

impl NamespaceLeasePolicy {
    pub fn ttl_for(&self, agent_key: &str) -> Duration {
        self.ttl_by_role
            .get(&agent_key.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_ttl)
    }

    /// Why the sweep must leave this run's namespace alone, if it must.
    pub fn cleanup_skip_reason(&self, payload: &RunPayload) -> Option<CleanupSkipReason> {
        if self.cleanup_disabled {
            return Some(CleanupSkipReason::CleanupDisabled);
        }
        let debug_label = self.debug_label.as_deref()?;
        payload
            .all_labels()
            .any(|label| label.eq_ignore_ascii_case(debug_label))
            .then_some(CleanupSkipReason::DebugLabel)
    }

    /// Acquire the namespace lease for a full-env run.
    ///
    /// Revise runs without an explicit namespace take over a live namespace
    /// from an earlier run on the same issue and extend it; everything else
    /// ensures the requested name.
    pub async fn acquire(
        &self,
        launcher: &dyn Launcher,
        request: &LeaseRequest<'_>,
    ) -> Result<NamespaceLease, LauncherError> {
        let ttl = self.ttl_for(request.agent_key);

        let reusable = match (request.is_revise, request.explicit_namespace, request.issue_number) {
            (true, false, Some(issue)) => {
                launcher
                    .find_reusable_namespace(request.project_id, issue, request.agent_key, request.now)
                    .await?
            }
            _ => None,
        };

        let (name, reused) = match reusable {
            Some(existing) => {
                debug!(
                    namespace = %existing.name,
                    expires_at = %existing.expires_at,
                    "reusing namespace from earlier run"
                );
                (existing.name, true)
            }
            None => (request.namespace.to_string(), false),
        };

        let ensured = launcher
            .ensure_namespace(&NamespaceSpec {
                name,
                project_id: request.project_id,
                issue_number: request.issue_number,
                agent_key: request.agent_key.to_string(),
                run_id: request.run_id,
                ttl,
                now: request.now,
                cleanup_skip: request.cleanup_skip,
            })
            .await?;

        Ok(NamespaceLease {
            namespace: ensured.name,
            issue_number: request.issue_number,
            agent_key: request.agent_key.to_string(),
            ttl,
            expires_at: ensured.expires_at,
            reused,
            cleanup_skip: request.cleanup_skip,
        })
    }
}

/// Parse `role=secs,role=secs` into per-role TTLs.
pub fn parse_ttl_by_role(raw: &str) -> Result<HashMap<String, Duration>, String> {
    let mut ttls = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (role, secs) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected role=secs, got '{entry}'"))?;
        let role = role.trim().to_ascii_lowercase();
        if role.is_empty() {
            return Err(format!("empty role in '{entry}'"));
        }
        let secs: u64 = secs
            .trim()
            .parse()
            .map_err(|e| format!("invalid seconds in '{entry}': {e}"))?;
        ttls.insert(role, Duration::from_secs(secs));
    }
    Ok(ttls)
}
