//! Typed view over the opaque `run_payload` JSON.
//!
//! Ingestion writes whatever it knows about the trigger into the payload.
//! Every section is optional and parsed independently: a malformed section
//! is dropped with a warning instead of failing the whole run, and unknown
//! trigger kinds land on [`TriggerKind::Unknown`].

use runbay_events::RuntimeMode;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

/// Trigger kinds the orchestrator has policy for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Dev,
    DevRevise,
    Plan,
    PlanRevise,
    DocAudit,
    Qa,
    Ops,
    AiRepair,
    SelfImprove,
    Reviewer,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Which part of the repository a run may modify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteScope {
    Repository,
    Docs,
    CommentsOnly,
}

impl WriteScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteScope::Repository => "repository",
            WriteScope::Docs => "docs",
            WriteScope::CommentsOnly => "comments_only",
        }
    }
}

/// Prompt template family handed to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    Work,
    Revise,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKind::Work => "work",
            TemplateKind::Revise => "revise",
        }
    }
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 11] = [
        TriggerKind::Dev,
        TriggerKind::DevRevise,
        TriggerKind::Plan,
        TriggerKind::PlanRevise,
        TriggerKind::DocAudit,
        TriggerKind::Qa,
        TriggerKind::Ops,
        TriggerKind::AiRepair,
        TriggerKind::SelfImprove,
        TriggerKind::Reviewer,
        TriggerKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Dev => "dev",
            TriggerKind::DevRevise => "dev_revise",
            TriggerKind::Plan => "plan",
            TriggerKind::PlanRevise => "plan_revise",
            TriggerKind::DocAudit => "doc_audit",
            TriggerKind::Qa => "qa",
            TriggerKind::Ops => "ops",
            TriggerKind::AiRepair => "ai_repair",
            TriggerKind::SelfImprove => "self_improve",
            TriggerKind::Reviewer => "reviewer",
            TriggerKind::Unknown => "unknown",
        }
    }

    /// Runtime mode used when the payload carries no explicit override.
    pub fn runtime_mode(&self) -> RuntimeMode {
        match self {
            TriggerKind::Dev
            | TriggerKind::DevRevise
            | TriggerKind::Qa
            | TriggerKind::Ops
            | TriggerKind::AiRepair => RuntimeMode::FullEnv,
            TriggerKind::Plan
            | TriggerKind::PlanRevise
            | TriggerKind::DocAudit
            | TriggerKind::SelfImprove
            | TriggerKind::Reviewer
            | TriggerKind::Unknown => RuntimeMode::CodeOnly,
        }
    }

    /// Runs restricted to markdown output (plans, docs, review comments).
    pub fn is_markdown_only(&self) -> bool {
        match self {
            TriggerKind::Plan
            | TriggerKind::PlanRevise
            | TriggerKind::DocAudit
            | TriggerKind::Reviewer => true,
            TriggerKind::Dev
            | TriggerKind::DevRevise
            | TriggerKind::Qa
            | TriggerKind::Ops
            | TriggerKind::AiRepair
            | TriggerKind::SelfImprove
            | TriggerKind::Unknown => false,
        }
    }

    pub fn write_scope(&self) -> WriteScope {
        match self {
            TriggerKind::Dev
            | TriggerKind::DevRevise
            | TriggerKind::Qa
            | TriggerKind::Ops
            | TriggerKind::AiRepair
            | TriggerKind::SelfImprove => WriteScope::Repository,
            TriggerKind::Plan | TriggerKind::PlanRevise | TriggerKind::DocAudit => WriteScope::Docs,
            TriggerKind::Reviewer | TriggerKind::Unknown => WriteScope::CommentsOnly,
        }
    }

    /// Revise runs respond to review feedback on an existing pull request.
    pub fn is_revise(&self) -> bool {
        matches!(self, TriggerKind::DevRevise | TriggerKind::PlanRevise)
    }

    pub fn template_kind(&self) -> TemplateKind {
        if self.is_revise() {
            TemplateKind::Revise
        } else {
            TemplateKind::Work
        }
    }

    /// Agent role used for namespace keys and TTL overrides.
    pub fn default_agent_key(&self) -> &'static str {
        match self {
            TriggerKind::Dev | TriggerKind::DevRevise | TriggerKind::AiRepair => "dev",
            TriggerKind::Plan | TriggerKind::PlanRevise => "planner",
            TriggerKind::DocAudit => "docs",
            TriggerKind::Qa => "qa",
            TriggerKind::Ops => "ops",
            TriggerKind::SelfImprove => "self-improve",
            TriggerKind::Reviewer => "reviewer",
            TriggerKind::Unknown => "agent",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payload Sections
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSection {
    pub kind: TriggerKind,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositorySection {
    pub full_name: Option<String>,
    pub services_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssueSection {
    #[serde(deserialize_with = "lenient_i64")]
    pub number: Option<i64>,
    #[serde(deserialize_with = "label_names")]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullRequestSection {
    #[serde(deserialize_with = "lenient_i64")]
    pub number: Option<i64>,
    pub head_ref: Option<String>,
    #[serde(deserialize_with = "label_names")]
    pub labels: Vec<String>,
}

/// Explicit runtime overrides (deploy-only and repair runs set these).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub mode: Option<String>,
    pub namespace: Option<String>,
    pub target_env: Option<String>,
    pub build_ref: Option<String>,
    pub deploy_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub key: Option<String>,
    pub target_branch: Option<String>,
}

/// Settings the previous run on the same issue ended up using.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileHints {
    pub last_run_model: Option<String>,
    pub last_run_reasoning_effort: Option<String>,
}

/// Parsed run payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPayload {
    pub project_id: Option<String>,
    pub trigger: TriggerSection,
    pub repository: RepositorySection,
    pub issue: Option<IssueSection>,
    pub pull_request: Option<PullRequestSection>,
    pub runtime: RuntimeSection,
    pub agent: AgentSection,
    pub profile_hints: ProfileHints,
}

impl RunPayload {
    /// Parse a payload, dropping sections that do not match their shape.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let Some(object) = value.as_object() else {
            if !value.is_null() {
                warn!("run payload is not a JSON object, using defaults");
            }
            return Self::default();
        };

        Self {
            project_id: section(object, "project_id"),
            trigger: section(object, "trigger").unwrap_or_default(),
            repository: section(object, "repository").unwrap_or_default(),
            issue: section(object, "issue"),
            pull_request: section(object, "pull_request"),
            runtime: section(object, "runtime").unwrap_or_default(),
            agent: section(object, "agent").unwrap_or_default(),
            profile_hints: section(object, "profile_hints").unwrap_or_default(),
        }
    }

    pub fn trigger_kind(&self) -> TriggerKind {
        self.trigger.kind
    }

    pub fn repository_full_name(&self) -> Option<&str> {
        non_blank(self.repository.full_name.as_deref())
    }

    pub fn issue_number(&self) -> Option<i64> {
        self.issue.as_ref().and_then(|i| i.number).filter(|n| *n > 0)
    }

    pub fn pull_request_number(&self) -> Option<i64> {
        self.pull_request
            .as_ref()
            .and_then(|pr| pr.number)
            .filter(|n| *n > 0)
    }

    pub fn pull_request_head_ref(&self) -> Option<&str> {
        non_blank(self.pull_request.as_ref().and_then(|pr| pr.head_ref.as_deref()))
    }

    pub fn issue_labels(&self) -> &[String] {
        self.issue.as_ref().map(|i| i.labels.as_slice()).unwrap_or(&[])
    }

    pub fn pull_request_labels(&self) -> &[String] {
        self.pull_request
            .as_ref()
            .map(|pr| pr.labels.as_slice())
            .unwrap_or(&[])
    }

    /// All labels across the issue and pull request.
    pub fn all_labels(&self) -> impl Iterator<Item = &str> {
        self.issue_labels()
            .iter()
            .chain(self.pull_request_labels())
            .map(String::as_str)
    }

    pub fn explicit_namespace(&self) -> Option<&str> {
        non_blank(self.runtime.namespace.as_deref())
    }

    /// The explicit runtime mode override, if present and recognized.
    pub fn explicit_runtime_mode(&self) -> Option<RuntimeMode> {
        let raw = non_blank(self.runtime.mode.as_deref())?;
        let parsed = RuntimeMode::parse(raw);
        if parsed.is_none() {
            warn!(mode = raw, "ignoring unrecognized runtime mode override");
        }
        parsed
    }

    pub fn agent_key(&self) -> String {
        non_blank(self.agent.key.as_deref())
            .map(|k| k.to_ascii_lowercase())
            .unwrap_or_else(|| self.trigger_kind().default_agent_key().to_string())
    }

    pub fn is_deploy_only(&self) -> bool {
        self.runtime.deploy_only
    }
}

fn section<T>(object: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<T>
where
    T: for<'de> Deserialize<'de>,
{
    let value = object.get(key)?;
    if value.is_null() {
        return None;
    }
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(section = key, error = %e, "dropping malformed run payload section");
            None
        }
    }
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Accept `42`, `"42"` or null.
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(i64),
        String(String),
    }

    Ok(
        match Option::<NumberOrString>::deserialize(deserializer)? {
            Some(NumberOrString::Number(n)) => Some(n),
            Some(NumberOrString::String(s)) => s.trim().parse().ok(),
            None => None,
        },
    )
}

/// Accept label lists as plain strings or GitHub-style `{ "name": ... }` objects.
fn label_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Label {
        Name(String),
        Object { name: String },
    }

    let labels = Option::<Vec<Label>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(labels
        .into_iter()
        .map(|label| match label {
            Label::Name(name) | Label::Object { name } => name.trim().to_string(),
        })
        .filter(|name| !name.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn test_full_payload() {
        let payload = RunPayload::from_value(&json!({
            "trigger": { "kind": "dev_revise", "label": "run:dev:revise" },
            "repository": { "full_name": "acme/widgets", "services_path": "deploy/services.yaml" },
            "issue": { "number": 42, "labels": ["[ai-model-gpt-5.2-codex]"] },
            "pull_request": { "number": "7", "head_ref": "agent/issue-42", "labels": [{ "name": "[ai-reasoning-high]" }] },
            "runtime": { "deploy_only": false },
            "agent": { "key": "DEV" }
        }));

        assert_eq!(payload.trigger_kind(), TriggerKind::DevRevise);
        assert_eq!(payload.repository_full_name(), Some("acme/widgets"));
        assert_eq!(payload.issue_number(), Some(42));
        assert_eq!(payload.pull_request_number(), Some(7));
        assert_eq!(payload.pull_request_head_ref(), Some("agent/issue-42"));
        assert_eq!(payload.pull_request_labels(), ["[ai-reasoning-high]".to_string()]);
        assert_eq!(payload.agent_key(), "dev");
        assert_eq!(payload.all_labels().count(), 2);
    }

    #[test]
    fn test_unknown_trigger_kind_falls_back() {
        let payload = RunPayload::from_value(&json!({ "trigger": { "kind": "galaxy_brain" } }));
        assert_eq!(payload.trigger_kind(), TriggerKind::Unknown);
        assert_eq!(payload.agent_key(), "agent");
    }

    #[test]
    fn test_malformed_section_is_dropped() {
        let payload = RunPayload::from_value(&json!({
            "trigger": { "kind": "dev" },
            "issue": "not-an-object",
            "repository": { "full_name": "acme/widgets" }
        }));
        assert_eq!(payload.trigger_kind(), TriggerKind::Dev);
        assert!(payload.issue.is_none());
        assert_eq!(payload.repository_full_name(), Some("acme/widgets"));
    }

    #[rstest]
    #[case(json!(null))]
    #[case(json!([1, 2, 3]))]
    #[case(json!("string"))]
    #[case(json!({}))]
    fn test_non_object_payloads_default(#[case] value: serde_json::Value) {
        assert_eq!(RunPayload::from_value(&value), RunPayload::default());
    }

    #[test]
    fn test_zero_issue_number_is_absent() {
        let payload = RunPayload::from_value(&json!({ "issue": { "number": 0 } }));
        assert_eq!(payload.issue_number(), None);
    }

    #[test]
    fn test_explicit_runtime_override() {
        let payload = RunPayload::from_value(&json!({
            "runtime": { "mode": "full_env", "namespace": " repair-ns ", "deploy_only": true }
        }));
        assert_eq!(payload.explicit_runtime_mode(), Some(RuntimeMode::FullEnv));
        assert_eq!(payload.explicit_namespace(), Some("repair-ns"));
        assert!(payload.is_deploy_only());

        let bogus = RunPayload::from_value(&json!({ "runtime": { "mode": "sandbox" } }));
        assert_eq!(bogus.explicit_runtime_mode(), None);
    }

    #[rstest]
    #[case(TriggerKind::Dev, RuntimeMode::FullEnv, false, WriteScope::Repository, false)]
    #[case(TriggerKind::DevRevise, RuntimeMode::FullEnv, false, WriteScope::Repository, true)]
    #[case(TriggerKind::Plan, RuntimeMode::CodeOnly, true, WriteScope::Docs, false)]
    #[case(TriggerKind::PlanRevise, RuntimeMode::CodeOnly, true, WriteScope::Docs, true)]
    #[case(TriggerKind::DocAudit, RuntimeMode::CodeOnly, true, WriteScope::Docs, false)]
    #[case(TriggerKind::Qa, RuntimeMode::FullEnv, false, WriteScope::Repository, false)]
    #[case(TriggerKind::Ops, RuntimeMode::FullEnv, false, WriteScope::Repository, false)]
    #[case(TriggerKind::AiRepair, RuntimeMode::FullEnv, false, WriteScope::Repository, false)]
    #[case(TriggerKind::SelfImprove, RuntimeMode::CodeOnly, false, WriteScope::Repository, false)]
    #[case(TriggerKind::Reviewer, RuntimeMode::CodeOnly, true, WriteScope::CommentsOnly, false)]
    #[case(TriggerKind::Unknown, RuntimeMode::CodeOnly, false, WriteScope::CommentsOnly, false)]
    fn test_trigger_policy_tables(
        #[case] kind: TriggerKind,
        #[case] mode: RuntimeMode,
        #[case] markdown_only: bool,
        #[case] scope: WriteScope,
        #[case] revise: bool,
    ) {
        assert_eq!(kind.runtime_mode(), mode);
        assert_eq!(kind.is_markdown_only(), markdown_only);
        assert_eq!(kind.write_scope(), scope);
        assert_eq!(kind.is_revise(), revise);
        let expected_template = if revise {
            TemplateKind::Revise
        } else {
            TemplateKind::Work
        };
        assert_eq!(kind.template_kind(), expected_template);
    }

    #[test]
    fn test_trigger_kind_string_roundtrip() {
        for kind in TriggerKind::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, json!(kind.as_str()));
            let parsed: TriggerKind = serde_json::from_value(json).unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
