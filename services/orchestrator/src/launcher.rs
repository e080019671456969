//! Workload launcher contract.
//!
//! The launcher owns namespaces and single-shot jobs on the cluster. The
//! orchestrator only talks to it through [`Launcher`]; concrete cluster
//! clients live outside this crate. [`InMemoryLauncher`] simulates a
//! cluster for tests and local runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runbay_events::CleanupSkipReason;
use runbay_id::{ProjectId, RunId};
use runbay_reconcile::{lease_deadline, JobState};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Label carrying the run id on every job.
pub const RUN_ID_LABEL: &str = "runbay.dev/run-id";

/// Label carrying the project id on every job.
pub const PROJECT_ID_LABEL: &str = "runbay.dev/project-id";

/// Launcher errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LauncherError {
    /// The cluster API rejected or failed the call.
    #[error("cluster api error: {0}")]
    Api(String),

    /// The request itself is invalid.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// The call did not complete within the cluster call timeout.
    #[error("cluster call timed out after {0:?}")]
    Timeout(Duration),
}

/// Location of a run's job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobRef {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Job name for a run: `run-` followed by the 32 hex chars of the run id.
pub fn job_name(run_id: RunId) -> String {
    format!("run-{}", run_id.uuid().simple())
}

/// Deterministic job reference; runs without a namespace use the default.
pub fn job_ref_for(run_id: RunId, namespace: Option<&str>, default_namespace: &str) -> JobRef {
    JobRef {
        namespace: namespace
            .filter(|ns| !ns.is_empty())
            .unwrap_or(default_namespace)
            .to_string(),
        name: job_name(run_id),
    }
}

/// Desired namespace lease.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceSpec {
    pub name: String,
    pub project_id: ProjectId,
    pub issue_number: Option<i64>,
    pub agent_key: String,
    pub run_id: RunId,
    pub ttl: Duration,
    pub now: DateTime<Utc>,
    /// Set when the sweep must leave this namespace alone.
    pub cleanup_skip: Option<CleanupSkipReason>,
}

/// Result of an ensure (create-or-extend).
#[derive(Debug, Clone, PartialEq)]
pub struct EnsuredNamespace {
    pub name: String,
    pub expires_at: DateTime<Utc>,
    /// False when an existing namespace was extended.
    pub created: bool,
}

/// A live namespace that a revise run may take over.
#[derive(Debug, Clone, PartialEq)]
pub struct ReusableNamespace {
    pub name: String,
    pub expires_at: DateTime<Utc>,
}

/// A namespace removed by the expiry sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedNamespace {
    pub name: String,
    pub project_id: ProjectId,
    pub issue_number: Option<i64>,
    pub agent_key: String,
    pub expired_at: DateTime<Utc>,
}

/// Job to launch.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub job_ref: JobRef,
    pub run_id: RunId,
    pub project_id: ProjectId,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl JobSpec {
    pub fn new(job_ref: JobRef, run_id: RunId, project_id: ProjectId, image: String) -> Self {
        let labels = BTreeMap::from([
            (RUN_ID_LABEL.to_string(), run_id.to_string()),
            (PROJECT_ID_LABEL.to_string(), project_id.to_string()),
        ]);
        Self {
            job_ref,
            run_id,
            project_id,
            image,
            env: BTreeMap::new(),
            labels,
        }
    }

    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Outcome of a launch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Created,
    /// A job with this reference already existed; treated as success.
    AlreadyExists,
}

/// Namespace and job operations on the cluster.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Where the job of `run_id` lives.
    fn job_ref(&self, run_id: RunId, namespace: Option<&str>) -> JobRef;

    /// Look a job up by its run-id label, wherever it was created.
    async fn find_run_job_ref_by_run_id(
        &self,
        run_id: RunId,
    ) -> Result<Option<JobRef>, LauncherError>;

    /// A live namespace for the same project, issue and agent, if any.
    async fn find_reusable_namespace(
        &self,
        project_id: ProjectId,
        issue_number: i64,
        agent_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ReusableNamespace>, LauncherError>;

    /// Create the namespace or extend its lease.
    async fn ensure_namespace(&self, spec: &NamespaceSpec)
        -> Result<EnsuredNamespace, LauncherError>;

    /// Delete up to `limit` expired namespaces not marked to skip cleanup.
    async fn cleanup_expired_namespaces(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<CleanedNamespace>, LauncherError>;

    async fn launch(&self, spec: &JobSpec) -> Result<LaunchOutcome, LauncherError>;

    async fn status(&self, job_ref: &JobRef) -> Result<JobState, LauncherError>;
}

// =============================================================================
// In-memory cluster
// =============================================================================

/// A namespace in the simulated cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceEntry {
    pub name: String,
    pub project_id: ProjectId,
    pub issue_number: Option<i64>,
    pub agent_key: String,
    pub last_run_id: RunId,
    pub expires_at: DateTime<Utc>,
    pub cleanup_skip: Option<CleanupSkipReason>,
}

/// A job in the simulated cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEntry {
    pub spec: JobSpec,
    pub state: JobState,
}

#[derive(Default)]
struct ClusterState {
    namespaces: HashMap<String, NamespaceEntry>,
    jobs: BTreeMap<JobRef, JobEntry>,
}

/// Simulated cluster.
pub struct InMemoryLauncher {
    default_namespace: String,
    state: Mutex<ClusterState>,
    fail_launches: AtomicBool,
    fail_namespaces: AtomicBool,
}

impl InMemoryLauncher {
    pub fn new(default_namespace: impl Into<String>) -> Self {
        Self {
            default_namespace: default_namespace.into(),
            state: Mutex::new(ClusterState::default()),
            fail_launches: AtomicBool::new(false),
            fail_namespaces: AtomicBool::new(false),
        }
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    pub fn fail_namespaces(&self, fail: bool) {
        self.fail_namespaces.store(fail, Ordering::SeqCst);
    }

    /// Force a job into a state (simulates the job progressing).
    pub async fn set_job_state(&self, job_ref: &JobRef, state: JobState) -> bool {
        match self.state.lock().await.jobs.get_mut(job_ref) {
            Some(job) => {
                job.state = state;
                true
            }
            None => false,
        }
    }

    /// Set the state of the single job of a run.
    pub async fn set_run_job_state(&self, run_id: RunId, state: JobState) -> bool {
        let mut cluster = self.state.lock().await;
        let mut found = false;
        for job in cluster.jobs.values_mut().filter(|j| j.spec.run_id == run_id) {
            job.state = state;
            found = true;
        }
        found
    }

    pub async fn delete_job(&self, job_ref: &JobRef) -> bool {
        self.state.lock().await.jobs.remove(job_ref).is_some()
    }

    /// Jobs belonging to a run.
    pub async fn jobs_for_run(&self, run_id: RunId) -> Vec<JobEntry> {
        self.state
            .lock()
            .await
            .jobs
            .values()
            .filter(|j| j.spec.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Place a job directly, bypassing `launch` (e.g. created by an older
    /// naming scheme).
    pub async fn insert_job(&self, spec: JobSpec, state: JobState) {
        self.state
            .lock()
            .await
            .jobs
            .insert(spec.job_ref.clone(), JobEntry { spec, state });
    }

    pub async fn namespace(&self, name: &str) -> Option<NamespaceEntry> {
        self.state.lock().await.namespaces.get(name).cloned()
    }

    pub async fn namespace_count(&self) -> usize {
        self.state.lock().await.namespaces.len()
    }
}

#[async_trait]
impl Launcher for InMemoryLauncher {
    fn job_ref(&self, run_id: RunId, namespace: Option<&str>) -> JobRef {
        job_ref_for(run_id, namespace, &self.default_namespace)
    }

    async fn find_run_job_ref_by_run_id(
        &self,
        run_id: RunId,
    ) -> Result<Option<JobRef>, LauncherError> {
        let run_label = run_id.to_string();
        Ok(self
            .state
            .lock()
            .await
            .jobs
            .values()
            .find(|job| job.spec.labels.get(RUN_ID_LABEL) == Some(&run_label))
            .map(|job| job.spec.job_ref.clone()))
    }

    async fn find_reusable_namespace(
        &self,
        project_id: ProjectId,
        issue_number: i64,
        agent_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ReusableNamespace>, LauncherError> {
        Ok(self
            .state
            .lock()
            .await
            .namespaces
            .values()
            .filter(|ns| {
                ns.project_id == project_id
                    && ns.issue_number == Some(issue_number)
                    && ns.agent_key == agent_key
                    && ns.expires_at > now
            })
            .max_by(|a, b| a.expires_at.cmp(&b.expires_at).then(a.name.cmp(&b.name)))
            .map(|ns| ReusableNamespace {
                name: ns.name.clone(),
                expires_at: ns.expires_at,
            }))
    }

    async fn ensure_namespace(
        &self,
        spec: &NamespaceSpec,
    ) -> Result<EnsuredNamespace, LauncherError> {
        if self.fail_namespaces.load(Ordering::SeqCst) {
            return Err(LauncherError::Api(format!(
                "namespace {} could not be ensured",
                spec.name
            )));
        }
        if spec.name.is_empty() {
            return Err(LauncherError::InvalidSpec("empty namespace name".to_string()));
        }

        let expires_at = lease_deadline(spec.now, spec.ttl);
        let mut cluster = self.state.lock().await;
        let created = !cluster.namespaces.contains_key(&spec.name);
        cluster.namespaces.insert(
            spec.name.clone(),
            NamespaceEntry {
                name: spec.name.clone(),
                project_id: spec.project_id,
                issue_number: spec.issue_number,
                agent_key: spec.agent_key.clone(),
                last_run_id: spec.run_id,
                expires_at,
                cleanup_skip: spec.cleanup_skip,
            },
        );

        Ok(EnsuredNamespace {
            name: spec.name.clone(),
            expires_at,
            created,
        })
    }

    async fn cleanup_expired_namespaces(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<CleanedNamespace>, LauncherError> {
        let mut cluster = self.state.lock().await;

        let mut expired: Vec<NamespaceEntry> = cluster
            .namespaces
            .values()
            .filter(|ns| ns.cleanup_skip.is_none() && ns.expires_at <= now)
            .cloned()
            .collect();
        expired.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then(a.name.cmp(&b.name)));
        expired.truncate(limit as usize);

        let mut cleaned = Vec::with_capacity(expired.len());
        for ns in expired {
            cluster.namespaces.remove(&ns.name);
            cluster.jobs.retain(|job_ref, _| job_ref.namespace != ns.name);
            debug!(namespace = %ns.name, "deleted expired namespace");
            cleaned.push(CleanedNamespace {
                name: ns.name,
                project_id: ns.project_id,
                issue_number: ns.issue_number,
                agent_key: ns.agent_key,
                expired_at: ns.expires_at,
            });
        }

        Ok(cleaned)
    }

    async fn launch(&self, spec: &JobSpec) -> Result<LaunchOutcome, LauncherError> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(LauncherError::Api(format!(
                "job {} could not be created",
                spec.job_ref
            )));
        }

        let mut cluster = self.state.lock().await;
        if spec.job_ref.namespace != self.default_namespace
            && !cluster.namespaces.contains_key(&spec.job_ref.namespace)
        {
            return Err(LauncherError::Api(format!(
                "namespace {} not found",
                spec.job_ref.namespace
            )));
        }
        if cluster.jobs.contains_key(&spec.job_ref) {
            return Ok(LaunchOutcome::AlreadyExists);
        }
        cluster.jobs.insert(
            spec.job_ref.clone(),
            JobEntry {
                spec: spec.clone(),
                state: JobState::Pending,
            },
        );
        Ok(LaunchOutcome::Created)
    }

    async fn status(&self, job_ref: &JobRef) -> Result<JobState, LauncherError> {
        Ok(self
            .state
            .lock()
            .await
            .jobs
            .get(job_ref)
            .map(|job| job.state)
            .unwrap_or(JobState::NotFound))
    }
}
