//! Shared harness: an orchestrator wired to in-memory collaborators.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use runbay_id::{ProjectId, RunId};
use runbay_orchestrator::{
    config::OrchestratorConfig,
    credentials::{LoggingStatusNotifier, StaticAccessKeyIssuer, StaticMcpTokenIssuer},
    db::{MemoryFlowEventStore, MemoryQueueStore, NewRun},
    image::ImageChecker,
    launcher::InMemoryLauncher,
    preparer::StaticEnvironmentPreparer,
    Collaborators, Orchestrator,
};

pub const DEFAULT_NAMESPACE: &str = "runbay-jobs";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,runbay_orchestrator=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn at(offset_secs: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::seconds(offset_secs)
}

pub fn test_config(worker_id: &str) -> OrchestratorConfig {
    OrchestratorConfig {
        worker_id: worker_id.to_string(),
        default_namespace: DEFAULT_NAMESPACE.to_string(),
        prepare_retry_interval: Duration::from_millis(100),
        prepare_retry_timeout: Duration::from_secs(60),
        not_found_grace_buffer: Duration::from_secs(15),
        run_lease_ttl: Duration::from_secs(600),
        cluster_call_timeout: Duration::from_secs(2),
        ..OrchestratorConfig::default()
    }
}

/// Shared state of one simulated deployment.
#[derive(Clone)]
pub struct World {
    pub queue: Arc<MemoryQueueStore>,
    pub events: Arc<MemoryFlowEventStore>,
    pub launcher: Arc<InMemoryLauncher>,
    pub preparer: Arc<StaticEnvironmentPreparer>,
    pub mcp_tokens: Arc<StaticMcpTokenIssuer>,
    pub access_keys: Arc<StaticAccessKeyIssuer>,
    pub notifier: Arc<LoggingStatusNotifier>,
}

impl World {
    pub fn new() -> Self {
        init_tracing();
        Self {
            queue: Arc::new(MemoryQueueStore::new()),
            events: Arc::new(MemoryFlowEventStore::new()),
            launcher: Arc::new(InMemoryLauncher::new(DEFAULT_NAMESPACE)),
            preparer: Arc::new(StaticEnvironmentPreparer::new()),
            mcp_tokens: Arc::new(StaticMcpTokenIssuer::new()),
            access_keys: Arc::new(StaticAccessKeyIssuer::new()),
            notifier: Arc::new(LoggingStatusNotifier::new()),
        }
    }

    pub fn orchestrator(&self, config: OrchestratorConfig) -> Orchestrator {
        self.orchestrator_with_images(config, None)
    }

    pub fn orchestrator_with_images(
        &self,
        config: OrchestratorConfig,
        image_checker: Option<Arc<dyn ImageChecker>>,
    ) -> Orchestrator {
        let deps = Collaborators {
            queue: self.queue.clone(),
            events: self.events.clone(),
            launcher: self.launcher.clone(),
            preparer: self.preparer.clone(),
            image_checker,
            mcp_tokens: self.mcp_tokens.clone(),
            access_keys: self.access_keys.clone(),
            notifier: self.notifier.clone(),
        };
        Orchestrator::new(Arc::new(config), deps).expect("valid orchestrator config")
    }

    pub async fn enqueue(&self, project_id: ProjectId, payload: serde_json::Value) -> RunId {
        let correlation_id = format!("corr-{}", RunId::new().compact(8));
        self.queue
            .enqueue(NewRun::new(correlation_id, payload).with_project(project_id))
            .await
    }

    pub async fn status(&self, run_id: RunId) -> Option<runbay_events::RunStatus> {
        self.queue.run(run_id).await.map(|run| run.status)
    }

    pub async fn event_types(&self, run_id: RunId) -> Vec<String> {
        self.events.event_types_for_run(run_id).await
    }
}

pub fn code_only_payload() -> serde_json::Value {
    serde_json::json!({
        "trigger": {"kind": "plan"},
        "repository": {"full_name": "acme/widgets"},
        "issue": {"number": 42, "labels": []}
    })
}

pub fn full_env_payload(issue: i64) -> serde_json::Value {
    serde_json::json!({
        "trigger": {"kind": "dev"},
        "repository": {"full_name": "acme/widgets"},
        "issue": {"number": issue, "labels": []}
    })
}
