//! Environment preparer contract and single-shot polling.
//!
//! The preparer builds and deploys the per-run environment stack
//! asynchronously. The orchestrator never waits for it: each tick makes one
//! bounded call and gets back a [`PreparationPoll`]. An environment still
//! being built is [`PreparationPoll::NotReady`]; transient transport failures
//! are [`PreparationPoll::Unavailable`]. Both are retried next tick.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use runbay_events::RuntimeMode;
use runbay_id::{ProjectId, RunId};
use runbay_reconcile::preparation_call_timeout;
use tokio::sync::Mutex;
use tonic::{Code, Status};
use tracing::debug;

/// Message fragments that mark an `Internal`/`Unknown` error as transient.
const TRANSIENT_MESSAGE_FRAGMENTS: [&str; 5] = [
    "connection refused",
    "context deadline exceeded",
    "transport is closing",
    "connection reset",
    "broken pipe",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRequest {
    pub run_id: RunId,
    pub project_id: ProjectId,
    pub runtime_mode: RuntimeMode,
    pub namespace: Option<String>,
    pub target_env: Option<String>,
    pub slot_no: i32,
    pub repository: Option<String>,
    pub services_path: Option<String>,
    pub build_ref: Option<String>,
    pub deploy_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrepareResponse {
    /// Namespace the environment was deployed into. Empty while in progress.
    pub namespace: String,
    pub target_env: Option<String>,
}

/// Asynchronous environment preparation service.
#[async_trait]
pub trait EnvironmentPreparer: Send + Sync {
    async fn prepare_run_environment(
        &self,
        request: &PrepareRequest,
    ) -> Result<PrepareResponse, Status>;
}

/// How a preparer error is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreparationErrorClass {
    Retryable,
    Canceled,
    Terminal,
}

/// Classify a preparer error by status code, falling back to message
/// matching only for `Internal` and `Unknown`.
pub fn classify_preparation_error(status: &Status) -> PreparationErrorClass {
    let message = status.message().to_ascii_lowercase();

    if status.code() == Code::Cancelled
        || message.contains("canceled")
        || message.contains("cancelled")
    {
        return PreparationErrorClass::Canceled;
    }

    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::Aborted | Code::ResourceExhausted => {
            PreparationErrorClass::Retryable
        }
        Code::Internal | Code::Unknown
            if TRANSIENT_MESSAGE_FRAGMENTS
                .iter()
                .any(|fragment| message.contains(fragment)) =>
        {
            PreparationErrorClass::Retryable
        }
        _ => PreparationErrorClass::Terminal,
    }
}

/// Outcome of one preparation poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparationPoll {
    Ready(PrepareResponse),
    /// The preparer answered but has no namespace yet.
    NotReady { reason: String },
    /// The preparer could not be reached or timed out.
    Unavailable { reason: String },
    Canceled { message: String },
    Failed { message: String },
}

/// Make one bounded preparation call.
pub async fn prepare_runtime_environment_poll(
    preparer: &dyn EnvironmentPreparer,
    request: &PrepareRequest,
    retry_interval: Duration,
) -> PreparationPoll {
    let timeout = preparation_call_timeout(retry_interval);

    let result = match tokio::time::timeout(timeout, preparer.prepare_run_environment(request)).await
    {
        Ok(result) => result,
        Err(_) => {
            debug!(run_id = %request.run_id, ?timeout, "preparation poll timed out");
            return PreparationPoll::Unavailable {
                reason: format!("preparation call timed out after {timeout:?}"),
            };
        }
    };

    match result {
        Ok(response) if response.namespace.trim().is_empty() => PreparationPoll::NotReady {
            reason: "environment namespace not resolved yet".to_string(),
        },
        Ok(response) => PreparationPoll::Ready(response),
        Err(status) => match classify_preparation_error(&status) {
            PreparationErrorClass::Retryable => PreparationPoll::Unavailable {
                reason: format!("{:?}: {}", status.code(), status.message()),
            },
            PreparationErrorClass::Canceled => PreparationPoll::Canceled {
                message: status.message().to_string(),
            },
            PreparationErrorClass::Terminal => PreparationPoll::Failed {
                message: format!("{:?}: {}", status.code(), status.message()),
            },
        },
    }
}

/// Preparer that replays scripted responses, then reports ready with the
/// requested namespace. For tests and local runs.
#[derive(Default)]
pub struct StaticEnvironmentPreparer {
    script: Mutex<VecDeque<Result<PrepareResponse, Status>>>,
    calls: AtomicUsize,
}

impl StaticEnvironmentPreparer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next call.
    pub async fn push(&self, response: Result<PrepareResponse, Status>) {
        self.script.lock().await.push_back(response);
    }

    /// Queue `count` in-progress responses (empty namespace).
    pub async fn push_not_ready(&self, count: usize) {
        let mut script = self.script.lock().await;
        for _ in 0..count {
            script.push_back(Ok(PrepareResponse::default()));
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnvironmentPreparer for StaticEnvironmentPreparer {
    async fn prepare_run_environment(
        &self,
        request: &PrepareRequest,
    ) -> Result<PrepareResponse, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.script.lock().await.pop_front() {
            return scripted;
        }
        Ok(PrepareResponse {
            namespace: request.namespace.clone().unwrap_or_default(),
            target_env: request.target_env.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn request() -> PrepareRequest {
        PrepareRequest {
            run_id: RunId::new(),
            project_id: ProjectId::new(),
            runtime_mode: RuntimeMode::FullEnv,
            namespace: Some("runbay-ns".to_string()),
            target_env: None,
            slot_no: 1,
            repository: Some("acme/widgets".to_string()),
            services_path: None,
            build_ref: None,
            deploy_only: false,
        }
    }

    #[rstest]
    #[case(Status::unavailable("down"), PreparationErrorClass::Retryable)]
    #[case(Status::deadline_exceeded("slow"), PreparationErrorClass::Retryable)]
    #[case(Status::aborted("retry"), PreparationErrorClass::Retryable)]
    #[case(Status::resource_exhausted("quota"), PreparationErrorClass::Retryable)]
    #[case(Status::internal("dial tcp: connection refused"), PreparationErrorClass::Retryable)]
    #[case(Status::unknown("write: Broken Pipe"), PreparationErrorClass::Retryable)]
    #[case(Status::internal("nil pointer"), PreparationErrorClass::Terminal)]
    #[case(Status::invalid_argument("connection refused"), PreparationErrorClass::Terminal)]
    #[case(Status::failed_precondition("bad services file"), PreparationErrorClass::Terminal)]
    #[case(Status::cancelled("stop"), PreparationErrorClass::Canceled)]
    #[case(Status::internal("run was canceled by user"), PreparationErrorClass::Canceled)]
    #[case(Status::failed_precondition("deploy cancelled"), PreparationErrorClass::Canceled)]
    fn test_classify(#[case] status: Status, #[case] expected: PreparationErrorClass) {
        assert_eq!(classify_preparation_error(&status), expected);
    }

    #[tokio::test]
    async fn test_poll_ready() {
        let preparer = StaticEnvironmentPreparer::new();
        let poll =
            prepare_runtime_environment_poll(&preparer, &request(), Duration::from_secs(1)).await;
        assert_eq!(
            poll,
            PreparationPoll::Ready(PrepareResponse {
                namespace: "runbay-ns".to_string(),
                target_env: None,
            })
        );
        assert_eq!(preparer.calls(), 1);
    }

    #[tokio::test]
    async fn test_poll_empty_namespace_is_not_ready() {
        let preparer = StaticEnvironmentPreparer::new();
        preparer.push_not_ready(1).await;
        let poll =
            prepare_runtime_environment_poll(&preparer, &request(), Duration::from_secs(1)).await;
        assert!(matches!(poll, PreparationPoll::NotReady { .. }));
    }

    #[tokio::test]
    async fn test_poll_classifies_errors() {
        let preparer = StaticEnvironmentPreparer::new();
        preparer.push(Err(Status::unavailable("down"))).await;
        preparer.push(Err(Status::cancelled("stop"))).await;
        preparer.push(Err(Status::permission_denied("nope"))).await;
        let interval = Duration::from_secs(1);

        assert!(matches!(
            prepare_runtime_environment_poll(&preparer, &request(), interval).await,
            PreparationPoll::Unavailable { .. }
        ));
        assert!(matches!(
            prepare_runtime_environment_poll(&preparer, &request(), interval).await,
            PreparationPoll::Canceled { .. }
        ));
        assert!(matches!(
            prepare_runtime_environment_poll(&preparer, &request(), interval).await,
            PreparationPoll::Failed { .. }
        ));
    }
}
