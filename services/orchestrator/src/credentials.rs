//! Per-run credentials and status notifications.
//!
//! An MCP token is mandatory: without it the agent cannot reach its tools,
//! so an issue failure is terminal for the run. The run access key and the
//! status notifier are best effort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runbay_events::RunStatus;
use runbay_id::{ProjectId, RunId};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Credential and notification errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("issuer rejected request: {0}")]
    Rejected(String),

    #[error("issuer unavailable: {0}")]
    Unavailable(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

/// A short-lived token for the agent's MCP tool server.
#[derive(Clone, PartialEq, Eq)]
pub struct McpToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for McpToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Scoped access key for the run's own API calls.
#[derive(Clone, PartialEq, Eq)]
pub struct RunAccessKey(pub String);

impl std::fmt::Debug for RunAccessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RunAccessKey(<redacted>)")
    }
}

/// Status change pushed to interested parties (issue comments, chat).
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatusNotification {
    pub run_id: Option<RunId>,
    pub project_id: ProjectId,
    pub correlation_id: String,
    /// `None` for namespace-only notifications.
    pub status: Option<RunStatus>,
    pub message: String,
}

#[async_trait]
pub trait McpTokenIssuer: Send + Sync {
    async fn issue(
        &self,
        run_id: RunId,
        project_id: ProjectId,
        ttl: Duration,
    ) -> Result<McpToken, CredentialError>;
}

#[async_trait]
pub trait RunAccessKeyIssuer: Send + Sync {
    async fn issue(&self, run_id: RunId, project_id: ProjectId)
        -> Result<RunAccessKey, CredentialError>;
}

#[async_trait]
pub trait RunStatusNotifier: Send + Sync {
    async fn notify(&self, notification: &RunStatusNotification) -> Result<(), CredentialError>;
}

/// Issues deterministic tokens derived from the run id.
#[derive(Debug, Default)]
pub struct StaticMcpTokenIssuer {
    failing: AtomicBool,
}

impl StaticMcpTokenIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl McpTokenIssuer for StaticMcpTokenIssuer {
    async fn issue(
        &self,
        run_id: RunId,
        _project_id: ProjectId,
        ttl: Duration,
    ) -> Result<McpToken, CredentialError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CredentialError::Unavailable("token service down".to_string()));
        }
        Ok(McpToken {
            token: format!("mcp-{}", run_id.compact(32)),
            expires_at: runbay_reconcile::lease_deadline(Utc::now(), ttl),
        })
    }
}

/// Issues deterministic access keys derived from the run id.
#[derive(Debug, Default)]
pub struct StaticAccessKeyIssuer {
    failing: AtomicBool,
}

impl StaticAccessKeyIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RunAccessKeyIssuer for StaticAccessKeyIssuer {
    async fn issue(
        &self,
        run_id: RunId,
        _project_id: ProjectId,
    ) -> Result<RunAccessKey, CredentialError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CredentialError::Rejected("access keys disabled".to_string()));
        }
        Ok(RunAccessKey(format!("rak-{}", run_id.compact(32))))
    }
}

/// Notifier that logs and records notifications.
#[derive(Debug, Default)]
pub struct LoggingStatusNotifier {
    sent: Mutex<Vec<RunStatusNotification>>,
    failing: AtomicBool,
}

impl LoggingStatusNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<RunStatusNotification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl RunStatusNotifier for LoggingStatusNotifier {
    async fn notify(&self, notification: &RunStatusNotification) -> Result<(), CredentialError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CredentialError::Unavailable("notifier down".to_string()));
        }
        info!(
            run_id = ?notification.run_id,
            project_id = %notification.project_id,
            status = ?notification.status,
            message = %notification.message,
            "run status notification"
        );
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_issuers() {
        let run_id = RunId::new();
        let project_id = ProjectId::new();

        let issuer = StaticMcpTokenIssuer::new();
        let token = issuer
            .issue(run_id, project_id, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(token.token.starts_with("mcp-"));
        assert!(!format!("{token:?}").contains(&token.token));

        issuer.fail(true);
        assert!(issuer
            .issue(run_id, project_id, Duration::from_secs(60))
            .await
            .is_err());

        let keys = StaticAccessKeyIssuer::new();
        let key = keys.issue(run_id, project_id).await.unwrap();
        assert_eq!(format!("{key:?}"), "RunAccessKey(<redacted>)");
    }

    #[tokio::test]
    async fn test_logging_notifier_records() {
        let notifier = LoggingStatusNotifier::new();
        let notification = RunStatusNotification {
            run_id: Some(RunId::new()),
            project_id: ProjectId::new(),
            correlation_id: "corr".to_string(),
            status: Some(RunStatus::Succeeded),
            message: "done".to_string(),
        };
        notifier.notify(&notification).await.unwrap();
        assert_eq!(notifier.sent().await, vec![notification.clone()]);

        notifier.fail(true);
        assert!(notifier.notify(&notification).await.is_err());
        assert_eq!(notifier.sent().await.len(), 1);
    }
}
