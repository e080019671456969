//! Flow event envelope - the common wrapper for all run lifecycle events.

use chrono::{DateTime, Utc};
use runbay_id::{EventId, ProjectId, RunId};
use serde::{Deserialize, Serialize};

use crate::EventError;

/// Actor type for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A human user (manual cancel, relabel).
    User,
    /// The orchestrator itself (claim, reconcile, sweep).
    #[default]
    System,
    /// The agent running inside the job.
    Agent,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
            ActorType::Agent => write!(f, "agent"),
        }
    }
}

/// A flow event ready to be appended to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    /// Correlation chain the run belongs to (webhook delivery, manual trigger).
    pub correlation_id: String,

    /// Run this event describes, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,

    /// Owning project, if resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,

    /// Type of actor that triggered the event.
    pub actor_type: ActorType,

    /// Identifier of the actor (worker id for the orchestrator).
    pub actor_id: String,

    /// The event type (e.g., "run.started", "run.namespace.ttl_extended").
    pub event_type: String,

    /// Event-specific payload.
    pub payload: serde_json::Value,

    /// When the event was produced.
    pub created_at: DateTime<Utc>,
}

impl FlowEvent {
    /// Start a system event for the given correlation chain.
    pub fn system(
        event_type: impl Into<String>,
        correlation_id: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            run_id: None,
            project_id: None,
            actor_type: ActorType::System,
            actor_id: actor_id.into(),
            event_type: event_type.into(),
            payload: serde_json::Value::Object(serde_json::Map::new()),
            created_at: Utc::now(),
        }
    }

    /// Attach run and project identity.
    #[must_use]
    pub fn for_run(mut self, run_id: RunId, project_id: Option<ProjectId>) -> Self {
        self.run_id = Some(run_id);
        self.project_id = project_id;
        self
    }

    /// Serialize a typed payload into the event.
    pub fn with_payload<P: Serialize>(mut self, payload: &P) -> Result<Self, EventError> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Override the creation time (used when the caller already holds `now`).
    #[must_use]
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Decode the payload into a typed struct.
    pub fn payload_as<P: for<'de> Deserialize<'de>>(&self) -> Result<P, EventError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| EventError::InvalidPayload(format!("{}: {e}", self.event_type)))
    }

    /// Returns true for `run.succeeded`, `run.failed.*` and `run.canceled`.
    pub fn is_terminal(&self) -> bool {
        crate::event_types::is_terminal(&self.event_type)
    }
}

/// A flow event as persisted, with its store-assigned id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFlowEvent {
    pub event_id: EventId,
    #[serde(flatten)]
    pub event: FlowEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event_types, RunFinishedPayload, RunTerminalStatus};

    #[test]
    fn test_flow_event_builder() {
        let run_id = RunId::new();
        let event = FlowEvent::system(event_types::RUN_SUCCEEDED, "corr-1", "worker-a")
            .for_run(run_id, None)
            .with_payload(&RunFinishedPayload {
                status: RunTerminalStatus::Succeeded,
                reason: None,
                message: None,
                deploy_only: false,
            })
            .unwrap();

        assert_eq!(event.run_id, Some(run_id));
        assert_eq!(event.actor_type, ActorType::System);
        assert!(event.is_terminal());

        let payload: RunFinishedPayload = event.payload_as().unwrap();
        assert_eq!(payload.status, RunTerminalStatus::Succeeded);
    }

    #[test]
    fn test_actor_type_display() {
        assert_eq!(ActorType::System.to_string(), "system");
        assert_eq!(ActorType::Agent.to_string(), "agent");
    }
}
