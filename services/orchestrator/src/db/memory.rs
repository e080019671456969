//! In-memory queue and flow event stores.
//!
//! Same claim semantics as the Postgres store, guarded by a single mutex.
//! Used by tests and by local runs without a database.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runbay_events::{FlowEvent, RunStatus, StoredFlowEvent};
use runbay_id::{EventId, ProjectId, RunId};
use runbay_reconcile::{lease_deadline, lease_expired};
use tokio::sync::Mutex;

use super::flow_events::FlowEventStore;
use super::queue::{
    resolve_project, ClaimRequest, ClaimedRun, ExtendLease, FinishRun, NewRun, ProjectSettings,
    QueueStore, RunningRun,
};
use super::DbError;

/// Slot lease state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Leased,
    Releasing,
}

/// A run row.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub correlation_id: String,
    pub project_id: Option<ProjectId>,
    pub learning_mode: Option<bool>,
    pub payload: serde_json::Value,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub slot_no: Option<i32>,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
}

/// A slot row.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotRecord {
    pub project_id: ProjectId,
    pub slot_no: i32,
    pub state: SlotState,
    pub run_id: Option<RunId>,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
}

impl SlotRecord {
    fn free(project_id: ProjectId, slot_no: i32) -> Self {
        Self {
            project_id,
            slot_no,
            state: SlotState::Free,
            run_id: None,
            lease_owner: None,
            lease_until: None,
        }
    }

    fn release(&mut self) {
        self.state = SlotState::Free;
        self.run_id = None;
        self.lease_owner = None;
        self.lease_until = None;
    }
}

/// A project row.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectRecord {
    pub project_id: ProjectId,
    pub slug: String,
    pub name: String,
    pub settings: serde_json::Value,
}

#[derive(Default)]
struct QueueState {
    /// Runs in insertion order.
    runs: Vec<RunRecord>,
    projects: HashMap<ProjectId, ProjectRecord>,
    slots: BTreeMap<(ProjectId, i32), SlotRecord>,
}

impl QueueState {
    fn run_mut(&mut self, run_id: RunId) -> Option<&mut RunRecord> {
        self.runs.iter_mut().find(|r| r.run_id == run_id)
    }

    fn is_running(&self, run_id: Option<RunId>) -> bool {
        run_id.is_some_and(|id| {
            self.runs
                .iter()
                .any(|r| r.run_id == id && r.status == RunStatus::Running)
        })
    }

    fn try_claim(
        &mut self,
        index: usize,
        request: &ClaimRequest,
    ) -> Result<Option<ClaimedRun>, DbError> {
        let candidate = self.runs[index].clone();
        let project = resolve_project(
            candidate.project_id,
            &candidate.payload,
            &candidate.correlation_id,
        )?;
        let project_id = project.project_id;

        let settings = ProjectSettings::from_value(
            &self
                .projects
                .entry(project_id)
                .or_insert_with(|| ProjectRecord {
                    project_id,
                    slug: project.slug.clone(),
                    name: project.name.clone(),
                    settings: serde_json::json!({}),
                })
                .settings,
        );

        let slots = settings.slots(request.slots_per_project) as i32;
        for slot_no in 1..=slots {
            self.slots
                .entry((project_id, slot_no))
                .or_insert_with(|| SlotRecord::free(project_id, slot_no));
        }

        let stale: Vec<(ProjectId, i32)> = self
            .slots
            .range((project_id, i32::MIN)..=(project_id, i32::MAX))
            .filter(|(_, slot)| {
                slot.state != SlotState::Free
                    && lease_expired(slot.lease_until, request.now)
                    && !self.is_running(slot.run_id)
            })
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            if let Some(slot) = self.slots.get_mut(&key) {
                slot.release();
            }
        }

        let Some(slot) = self
            .slots
            .range_mut((project_id, i32::MIN)..=(project_id, i32::MAX))
            .map(|(_, slot)| slot)
            .find(|slot| slot.state == SlotState::Free)
        else {
            return Ok(None);
        };

        slot.state = SlotState::Leased;
        slot.run_id = Some(candidate.run_id);
        slot.lease_owner = Some(request.worker_id.clone());
        slot.lease_until = Some(lease_deadline(request.now, request.slot_lease_ttl));
        let slot_no = slot.slot_no;

        let learning_mode = candidate
            .learning_mode
            .or(settings.learning_mode_default)
            .unwrap_or(request.learning_mode_default);
        let lease_until = lease_deadline(request.now, request.run_lease_ttl);

        let run = &mut self.runs[index];
        run.status = RunStatus::Running;
        run.project_id = Some(project_id);
        run.learning_mode = Some(learning_mode);
        run.started_at = Some(request.now);
        run.slot_no = Some(slot_no);
        run.lease_owner = Some(request.worker_id.clone());
        run.lease_until = Some(lease_until);

        Ok(Some(ClaimedRun {
            run_id: candidate.run_id,
            correlation_id: candidate.correlation_id,
            project_id,
            learning_mode,
            payload: candidate.payload,
            slot_no,
            started_at: request.now,
            lease_until,
        }))
    }
}

/// In-memory queue store.
#[derive(Default)]
pub struct MemoryQueueStore {
    state: Mutex<QueueState>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending run.
    pub async fn enqueue(&self, run: NewRun) -> RunId {
        let run_id = run.run_id;
        self.state.lock().await.runs.push(RunRecord {
            run_id,
            correlation_id: run.correlation_id,
            project_id: run.project_id,
            learning_mode: run.learning_mode,
            payload: run.payload,
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            slot_no: None,
            lease_owner: None,
            lease_until: None,
        });
        run_id
    }

    /// Create or replace a project's settings.
    pub async fn set_project_settings(&self, project_id: ProjectId, settings: serde_json::Value) {
        let mut state = self.state.lock().await;
        let slug = format!("project-{}", project_id.compact(12));
        state
            .projects
            .entry(project_id)
            .and_modify(|p| p.settings = settings.clone())
            .or_insert(ProjectRecord {
                project_id,
                slug: slug.clone(),
                name: slug,
                settings,
            });
    }

    pub async fn run(&self, run_id: RunId) -> Option<RunRecord> {
        self.state
            .lock()
            .await
            .runs
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned()
    }

    pub async fn project(&self, project_id: ProjectId) -> Option<ProjectRecord> {
        self.state.lock().await.projects.get(&project_id).cloned()
    }

    pub async fn slots(&self, project_id: ProjectId) -> Vec<SlotRecord> {
        self.state
            .lock()
            .await
            .slots
            .range((project_id, i32::MIN)..=(project_id, i32::MAX))
            .map(|(_, slot)| slot.clone())
            .collect()
    }

    /// Overwrite a run's started_at (simulates time passing since claim).
    pub async fn set_started_at(&self, run_id: RunId, started_at: DateTime<Utc>) {
        if let Some(run) = self.state.lock().await.run_mut(run_id) {
            run.started_at = Some(started_at);
        }
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn claim_next_pending(
        &self,
        request: &ClaimRequest,
    ) -> Result<Option<ClaimedRun>, DbError> {
        let mut state = self.state.lock().await;

        let candidates: Vec<usize> = state
            .runs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == RunStatus::Pending)
            .map(|(i, _)| i)
            .take(request.scan_limit.max(1) as usize)
            .collect();

        for index in candidates {
            // Work on a copy so a failed attempt leaves no partial effects.
            let mut attempt = QueueState {
                runs: state.runs.clone(),
                projects: state.projects.clone(),
                slots: state.slots.clone(),
            };
            match attempt.try_claim(index, request) {
                Ok(Some(claimed)) => {
                    *state = attempt;
                    return Ok(Some(claimed));
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "candidate claim aborted");
                    continue;
                }
            }
        }

        Ok(None)
    }

    async fn claim_running(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<RunningRun>, DbError> {
        let mut state = self.state.lock().await;
        let lease_until = lease_deadline(now, lease_ttl);

        let mut claimed = Vec::new();
        for run in state.runs.iter_mut() {
            if claimed.len() >= limit as usize {
                break;
            }
            if run.status != RunStatus::Running {
                continue;
            }
            let owned = run.lease_owner.as_deref() == Some(worker_id);
            if !owned && !lease_expired(run.lease_until, now) {
                continue;
            }
            let Some(project_id) = run.project_id else {
                return Err(DbError::InvalidRow {
                    table: "agent_runs",
                    message: format!("running run {} has no project_id", run.run_id),
                });
            };

            run.lease_owner = Some(worker_id.to_string());
            run.lease_until = Some(lease_until);
            claimed.push(RunningRun {
                run_id: run.run_id,
                correlation_id: run.correlation_id.clone(),
                project_id,
                learning_mode: run.learning_mode.unwrap_or(false),
                payload: run.payload.clone(),
                slot_no: run.slot_no,
                started_at: run.started_at,
                lease_until: run.lease_until,
            });
        }

        Ok(claimed)
    }

    async fn finish_run(&self, finish: &FinishRun) -> Result<bool, DbError> {
        let mut state = self.state.lock().await;

        let Some(run) = state.run_mut(finish.run_id) else {
            return Ok(false);
        };
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        let owner_ok = run.lease_owner.is_none()
            || run.lease_owner.as_deref() == Some(finish.worker_id.as_str())
            || lease_expired(run.lease_until, finish.finished_at);
        if !owner_ok {
            return Ok(false);
        }

        run.status = finish.status.into();
        run.finished_at = Some(finish.finished_at);
        run.lease_owner = None;
        run.lease_until = None;
        let project_id = run.project_id;

        if let Some(project_id) = project_id {
            for slot in state
                .slots
                .range_mut((project_id, i32::MIN)..=(project_id, i32::MAX))
                .map(|(_, slot)| slot)
                .filter(|slot| slot.run_id == Some(finish.run_id))
            {
                slot.release();
            }
        }

        Ok(true)
    }

    async fn extend_lease(&self, extend: &ExtendLease) -> Result<bool, DbError> {
        let mut state = self.state.lock().await;
        let lease_until = lease_deadline(extend.now, extend.lease_ttl);

        let Some(run) = state.run_mut(extend.run_id) else {
            return Ok(false);
        };
        if run.status != RunStatus::Running
            || run.lease_owner.as_deref() != Some(extend.worker_id.as_str())
        {
            return Ok(false);
        }
        run.lease_until = Some(lease_until);

        for slot in state
            .slots
            .range_mut((extend.project_id, i32::MIN)..=(extend.project_id, i32::MAX))
            .map(|(_, slot)| slot)
            .filter(|slot| slot.run_id == Some(extend.run_id))
        {
            slot.state = SlotState::Leased;
            slot.lease_owner = Some(extend.worker_id.clone());
            slot.lease_until = Some(lease_until);
        }

        Ok(true)
    }
}

/// In-memory flow event store.
#[derive(Default)]
pub struct MemoryFlowEventStore {
    events: Mutex<Vec<StoredFlowEvent>>,
    next_id: AtomicI64,
    fail_inserts: AtomicBool,
}

impl MemoryFlowEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent insert fail (or succeed again).
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub async fn events(&self) -> Vec<StoredFlowEvent> {
        self.events.lock().await.clone()
    }

    pub async fn events_for_run(&self, run_id: RunId) -> Vec<FlowEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.event.run_id == Some(run_id))
            .map(|e| e.event.clone())
            .collect()
    }

    pub async fn event_types_for_run(&self, run_id: RunId) -> Vec<String> {
        self.events_for_run(run_id)
            .await
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }
}

#[async_trait]
impl FlowEventStore for MemoryFlowEventStore {
    async fn insert(&self, event: &FlowEvent) -> Result<i64, DbError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("flow event insert rejected".to_string()));
        }
        let mut events = self.events.lock().await;
        let event_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        events.push(StoredFlowEvent {
            event_id: EventId::new(event_id),
            event: event.clone(),
        });
        Ok(event_id)
    }
}
