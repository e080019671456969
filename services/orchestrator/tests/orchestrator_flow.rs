mod common;

use std::sync::Arc;

use common::{at, code_only_payload, full_env_payload, t0, test_config, World};
use runbay_events::{event_types, FlowEvent, RunFinishedPayload, RunStartedPayload, RunStatus};
use runbay_id::ProjectId;
use runbay_orchestrator::image::{ImageChecker, StaticImageChecker};
use runbay_reconcile::JobState;
use serde_json::json;

fn finished(events: &[FlowEvent]) -> RunFinishedPayload {
    events
        .iter()
        .find(|e| e.is_terminal())
        .expect("terminal event")
        .payload_as()
        .expect("finished payload")
}

#[tokio::test]
async fn code_only_run_launches_and_succeeds() {
    let world = World::new();
    let orchestrator = world.orchestrator(test_config("worker-a"));
    let project = ProjectId::new();
    let run_id = world.enqueue(project, code_only_payload()).await;

    let stats = orchestrator.tick_at(t0()).await.unwrap();
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.launched, 1);
    assert_eq!(world.status(run_id).await, Some(RunStatus::Running));

    let jobs = world.launcher.jobs_for_run(run_id).await;
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.spec.job_ref.namespace, common::DEFAULT_NAMESPACE);
    assert_eq!(job.spec.env["RUNBAY_RUNTIME_MODE"], "code-only");
    assert_eq!(job.spec.env["RUNBAY_TRIGGER_KIND"], "plan");

    assert_eq!(
        world.event_types(run_id).await,
        vec![event_types::RUN_PROFILE_RESOLVED, event_types::RUN_STARTED]
    );
    let events = world.events.events_for_run(run_id).await;
    let started: RunStartedPayload = events[1].payload_as().unwrap();
    assert!(!started.recovered);
    assert_eq!(started.slot_no, 1);
    assert_eq!(started.image_source, "primary_unchecked");

    // Job still running: lease renewed, nothing else happens.
    let stats = orchestrator.tick_at(at(10)).await.unwrap();
    assert_eq!(stats.kept_alive, 1);

    world
        .launcher
        .set_run_job_state(run_id, JobState::Succeeded)
        .await;
    let stats = orchestrator.tick_at(at(20)).await.unwrap();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(world.status(run_id).await, Some(RunStatus::Succeeded));

    let events = world.events.events_for_run(run_id).await;
    assert_eq!(events.last().unwrap().event_type, event_types::RUN_SUCCEEDED);
    assert!(world
        .queue
        .slots(project)
        .await
        .iter()
        .all(|slot| slot.run_id.is_none()));

    let notifications = world.notifier.sent().await;
    assert_eq!(
        notifications.last().unwrap().status,
        Some(RunStatus::Succeeded)
    );
}

#[tokio::test]
async fn failed_job_finalizes_with_job_failed_reason() {
    let world = World::new();
    let orchestrator = world.orchestrator(test_config("worker-a"));
    let run_id = world.enqueue(ProjectId::new(), code_only_payload()).await;

    orchestrator.tick_at(t0()).await.unwrap();
    world.launcher.set_run_job_state(run_id, JobState::Failed).await;
    let stats = orchestrator.tick_at(at(10)).await.unwrap();

    assert_eq!(stats.failed, 1);
    assert_eq!(world.status(run_id).await, Some(RunStatus::Failed));
    assert_eq!(
        world.event_types(run_id).await.last().unwrap(),
        "run.failed.kubernetes_job_failed"
    );
}

#[tokio::test]
async fn full_env_run_leases_namespace_and_launches_into_it() {
    let world = World::new();
    let orchestrator = world.orchestrator(test_config("worker-a"));
    let run_id = world.enqueue(ProjectId::new(), full_env_payload(7)).await;

    let stats = orchestrator.tick_at(t0()).await.unwrap();
    assert_eq!(stats.launched, 1);
    assert_eq!(world.preparer.calls(), 1);

    assert_eq!(
        world.event_types(run_id).await,
        vec![
            event_types::RUN_PROFILE_RESOLVED,
            event_types::RUN_NAMESPACE_PREPARED,
            event_types::RUN_NAMESPACE_TTL_SCHEDULED,
            event_types::RUN_STARTED,
        ]
    );

    let jobs = world.launcher.jobs_for_run(run_id).await;
    let namespace = jobs[0].spec.job_ref.namespace.clone();
    assert!(namespace.starts_with("runbay-"));
    assert!(namespace.contains("-i7-"));
    assert_eq!(jobs[0].spec.env["RUNBAY_NAMESPACE"], namespace);
    assert!(world.launcher.namespace(&namespace).await.is_some());
}

#[tokio::test]
async fn deploy_only_run_succeeds_without_job() {
    let world = World::new();
    let orchestrator = world.orchestrator(test_config("worker-a"));
    let payload = json!({
        "trigger": {"kind": "ops"},
        "repository": {"full_name": "acme/widgets"},
        "issue": {"number": 3},
        "runtime": {"deploy_only": true, "target_env": "staging"}
    });
    let run_id = world.enqueue(ProjectId::new(), payload).await;

    let stats = orchestrator.tick_at(t0()).await.unwrap();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.launched, 0);
    assert!(world.launcher.jobs_for_run(run_id).await.is_empty());
    assert_eq!(world.status(run_id).await, Some(RunStatus::Succeeded));

    let payload = finished(&world.events.events_for_run(run_id).await);
    assert!(payload.deploy_only);
}

#[tokio::test]
async fn revise_run_reuses_namespace_of_earlier_run() {
    let world = World::new();
    let orchestrator = world.orchestrator(test_config("worker-a"));
    let project = ProjectId::new();

    let first = world.enqueue(project, full_env_payload(7)).await;
    orchestrator.tick_at(t0()).await.unwrap();
    let first_ns = world.launcher.jobs_for_run(first).await[0]
        .spec
        .job_ref
        .namespace
        .clone();
    world.launcher.set_run_job_state(first, JobState::Succeeded).await;
    orchestrator.tick_at(at(10)).await.unwrap();
    assert_eq!(world.status(first).await, Some(RunStatus::Succeeded));

    let revise = world
        .enqueue(
            project,
            json!({
                "trigger": {"kind": "dev_revise"},
                "repository": {"full_name": "acme/widgets"},
                "issue": {"number": 7},
                "pull_request": {"number": 19, "head_ref": "runbay/issue-7"}
            }),
        )
        .await;
    let stats = orchestrator.tick_at(at(20)).await.unwrap();
    assert_eq!(stats.launched, 1);

    assert_eq!(
        world.event_types(revise).await,
        vec![
            event_types::RUN_PROFILE_RESOLVED,
            event_types::RUN_NAMESPACE_TTL_EXTENDED,
            event_types::RUN_STARTED,
        ]
    );
    let job = &world.launcher.jobs_for_run(revise).await[0];
    assert_eq!(job.spec.job_ref.namespace, first_ns);
    assert_eq!(job.spec.env["RUNBAY_TARGET_BRANCH"], "runbay/issue-7");
    assert_eq!(world.launcher.namespace_count().await, 1);

    // The job lives outside the derived namespace; reconcile finds it by label.
    let stats = orchestrator.tick_at(at(30)).await.unwrap();
    assert_eq!(stats.kept_alive, 1);
    assert_eq!(world.status(revise).await, Some(RunStatus::Running));
}

#[tokio::test]
async fn single_slot_project_runs_one_at_a_time() {
    let world = World::new();
    let mut config = test_config("worker-a");
    config.slots_per_project = 1;
    let orchestrator = world.orchestrator(config);
    let project = ProjectId::new();

    let first = world.enqueue(project, code_only_payload()).await;
    let second = world.enqueue(project, code_only_payload()).await;

    let stats = orchestrator.tick_at(t0()).await.unwrap();
    assert_eq!(stats.claimed, 1);
    assert_eq!(world.status(first).await, Some(RunStatus::Running));
    assert_eq!(world.status(second).await, Some(RunStatus::Pending));

    let stats = orchestrator.tick_at(at(10)).await.unwrap();
    assert_eq!(stats.claimed, 0);

    // Finishing the first run frees the slot within the same tick.
    world.launcher.set_run_job_state(first, JobState::Succeeded).await;
    let stats = orchestrator.tick_at(at(20)).await.unwrap();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.claimed, 1);
    assert_eq!(world.status(second).await, Some(RunStatus::Running));
}

#[tokio::test]
async fn project_settings_override_slot_count() {
    let world = World::new();
    let orchestrator = world.orchestrator(test_config("worker-a"));
    let project = ProjectId::new();

    for _ in 0..4 {
        world.enqueue(project, code_only_payload()).await;
    }
    // First claim creates the project row; then raise its limit.
    let stats = orchestrator.tick_at(t0()).await.unwrap();
    assert_eq!(stats.claimed, 2);

    world
        .queue
        .set_project_settings(project, json!({"slots_per_project": 3}))
        .await;
    let stats = orchestrator.tick_at(at(10)).await.unwrap();
    assert_eq!(stats.claimed, 1);
}

#[tokio::test]
async fn concurrent_orchestrators_never_exceed_slots() {
    let world = World::new();
    let a = world.orchestrator(test_config("worker-a"));
    let b = world.orchestrator(test_config("worker-b"));
    let project = ProjectId::new();
    let other = ProjectId::new();

    for _ in 0..5 {
        world.enqueue(project, code_only_payload()).await;
    }
    world.enqueue(other, code_only_payload()).await;

    let (sa, sb) = tokio::join!(a.tick_at(t0()), b.tick_at(t0()));
    let (sa, sb) = (sa.unwrap(), sb.unwrap());
    assert_eq!(sa.claimed + sb.claimed, 3);
    assert_eq!(sa.launched + sb.launched, 3);

    let leased = world
        .queue
        .slots(project)
        .await
        .into_iter()
        .filter(|slot| slot.run_id.is_some())
        .count();
    assert_eq!(leased, 2);
}

#[tokio::test]
async fn finalization_happens_once_across_workers() {
    let world = World::new();
    let a = world.orchestrator(test_config("worker-a"));
    let b = world.orchestrator(test_config("worker-b"));
    let run_id = world.enqueue(ProjectId::new(), code_only_payload()).await;

    a.tick_at(t0()).await.unwrap();
    world.launcher.set_run_job_state(run_id, JobState::Succeeded).await;

    // Worker B only sees the run once A's lease has expired.
    let stats = b.tick_at(at(10)).await.unwrap();
    assert_eq!(stats.reconciled, 0);
    let stats = b.tick_at(at(3600)).await.unwrap();
    assert_eq!(stats.succeeded, 1);

    let stats = a.tick_at(at(3601)).await.unwrap();
    assert_eq!(stats.succeeded, 0);

    let terminal = world
        .events
        .events_for_run(run_id)
        .await
        .into_iter()
        .filter(FlowEvent::is_terminal)
        .count();
    assert_eq!(terminal, 1);
}

#[tokio::test]
async fn conflicting_model_labels_fail_precondition() {
    let world = World::new();
    let orchestrator = world.orchestrator(test_config("worker-a"));
    let run_id = world
        .enqueue(
            ProjectId::new(),
            json!({
                "trigger": {"kind": "plan"},
                "repository": {"full_name": "acme/widgets"},
                "issue": {"number": 5, "labels": ["[ai-model-gpt-5.2]", "[ai-model-o3]"]}
            }),
        )
        .await;

    let stats = orchestrator.tick_at(t0()).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(world.status(run_id).await, Some(RunStatus::Failed));
    assert_eq!(
        world.event_types(run_id).await,
        vec!["run.failed.precondition"]
    );
    assert!(world.launcher.jobs_for_run(run_id).await.is_empty());
}

#[tokio::test]
async fn label_overrides_reach_profile_and_job() {
    let world = World::new();
    let orchestrator = world.orchestrator(test_config("worker-a"));
    let run_id = world
        .enqueue(
            ProjectId::new(),
            json!({
                "trigger": {"kind": "plan"},
                "repository": {"full_name": "acme/widgets"},
                "issue": {"number": 5, "labels": [{"name": "[ai-model-o3]"}, "[ai-reasoning-high]"]}
            }),
        )
        .await;

    orchestrator.tick_at(t0()).await.unwrap();

    let events = world.events.events_for_run(run_id).await;
    let profile: runbay_events::ProfileResolvedPayload = events[0].payload_as().unwrap();
    assert_eq!(profile.model, "o3");
    assert_eq!(profile.reasoning_effort, "high");

    let job = &world.launcher.jobs_for_run(run_id).await[0];
    assert_eq!(job.spec.env["RUNBAY_MODEL"], "o3");
    assert_eq!(job.spec.env["RUNBAY_REASONING_EFFORT"], "high");
}

#[tokio::test]
async fn event_store_failure_is_surfaced_not_swallowed() {
    let world = World::new();
    let orchestrator = world.orchestrator(test_config("worker-a"));
    let run_id = world.enqueue(ProjectId::new(), code_only_payload()).await;

    world.events.fail_inserts(true);
    let stats = orchestrator.tick_at(t0()).await.unwrap();
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.launched, 0);
    assert_eq!(world.status(run_id).await, Some(RunStatus::Running));
    assert!(world.launcher.jobs_for_run(run_id).await.is_empty());
}

#[tokio::test]
async fn launch_failure_finalizes_run() {
    let world = World::new();
    let orchestrator = world.orchestrator(test_config("worker-a"));
    let run_id = world.enqueue(ProjectId::new(), code_only_payload()).await;

    world.launcher.fail_launches(true);
    let stats = orchestrator.tick_at(t0()).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(
        world.event_types(run_id).await.last().unwrap(),
        "run.failed.job_launch_failed"
    );
}

#[tokio::test]
async fn namespace_failure_finalizes_run() {
    let world = World::new();
    let orchestrator = world.orchestrator(test_config("worker-a"));
    let run_id = world.enqueue(ProjectId::new(), full_env_payload(9)).await;

    world.launcher.fail_namespaces(true);
    orchestrator.tick_at(t0()).await.unwrap();
    assert_eq!(
        world.event_types(run_id).await.last().unwrap(),
        "run.failed.namespace_prepare_failed"
    );
}

#[tokio::test]
async fn mcp_token_failure_finalizes_run_but_access_key_does_not() {
    let world = World::new();
    let orchestrator = world.orchestrator(test_config("worker-a"));

    world.access_keys.fail(true);
    let launched = world.enqueue(ProjectId::new(), code_only_payload()).await;
    orchestrator.tick_at(t0()).await.unwrap();
    assert_eq!(world.status(launched).await, Some(RunStatus::Running));
    let job = &world.launcher.jobs_for_run(launched).await[0];
    assert!(!job.spec.env.contains_key("RUNBAY_ACCESS_KEY"));

    world.mcp_tokens.fail(true);
    let failed = world.enqueue(ProjectId::new(), code_only_payload()).await;
    orchestrator.tick_at(at(10)).await.unwrap();
    assert_eq!(
        world.event_types(failed).await.last().unwrap(),
        "run.failed.mcp_token_issue_failed"
    );
}

#[tokio::test]
async fn missing_image_without_fallback_fails_run() {
    let world = World::new();
    let checker: Arc<dyn ImageChecker> = Arc::new(StaticImageChecker::new());
    let orchestrator = world.orchestrator_with_images(test_config("worker-a"), Some(checker));
    let run_id = world.enqueue(ProjectId::new(), code_only_payload()).await;

    orchestrator.tick_at(t0()).await.unwrap();
    let payload = finished(&world.events.events_for_run(run_id).await);
    assert_eq!(
        payload.reason,
        Some(runbay_events::FailureReason::JobImageUnavailable)
    );
}

#[tokio::test]
async fn debug_label_skips_cleanup_and_sweep_spares_namespace() {
    let world = World::new();
    let mut config = test_config("worker-a");
    config.namespace_policy.default_ttl = std::time::Duration::from_secs(60);
    let orchestrator = world.orchestrator(config);
    let project = ProjectId::new();

    let debug_run = world
        .enqueue(
            project,
            json!({
                "trigger": {"kind": "dev"},
                "repository": {"full_name": "acme/widgets"},
                "issue": {"number": 11, "labels": ["runbay:debug"]}
            }),
        )
        .await;
    let plain_run = world.enqueue(project, full_env_payload(12)).await;

    orchestrator.tick_at(t0()).await.unwrap();
    assert!(world
        .event_types(debug_run)
        .await
        .contains(&event_types::RUN_NAMESPACE_CLEANUP_SKIPPED.to_string()));
    assert!(!world
        .event_types(plain_run)
        .await
        .contains(&event_types::RUN_NAMESPACE_CLEANUP_SKIPPED.to_string()));

    for run in [debug_run, plain_run] {
        world.launcher.set_run_job_state(run, JobState::Succeeded).await;
    }
    orchestrator.tick_at(at(10)).await.unwrap();

    let stats = orchestrator.tick_at(at(120)).await.unwrap();
    assert_eq!(stats.namespaces_cleaned, 1);
    assert_eq!(world.launcher.namespace_count().await, 1);

    let cleaned: Vec<_> = world
        .events
        .events()
        .await
        .into_iter()
        .filter(|stored| stored.event.event_type == event_types::RUN_NAMESPACE_CLEANED)
        .collect();
    assert_eq!(cleaned.len(), 1);
    assert_eq!(cleaned[0].event.project_id, Some(project));
}
