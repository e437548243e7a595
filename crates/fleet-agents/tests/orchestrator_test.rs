//! Integration tests for the worker orchestrator, driven by a scripted spawner.

mod support;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_agents::events::OrchestratorEvent;
use fleet_agents::orchestrator::{OrchestratorError, SpawnSpec, StartMode, WorkerOrchestrator};
use fleet_agents::process::SpawnError;
use fleet_core::profiles::{CredentialRef, Profile, ProfileManager, CONFIG_DIR_ENV};
use fleet_core::task_store::{self, TaskPersistence};
use fleet_core::types::{ExecutionPhase, ReviewReason, Task, TaskStatus};
use support::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingStore {
    writes: Mutex<Vec<(TaskStatus, Option<ReviewReason>)>>,
    progress: Mutex<Vec<ExecutionPhase>>,
}

impl TaskPersistence for RecordingStore {
    fn persist(&self, task: &Task) -> task_store::Result<()> {
        self.writes.lock().unwrap().push((task.status, task.review_reason));
        Ok(())
    }

    fn persist_progress(&self, task: &Task) -> task_store::Result<()> {
        self.progress.lock().unwrap().push(task.execution_progress.phase);
        Ok(())
    }
}

fn task_in(status: TaskStatus) -> Task {
    let mut task = Task::new("001-add-login", "demo", "Add login");
    task.status = status;
    task
}

fn spec() -> SpawnSpec {
    SpawnSpec::new("/tmp/fleet-test-worktree")
        .with_env("FLEET_SPEC_ID", "001-add-login")
        .with_env("CALLER", "yes")
}

fn profile(name: &str) -> Profile {
    Profile::new(
        name,
        CredentialRef::ConfigDir {
            path: format!("/profiles/{name}").into(),
        },
    )
}

fn orchestrator() -> (WorkerOrchestrator, Arc<MockSpawner>, flume::Receiver<MockWorker>) {
    let (spawner, workers) = MockSpawner::new();
    let orch = WorkerOrchestrator::builder(settings(), spawner.clone()).build().unwrap();
    (orch, spawner, workers)
}

fn orchestrator_with_profiles(
    names: &[&str],
    auto_swap: bool,
) -> (
    WorkerOrchestrator,
    Arc<Mutex<ProfileManager>>,
    Vec<Uuid>,
    flume::Receiver<MockWorker>,
) {
    let mut manager = ProfileManager::new();
    let ids = names
        .iter()
        .map(|n| manager.add_profile(profile(n)).unwrap())
        .collect();
    let profiles = Arc::new(Mutex::new(manager));
    let (spawner, workers) = MockSpawner::new();
    let mut s = settings();
    s.auto_swap_on_rate_limit = auto_swap;
    let orch = WorkerOrchestrator::builder(s, spawner)
        .profiles(profiles.clone())
        .build()
        .unwrap();
    (orch, profiles, ids, workers)
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clean_exit_moves_task_to_human_review() {
    let store = Arc::new(RecordingStore::default());
    let (spawner, workers) = MockSpawner::new();
    let mut s = settings();
    s.base_env = BTreeMap::from([("BASE".to_string(), "1".to_string())]);
    let orch = WorkerOrchestrator::builder(s, spawner)
        .persistence(store.clone())
        .build()
        .unwrap();
    let events = orch.subscribe();
    let task = orch.track(task_in(TaskStatus::Queue)).await;

    orch.spawn(task.task_id, spec().with_start(StartMode::Walk)).await.unwrap();
    let worker = next_worker(&workers).await;
    assert_eq!(worker.request.program, "worker");
    assert_eq!(worker.request.args, vec!["--spec", "001-add-login"]);
    assert_eq!(worker.env("BASE"), Some("1"));
    assert_eq!(worker.env("CALLER"), Some("yes"));

    let seen = wait_for(&events, |e| matches!(e, OrchestratorEvent::StatusChange { .. })).await;
    assert!(matches!(
        seen.last(),
        Some(OrchestratorEvent::StatusChange {
            status: TaskStatus::InProgress,
            ..
        })
    ));

    worker.line(r#"__EXEC_PHASE__:{"phase":"coding","subtask":"1.1"}"#);
    let seen = wait_for(&events, |e| matches!(e, OrchestratorEvent::Progress { .. })).await;
    assert!(matches!(
        seen.last(),
        Some(OrchestratorEvent::Progress {
            phase: ExecutionPhase::Coding,
            percent: 26,
            ..
        })
    ));

    worker.exit(0);
    let seen = wait_for(&events, is_exit).await;
    assert!(seen.contains(&OrchestratorEvent::Progress {
        task_id: task.task_id,
        phase: ExecutionPhase::Complete,
        percent: 100,
        message: None,
    }));
    assert!(seen.contains(&OrchestratorEvent::StatusChange {
        task_id: task.task_id,
        status: TaskStatus::HumanReview,
        reason: Some(ReviewReason::Completed),
    }));
    assert_eq!(
        seen.last(),
        Some(&OrchestratorEvent::Exit {
            task_id: task.task_id,
            code: 0
        })
    );

    let task = orch.task(task.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::HumanReview);
    assert_eq!(task.execution_progress.overall_percent, 100);
    assert!(!orch.has_live_worker(task.task_id).await);
    assert_eq!(
        store.writes.lock().unwrap().last(),
        Some(&(TaskStatus::HumanReview, Some(ReviewReason::Completed)))
    );
}

#[tokio::test]
async fn progress_is_written_once_per_phase_and_never_as_a_status() {
    let store = Arc::new(RecordingStore::default());
    let (spawner, workers) = MockSpawner::new();
    let orch = WorkerOrchestrator::builder(settings(), spawner)
        .persistence(store.clone())
        .build()
        .unwrap();
    let events = orch.subscribe();
    let task = orch.track(task_in(TaskStatus::InProgress)).await;

    orch.spawn(task.task_id, spec()).await.unwrap();
    let worker = next_worker(&workers).await;
    for line in [
        r#"__EXEC_PHASE__:{"phase":"coding","progress":10}"#,
        r#"__EXEC_PHASE__:{"phase":"coding","progress":40}"#,
        r#"__EXEC_PHASE__:{"phase":"coding","progress":70}"#,
        r#"__EXEC_PHASE__:{"phase":"qa_review"}"#,
        "done reporting",
    ] {
        worker.line(line);
    }
    wait_for(&events, |e| matches!(e, OrchestratorEvent::Log { text, .. } if text == "done reporting")).await;

    assert_eq!(
        *store.progress.lock().unwrap(),
        vec![ExecutionPhase::Coding, ExecutionPhase::QaReview]
    );
    assert!(store.writes.lock().unwrap().is_empty());
    assert_eq!(
        orch.task(task.task_id).await.unwrap().execution_progress.phase,
        ExecutionPhase::QaReview
    );
}

#[tokio::test]
async fn crash_without_rate_limit_is_an_error() {
    let (orch, _spawner, workers) = orchestrator();
    let events = orch.subscribe();
    let task = orch.track(task_in(TaskStatus::InProgress)).await;

    orch.spawn(task.task_id, spec()).await.unwrap();
    let worker = next_worker(&workers).await;
    worker.line("thread 'main' panicked at src/lib.rs:12");
    worker.exit(101);

    let seen = wait_for(&events, is_exit).await;
    assert!(seen.contains(&OrchestratorEvent::StatusChange {
        task_id: task.task_id,
        status: TaskStatus::Error,
        reason: Some(ReviewReason::Errors),
    }));
    assert!(!seen.iter().any(|e| matches!(e, OrchestratorEvent::RateLimited { .. })));
    assert_eq!(orch.task(task.task_id).await.unwrap().status, TaskStatus::Error);
}

#[tokio::test]
async fn spawn_failure_leaves_status_untouched() {
    let (orch, spawner, _workers) = orchestrator();
    let task = orch.track(task_in(TaskStatus::Queue)).await;
    spawner.fail_next(SpawnError::NotFound("worker".into()));

    let err = orch
        .spawn(task.task_id, spec().with_start(StartMode::Walk))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Spawn(SpawnError::NotFound(_))));
    assert_eq!(orch.task(task.task_id).await.unwrap().status, TaskStatus::Queue);
    assert!(!orch.has_live_worker(task.task_id).await);
}

#[tokio::test]
async fn spawning_an_untracked_task_fails() {
    let (orch, spawner, _workers) = orchestrator();
    let err = orch.spawn(Uuid::new_v4(), spec()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownTask(_)));
    assert_eq!(spawner.spawn_count(), 0);
}

#[tokio::test]
async fn walk_reaches_in_progress_through_legal_steps() {
    let (orch, spawner, _workers) = orchestrator();
    let events = orch.subscribe();
    let task = orch.track(task_in(TaskStatus::PrCreated)).await;
    // pr_created -> done -> backlog -> queue -> in_progress is legal.
    orch.spawn(task.task_id, spec().with_start(StartMode::Walk)).await.unwrap();
    assert_eq!(spawner.spawn_count(), 1);
    assert_eq!(orch.task(task.task_id).await.unwrap().status, TaskStatus::InProgress);

    let steps: Vec<_> = quiet_period(&events, Duration::from_millis(100))
        .await
        .into_iter()
        .filter_map(|e| match e {
            OrchestratorEvent::StatusChange { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(
        steps,
        vec![
            TaskStatus::Done,
            TaskStatus::Backlog,
            TaskStatus::Queue,
            TaskStatus::InProgress
        ]
    );
}

// ---------------------------------------------------------------------------
// Kill and restart
// ---------------------------------------------------------------------------

#[tokio::test]
async fn spawn_twice_keeps_one_handle_and_discards_stale_exit() {
    let (orch, _spawner, workers) = orchestrator();
    let task = orch.track(task_in(TaskStatus::InProgress)).await;

    let first_id = orch.spawn(task.task_id, spec()).await.unwrap();
    let first = next_worker(&workers).await;
    let second_id = orch.spawn(task.task_id, spec()).await.unwrap();
    let second = next_worker(&workers).await;

    assert_ne!(first_id, second_id);
    assert!(first.control.terminated.load(std::sync::atomic::Ordering::SeqCst));
    assert_eq!(orch.live_task_ids().await.len(), 1);
    assert_eq!(orch.worker(task.task_id).await.unwrap().spawn_id, second_id);

    let events = orch.subscribe();
    first.line("Claude usage limit reached");
    first.exit(143);
    let noise = quiet_period(&events, Duration::from_millis(200)).await;
    assert!(!noise.iter().any(is_status_or_exit), "stale exit leaked: {noise:?}");
    assert_eq!(orch.task(task.task_id).await.unwrap().status, TaskStatus::InProgress);
    assert!(orch.has_live_worker(task.task_id).await);

    second.exit(0);
    wait_for(&events, is_exit).await;
    assert_eq!(orch.task(task.task_id).await.unwrap().status, TaskStatus::HumanReview);
}

#[tokio::test]
async fn kill_escalates_after_grace_and_exit_is_silent() {
    let (orch, _spawner, workers) = orchestrator();
    let task = orch.track(task_in(TaskStatus::InProgress)).await;
    orch.spawn(task.task_id, spec()).await.unwrap();
    let worker = next_worker(&workers).await;
    let events = orch.subscribe();

    assert!(orch.kill(task.task_id).await);
    assert!(!orch.kill(task.task_id).await);
    assert!(worker.control.terminated.load(std::sync::atomic::Ordering::SeqCst));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(worker.control.force_killed.load(std::sync::atomic::Ordering::SeqCst));

    worker.exit(137);
    let noise = quiet_period(&events, Duration::from_millis(200)).await;
    assert!(!noise.iter().any(is_status_or_exit), "killed exit leaked: {noise:?}");
    assert_eq!(orch.task(task.task_id).await.unwrap().status, TaskStatus::InProgress);
}

#[tokio::test]
async fn kill_all_stops_every_worker() {
    let (orch, _spawner, workers) = orchestrator();
    let a = orch.track(task_in(TaskStatus::InProgress)).await;
    let b = orch.track(Task::new("002-other", "demo", "Other")).await;
    orch.spawn(a.task_id, spec()).await.unwrap();
    orch.spawn(b.task_id, spec()).await.unwrap();
    let wa = next_worker(&workers).await;
    let wb = next_worker(&workers).await;

    assert_eq!(orch.kill_all().await, 2);
    assert!(orch.live_task_ids().await.is_empty());
    assert!(wa.control.terminated.load(std::sync::atomic::Ordering::SeqCst));
    assert!(wb.control.terminated.load(std::sync::atomic::Ordering::SeqCst));
}

// ---------------------------------------------------------------------------
// Rate limits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rate_limit_swaps_profile_and_respawns() {
    let (orch, profiles, ids, workers) = orchestrator_with_profiles(&["main", "spare"], true);
    let (main_id, spare_id) = (ids[0], ids[1]);
    let events = orch.subscribe();
    let task = orch.track(task_in(TaskStatus::InProgress)).await;

    orch.spawn(task.task_id, spec()).await.unwrap();
    let first = next_worker(&workers).await;
    assert_eq!(first.env(CONFIG_DIR_ENV), Some("/profiles/main"));
    first.line("Working on subtask 1.1");
    first.line("Claude usage limit reached · resets 5pm");
    first.exit(1);

    let seen = wait_for(&events, |e| matches!(e, OrchestratorEvent::RateLimited { .. })).await;
    match seen.last() {
        Some(OrchestratorEvent::RateLimited {
            profile_id,
            suggested_profile_id,
            ..
        }) => {
            assert_eq!(*profile_id, Some(main_id));
            assert_eq!(*suggested_profile_id, Some(spare_id));
        }
        other => panic!("unexpected {other:?}"),
    }

    let second = next_worker(&workers).await;
    assert_eq!(second.env(CONFIG_DIR_ENV), Some("/profiles/spare"));
    assert_eq!(second.env("CALLER"), Some("yes"));
    {
        let profiles = profiles.lock().unwrap();
        assert_eq!(profiles.active().unwrap().id, spare_id);
        assert!(profiles.get(main_id).unwrap().rate_limit.is_limited);
    }
    assert_eq!(orch.task(task.task_id).await.unwrap().status, TaskStatus::InProgress);
    let between = quiet_period(&events, Duration::from_millis(100)).await;
    assert!(!between.iter().any(is_status_or_exit), "swap was not transparent: {between:?}");

    second.exit(0);
    let seen = wait_for(&events, is_exit).await;
    assert!(seen.contains(&OrchestratorEvent::StatusChange {
        task_id: task.task_id,
        status: TaskStatus::HumanReview,
        reason: Some(ReviewReason::Completed),
    }));
}

#[tokio::test]
async fn rate_limit_without_spare_profile_escalates() {
    let (orch, profiles, ids, workers) = orchestrator_with_profiles(&["main"], true);
    let events = orch.subscribe();
    let task = orch.track(task_in(TaskStatus::InProgress)).await;

    orch.spawn(task.task_id, spec()).await.unwrap();
    let worker = next_worker(&workers).await;
    worker.line("API Error: 429 Too Many Requests");
    worker.exit(1);

    let seen = wait_for(&events, is_exit).await;
    let kinds: Vec<_> = seen
        .iter()
        .filter(|e| !matches!(e, OrchestratorEvent::Log { .. } | OrchestratorEvent::Progress { .. }))
        .map(|e| e.kind())
        .collect();
    assert_eq!(kinds, vec!["rate_limited", "status_change", "exit"]);
    assert!(seen.contains(&OrchestratorEvent::StatusChange {
        task_id: task.task_id,
        status: TaskStatus::HumanReview,
        reason: Some(ReviewReason::RateLimited),
    }));
    assert!(seen.iter().any(|e| matches!(
        e,
        OrchestratorEvent::RateLimited {
            suggested_profile_id: None,
            ..
        }
    )));
    assert!(profiles.lock().unwrap().get(ids[0]).unwrap().rate_limit.is_limited);
}

#[tokio::test]
async fn rate_limit_with_auto_swap_disabled_escalates() {
    let (orch, profiles, ids, workers) = orchestrator_with_profiles(&["main", "spare"], false);
    let events = orch.subscribe();
    let task = orch.track(task_in(TaskStatus::InProgress)).await;

    orch.spawn(task.task_id, spec()).await.unwrap();
    let worker = next_worker(&workers).await;
    worker.line("rate limit exceeded, retry after 60 seconds");
    worker.exit(2);

    let seen = wait_for(&events, is_exit).await;
    assert!(seen.iter().any(|e| matches!(
        e,
        OrchestratorEvent::RateLimited { suggested_profile_id: Some(id), .. } if *id == ids[1]
    )));
    assert_eq!(orch.task(task.task_id).await.unwrap().status, TaskStatus::HumanReview);
    assert_eq!(profiles.lock().unwrap().active().unwrap().id, ids[0]);
    assert!(workers.try_recv().is_err(), "no respawn expected");
}

#[tokio::test]
async fn rate_limit_text_before_a_clean_exit_is_ignored() {
    let mut manager = ProfileManager::new();
    manager.add_profile(profile("main")).unwrap();
    manager.add_profile(profile("spare")).unwrap();
    let (spawner, workers) = MockSpawner::new();
    let orch = WorkerOrchestrator::builder(settings(), spawner.clone())
        .profiles(Arc::new(Mutex::new(manager)))
        .build()
        .unwrap();
    let events = orch.subscribe();
    let task = orch.track(task_in(TaskStatus::InProgress)).await;

    orch.spawn(task.task_id, spec()).await.unwrap();
    let worker = next_worker(&workers).await;
    worker.line("Claude usage limit reached · resets 5pm");
    worker.exit(0);

    let mut seen = wait_for(&events, is_exit).await;
    seen.extend(quiet_period(&events, Duration::from_millis(100)).await);
    assert!(!seen.iter().any(|e| matches!(e, OrchestratorEvent::RateLimited { .. })));
    assert!(seen.contains(&OrchestratorEvent::StatusChange {
        task_id: task.task_id,
        status: TaskStatus::HumanReview,
        reason: Some(ReviewReason::Completed),
    }));
    assert_eq!(spawner.spawn_count(), 1);
    assert!(workers.try_recv().is_err(), "no respawn expected");
}
