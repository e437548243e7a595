//! Task runner host: the glue between the task store, the workspace engine
//! and the orchestrator.
//!
//! A task counts as running when this runner's orchestrator holds its worker,
//! or when another live orchestrator process has a claim file for it.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use fleet_core::task_store::{TaskStore, TaskStoreError};
use fleet_core::types::{ReviewReason, Task, TaskStatus};
use fleet_core::worktree::WorkspaceError;
use fleet_core::worktree_manager::WorkspaceEngine;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::OrchestratorEvent;
use crate::orchestrator::{
    OrchestratorError, SpawnSpec, StartMode, WorkerOrchestrator, ENV_PROJECT_ROOT, ENV_SPEC_DIR,
    ENV_SPEC_ID, ENV_TASK_ID,
};
use crate::reconcile::{self, ReconcileReport};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Store(#[from] TaskStoreError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("task {0} already has a live worker")]
    AlreadyRunning(String),
    #[error("task {0} is archived")]
    Archived(String),
    #[error("task {spec_id} is {status} and cannot be started")]
    NotStartable { spec_id: String, status: TaskStatus },
    #[error("task {spec_id} is not stuck (status {status})")]
    NotStuck { spec_id: String, status: TaskStatus },
    #[error("task {spec_id} is {status}, not awaiting review")]
    NotInReview { spec_id: String, status: TaskStatus },
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// A worker started by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedWorker {
    pub task_id: Uuid,
    pub spec_id: String,
    pub spawn_id: u64,
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StopOutcome {
    pub task: Task,
    /// Whether a live worker was signalled.
    pub killed: bool,
}

pub struct TaskRunner {
    store: TaskStore,
    workspaces: Arc<WorkspaceEngine>,
    orchestrator: WorkerOrchestrator,
}

impl TaskRunner {
    pub fn new(store: TaskStore, workspaces: Arc<WorkspaceEngine>, orchestrator: WorkerOrchestrator) -> Self {
        Self {
            store,
            workspaces,
            orchestrator,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn orchestrator(&self) -> &WorkerOrchestrator {
        &self.orchestrator
    }

    /// Ensure the task's workspace, then start a worker in it and walk the
    /// task to `in_progress`.
    ///
    /// `key` is anything [`TaskStore::resolve`] accepts.
    pub async fn start_task(&self, key: &str) -> Result<StartedWorker> {
        let task = self.store.resolve(key)?;
        if task.is_archived() {
            return Err(RunnerError::Archived(task.spec_id));
        }
        if self.is_running(&task).await {
            return Err(RunnerError::AlreadyRunning(task.spec_id));
        }
        // in_progress without a worker is the stuck case; recover_stuck owns it.
        if task.status.is_terminal() || task.status == TaskStatus::InProgress {
            return Err(RunnerError::NotStartable {
                spec_id: task.spec_id,
                status: task.status,
            });
        }
        self.launch(task, StartMode::Walk).await
    }

    /// Kill the task's worker and hand the task to a human.
    pub async fn stop_task(&self, key: &str) -> Result<StopOutcome> {
        let task = self.store.resolve(key)?;
        let killed = self.orchestrator.kill(task.task_id).await;
        let task = self.orchestrator.track(task).await;
        if task.status != TaskStatus::InProgress {
            return Ok(StopOutcome { task, killed });
        }
        let task = self
            .orchestrator
            .transition(task.task_id, TaskStatus::HumanReview, Some(ReviewReason::Stopped))
            .await?;
        info!(spec_id = %task.spec_id, killed, "task stopped");
        Ok(StopOutcome { task, killed })
    }

    pub async fn find_stuck(&self) -> Result<Vec<Task>> {
        let tasks = self.store.list_active()?;
        let live = self.live_workers(&tasks).await;
        Ok(reconcile::find_stuck(&tasks, &live).into_iter().cloned().collect())
    }

    /// Respawn a stuck task's worker and force it back into `in_progress`.
    pub async fn recover_stuck(&self, key: &str) -> Result<StartedWorker> {
        let task = self.store.resolve(key)?;
        let live = self.live_workers(std::slice::from_ref(&task)).await;
        if !reconcile::is_stuck(&task, &live) {
            return Err(RunnerError::NotStuck {
                spec_id: task.spec_id,
                status: task.status,
            });
        }
        info!(spec_id = %task.spec_id, task_id = %task.task_id, "recovering stuck task");
        self.launch(task, StartMode::Force).await
    }

    /// One sweep for stuck tasks. Each finding is logged; nothing is changed.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let tasks = self.store.list_active()?;
        let live = self.live_workers(&tasks).await;
        let report = reconcile::reconcile(&tasks, &live, Utc::now());
        for stuck in &report.stuck {
            warn!(
                spec_id = %stuck.spec_id,
                task_id = %stuck.task_id,
                since = %stuck.since,
                "task is in progress but has no live worker"
            );
        }
        Ok(report)
    }

    // -- review -------------------------------------------------------------

    /// Accept a reviewed task: `human_review` or `ai_review` to `done`.
    pub async fn approve(&self, key: &str) -> Result<Task> {
        let task = self.idle_task(key).await?;
        if !matches!(task.status, TaskStatus::HumanReview | TaskStatus::AiReview) {
            return Err(not_in_review(task));
        }
        self.settle(task, TaskStatus::Done).await
    }

    /// Send a reviewed or failed task back to the backlog.
    pub async fn reject(&self, key: &str) -> Result<Task> {
        let task = self.idle_task(key).await?;
        if !matches!(task.status, TaskStatus::HumanReview | TaskStatus::Error) {
            return Err(not_in_review(task));
        }
        self.settle(task, TaskStatus::Backlog).await
    }

    /// Send a reviewed or failed task straight back to a fresh worker.
    pub async fn rework(&self, key: &str) -> Result<StartedWorker> {
        let task = self.idle_task(key).await?;
        if !matches!(
            task.status,
            TaskStatus::HumanReview | TaskStatus::AiReview | TaskStatus::Error
        ) {
            return Err(not_in_review(task));
        }
        info!(spec_id = %task.spec_id, from = %task.status, "reworking task");
        self.launch(task, StartMode::Walk).await
    }

    /// Record the pull request opened for a reviewed or finished task.
    pub async fn record_pull_request(&self, key: &str, url: &str) -> Result<Task> {
        let task = self.idle_task(key).await?;
        let task = self.store.record_pull_request(&task.spec_id, url)?;
        Ok(self.announce(task).await)
    }

    /// Mark a task `done` after its workspace was merged. Tasks that are not
    /// awaiting review are left alone.
    pub async fn complete_merged(&self, key: &str) -> Result<Option<Task>> {
        match self.store.complete_merged(key)? {
            Some(task) => Ok(Some(self.announce(task).await)),
            None => Ok(None),
        }
    }

    async fn settle(&self, mut task: Task, to: TaskStatus) -> Result<Task> {
        self.store.apply_transition(&mut task, to, None)?;
        Ok(self.announce(task).await)
    }

    async fn announce(&self, task: Task) -> Task {
        let task = self.orchestrator.track(task).await;
        self.orchestrator.events().publish(OrchestratorEvent::StatusChange {
            task_id: task.task_id,
            status: task.status,
            reason: task.review_reason,
        });
        task
    }

    async fn idle_task(&self, key: &str) -> Result<Task> {
        let task = self.store.resolve(key)?;
        if task.is_archived() {
            return Err(RunnerError::Archived(task.spec_id));
        }
        if self.is_running(&task).await {
            return Err(RunnerError::AlreadyRunning(task.spec_id));
        }
        Ok(task)
    }

    // -- liveness -----------------------------------------------------------

    async fn is_running(&self, task: &Task) -> bool {
        self.live_workers(std::slice::from_ref(task))
            .await
            .contains(&task.task_id)
    }

    /// Tasks with a worker here, plus tasks claimed by another live orchestrator.
    ///
    /// A claim naming this orchestrator without a handle is left over from a
    /// worker that is gone, so it does not count.
    async fn live_workers(&self, tasks: &[Task]) -> HashSet<Uuid> {
        let mut live = self.orchestrator.live_task_ids().await;
        let own = self.orchestrator.id();
        for task in tasks {
            if live.contains(&task.task_id) {
                continue;
            }
            let Some(claim) = self.store.worker_claim(&task.spec_id) else {
                continue;
            };
            if claim.orchestrator_id != own && claim.is_alive() {
                live.insert(task.task_id);
            }
        }
        live
    }

    async fn launch(&self, task: Task, start: StartMode) -> Result<StartedWorker> {
        let workspace = self.workspaces.ensure(&task.spec_id)?;
        let task = self.orchestrator.track(task).await;
        let layout = self.store.layout();
        let spec = SpawnSpec::new(&workspace.path)
            .with_env(ENV_TASK_ID, task.task_id.to_string())
            .with_env(ENV_SPEC_ID, task.spec_id.clone())
            .with_env(
                ENV_SPEC_DIR,
                layout.worktree_spec_dir(&task.spec_id).to_string_lossy(),
            )
            .with_env(ENV_PROJECT_ROOT, layout.root().to_string_lossy())
            .with_start(start);
        let spawn_id = self.orchestrator.spawn(task.task_id, spec).await?;
        Ok(StartedWorker {
            task_id: task.task_id,
            spec_id: task.spec_id,
            spawn_id,
            work_dir: workspace.path,
        })
    }
}

fn not_in_review(task: Task) -> RunnerError {
    RunnerError::NotInReview {
        spec_id: task.spec_id,
        status: task.status,
    }
}
