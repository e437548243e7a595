//! Tasks persisted under a project root.
//!
//! The main spec directory decides which tasks exist. A task's status comes
//! from reconciling the main and workspace status records; writes go to both
//! copies so the workspace copy (which readers prefer) never lags behind.

use std::path::PathBuf;

use chrono::Utc;
use uuid::Uuid;

use crate::config::Config;
use crate::layout::{slugify, ProjectLayout};
use crate::records::{self, MetadataRecord, RecordError, StatusRecord, WorkerClaim};
use crate::spec_lock::{SpecLockConfig, SpecLockError, SpecNumberCoordinator};
use crate::task_state::{TransitionError, TransitionRecord};
use crate::types::{ReviewReason, Task, TaskCategory, TaskComplexity, TaskPriority, TaskStatus};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("source {source_ref} was already converted to task {spec_id}")]
    DuplicateSource { source_ref: String, spec_id: String },
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Lock(#[from] SpecLockError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TaskStoreError>;

// ---------------------------------------------------------------------------
// TaskPersistence
// ---------------------------------------------------------------------------

/// Where the orchestrator writes task state.
pub trait TaskPersistence: Send + Sync {
    /// Status changes. Both record copies are updated.
    fn persist(&self, task: &Task) -> Result<()>;

    /// Progress between status changes. Must leave the status alone.
    fn persist_progress(&self, task: &Task) -> Result<()> {
        self.persist(task)
    }

    /// A worker was started for `spec_id`.
    fn claim_worker(&self, _spec_id: &str, _claim: &WorkerClaim) -> Result<()> {
        Ok(())
    }

    /// The worker from `spawn_id` is gone; drop its claim if it still holds one.
    fn release_worker(&self, _spec_id: &str, _orchestrator_id: Uuid, _spawn_id: u64) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NewTask
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub category: TaskCategory,
    pub priority: TaskPriority,
    pub complexity: TaskComplexity,
    pub tags: Vec<String>,
    /// Origin marker; a second task with the same marker is refused.
    pub source_ref: Option<String>,
    pub base_branch: Option<String>,
}

impl NewTask {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TaskStore {
    layout: ProjectLayout,
    numbering: SpecNumberCoordinator,
}

impl TaskStore {
    pub fn new(layout: ProjectLayout, lock_config: SpecLockConfig) -> Self {
        let numbering = SpecNumberCoordinator::new(layout.clone(), lock_config);
        Self { layout, numbering }
    }

    pub fn from_config(root: impl Into<PathBuf>, config: &Config) -> Self {
        Self::new(
            ProjectLayout::with_data_dir(root, config.layout.data_dir.clone()),
            SpecLockConfig::from(&config.spec_lock),
        )
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn numbering(&self) -> &SpecNumberCoordinator {
        &self.numbering
    }

    pub fn known_spec_ids(&self) -> Result<Vec<String>> {
        Ok(self.layout.spec_ids()?)
    }

    /// Every task in the project, archived ones included. Unloadable
    /// spec directories are skipped with a warning.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for spec_id in self.known_spec_ids()? {
            match self.load_task(&spec_id) {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!(spec_id = %spec_id, error = %e, "skipping unreadable task"),
            }
        }
        Ok(tasks)
    }

    pub fn list_active(&self) -> Result<Vec<Task>> {
        Ok(self
            .list_tasks()?
            .into_iter()
            .filter(|t| !t.is_archived())
            .collect())
    }

    pub fn load_task(&self, spec_id: &str) -> Result<Task> {
        if !self.layout.spec_dir(spec_id).is_dir() {
            return Err(TaskStoreError::NotFound(spec_id.to_string()));
        }

        let metadata = match records::read_json::<MetadataRecord>(&self.layout.metadata_path(spec_id))? {
            Some(m) => m,
            None => {
                // Spec written by another tool; give it an identity once.
                let task = Task::new(spec_id, self.layout.project_id(), spec_id);
                let record = MetadataRecord::from_task(&task);
                records::write_json_atomic(&self.layout.metadata_path(spec_id), &record)?;
                tracing::info!(spec_id = %spec_id, task_id = %task.task_id, "created missing task metadata");
                record
            }
        };

        let reconciled = records::load_reconciled(
            &self.layout.status_record_path(spec_id),
            &self.layout.worktree_status_record_path(spec_id),
        );
        let record = reconciled.map(|r| r.record).unwrap_or_default();

        Ok(Task {
            task_id: metadata.task_id,
            spec_id: spec_id.to_string(),
            project_id: self.layout.project_id(),
            title: metadata.title,
            status: record.status,
            review_reason: record.review_reason,
            subtasks: record.to_subtasks(),
            execution_progress: record.execution_progress.clone().unwrap_or_default(),
            created_at: metadata.created_at,
            updated_at: record.updated_at.unwrap_or(metadata.created_at),
            metadata: metadata.metadata,
        })
    }

    pub fn find_task(&self, task_id: Uuid) -> Result<Task> {
        self.list_tasks()?
            .into_iter()
            .find(|t| t.task_id == task_id)
            .ok_or_else(|| TaskStoreError::NotFound(task_id.to_string()))
    }

    /// Look up by spec id, bare spec number (`4` or `004`), or task uuid.
    pub fn resolve(&self, key: &str) -> Result<Task> {
        if self.layout.spec_dir(key).is_dir() {
            return self.load_task(key);
        }
        if let Ok(id) = key.parse::<Uuid>() {
            return self.find_task(id);
        }
        if let Ok(number) = key.parse::<u32>() {
            let hit = self
                .known_spec_ids()?
                .into_iter()
                .find(|s| crate::layout::parse_spec_number(s) == Some(number));
            if let Some(spec_id) = hit {
                return self.load_task(&spec_id);
            }
        }
        Err(TaskStoreError::NotFound(key.to_string()))
    }

    /// Allocate a spec number and write the new task's records.
    ///
    /// The duplicate-source check and the allocation happen under the spec
    /// lock, so two callers converting the same source cannot both succeed.
    pub fn create_task(&self, new: NewTask) -> Result<Task> {
        self.numbering.with_lock(|numbering| -> Result<Task> {
            if let Some(source_ref) = &new.source_ref {
                if let Some(spec_id) = self.find_by_source(source_ref)? {
                    return Err(TaskStoreError::DuplicateSource {
                        source_ref: source_ref.clone(),
                        spec_id,
                    });
                }
            }

            let mut slug = slugify(&new.title);
            if slug.is_empty() {
                slug = "task".into();
            }
            let (_, spec_id) = numbering.create_spec_dir(&slug)?;

            let mut task = Task::new(spec_id, self.layout.project_id(), new.title);
            task.metadata.description = new.description;
            task.metadata.category = new.category;
            task.metadata.priority = new.priority;
            task.metadata.complexity = new.complexity;
            task.metadata.tags = new.tags;
            task.metadata.source_ref = new.source_ref;
            task.metadata.base_branch = new.base_branch;

            self.save_task(&task)?;
            tracing::info!(spec_id = %task.spec_id, task_id = %task.task_id, "task created");
            Ok(task)
        })
    }

    fn find_by_source(&self, source_ref: &str) -> Result<Option<String>> {
        for spec_id in self.known_spec_ids()? {
            let meta: Option<MetadataRecord> =
                records::read_json_lenient(&self.layout.metadata_path(&spec_id));
            if meta.and_then(|m| m.metadata.source_ref).as_deref() == Some(source_ref) {
                return Ok(Some(spec_id));
            }
        }
        Ok(None)
    }

    /// Write metadata and status to the main copy and, if present, the workspace copy.
    pub fn save_task(&self, task: &Task) -> Result<()> {
        let metadata = MetadataRecord::from_task(task);
        for dir in self.record_dirs(&task.spec_id) {
            records::write_json_atomic(&dir.join(crate::layout::METADATA_FILE), &metadata)?;
        }
        self.persist_status(task)
    }

    /// Update the status records in place, keeping the worker-owned phases.
    pub fn persist_status(&self, task: &Task) -> Result<()> {
        for dir in self.record_dirs(&task.spec_id) {
            let path = dir.join(crate::layout::STATUS_RECORD_FILE);
            let mut record: StatusRecord = records::read_json_lenient(&path).unwrap_or_default();
            record.apply_task_state(task);
            records::write_json_atomic(&path, &record)?;
        }
        Ok(())
    }

    /// Apply one legal transition and write the status to both copies.
    ///
    /// A rejected transition leaves both the task and the records untouched.
    pub fn apply_transition(
        &self,
        task: &mut Task,
        to: TaskStatus,
        reason: Option<ReviewReason>,
    ) -> Result<TransitionRecord> {
        let record = task.transition(to, reason)?;
        self.persist_status(task)?;
        tracing::info!(spec_id = %task.spec_id, from = %record.from, to = %record.to, "task status updated");
        Ok(record)
    }

    /// Mark a task `done` after its workspace was merged. Tasks with no edge
    /// to `done` are left alone.
    pub fn complete_merged(&self, key: &str) -> Result<Option<Task>> {
        let mut task = self.resolve(key)?;
        if !task.status.can_transition_to(TaskStatus::Done) {
            return Ok(None);
        }
        self.apply_transition(&mut task, TaskStatus::Done, None)?;
        Ok(Some(task))
    }

    /// Write only the execution progress into the main status record.
    ///
    /// The worktree copy belongs to the worker between status changes.
    pub fn persist_progress(&self, task: &Task) -> Result<()> {
        let path = self.layout.status_record_path(&task.spec_id);
        let mut record: StatusRecord = records::read_json_lenient(&path).unwrap_or_default();
        record.execution_progress = Some(task.execution_progress.clone());
        record.updated_at = Some(task.updated_at);
        records::write_json_atomic(&path, &record)?;
        Ok(())
    }

    /// The live-worker claim for a task, if one is on disk.
    pub fn worker_claim(&self, spec_id: &str) -> Option<WorkerClaim> {
        records::read_json_lenient(&self.layout.worker_claim_path(spec_id))
    }

    /// Record a pull request for a reviewed or finished task.
    pub fn record_pull_request(&self, key: &str, url: &str) -> Result<Task> {
        let mut task = self.resolve(key)?;
        task.record_pull_request(url)?;
        self.save_task(&task)?;
        tracing::info!(spec_id = %task.spec_id, pr_url = %url, "pull request recorded");
        Ok(task)
    }

    fn record_dirs(&self, spec_id: &str) -> Vec<PathBuf> {
        let mut dirs = vec![self.layout.spec_dir(spec_id)];
        if self.layout.worktree_path(spec_id).is_dir() {
            dirs.push(self.layout.worktree_spec_dir(spec_id));
        }
        dirs
    }

    pub fn archive(&self, spec_id: &str) -> Result<Task> {
        let mut task = self.load_task(spec_id)?;
        if task.metadata.archived_at.is_none() {
            task.metadata.archived_at = Some(Utc::now());
            self.save_task(&task)?;
            tracing::info!(spec_id = %spec_id, "task archived");
        }
        Ok(task)
    }

    pub fn unarchive(&self, spec_id: &str) -> Result<Task> {
        let mut task = self.load_task(spec_id)?;
        if task.metadata.archived_at.take().is_some() {
            self.save_task(&task)?;
            tracing::info!(spec_id = %spec_id, "task unarchived");
        }
        Ok(task)
    }

    /// Remove the main spec directory. The workspace is the engine's to discard.
    pub fn delete_task(&self, spec_id: &str) -> Result<()> {
        let dir = self.layout.spec_dir(spec_id);
        if !dir.is_dir() {
            return Err(TaskStoreError::NotFound(spec_id.to_string()));
        }
        std::fs::remove_dir_all(&dir)?;
        tracing::info!(spec_id = %spec_id, "task deleted");
        Ok(())
    }
}

impl TaskPersistence for TaskStore {
    fn persist(&self, task: &Task) -> Result<()> {
        self.persist_status(task)
    }

    fn persist_progress(&self, task: &Task) -> Result<()> {
        TaskStore::persist_progress(self, task)
    }

    fn claim_worker(&self, spec_id: &str, claim: &WorkerClaim) -> Result<()> {
        records::write_json_atomic(&self.layout.worker_claim_path(spec_id), claim)?;
        Ok(())
    }

    fn release_worker(&self, spec_id: &str, orchestrator_id: Uuid, spawn_id: u64) -> Result<()> {
        let path = self.layout.worker_claim_path(spec_id);
        match self.worker_claim(spec_id) {
            Some(claim) if claim.is_spawn(orchestrator_id, spawn_id) => match std::fs::remove_file(&path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }
}
