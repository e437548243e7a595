//! Per-task JSON records and their dual-copy reconciliation.
//!
//! Every task has a status record (`implementation_plan.json`) in the main
//! spec directory and, once a workspace exists, a second copy inside the
//! worktree. The worker updates the worktree copy while it runs, so that copy
//! wins whenever it is readable.
//!
//! Writes go to a temp file in the target directory followed by a rename, so
//! readers in other processes never observe a half-written record.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::spec_lock::pid_alive;
use crate::types::{
    completion_percent, ExecutionProgress, ReviewReason, Subtask, SubtaskStatus, Task,
    TaskMetadata, TaskStatus,
};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("record io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed record at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, RecordError>;

// ---------------------------------------------------------------------------
// Status record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_reason: Option<ReviewReason>,
    #[serde(default)]
    pub phases: Vec<PlanPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_progress: Option<ExecutionProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanPhase {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub subtasks: Vec<PlanSubtask>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanSubtask {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: SubtaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
}

impl StatusRecord {
    pub fn subtasks(&self) -> impl Iterator<Item = &PlanSubtask> {
        self.phases.iter().flat_map(|p| p.subtasks.iter())
    }

    pub fn completion_percent(&self) -> u8 {
        completion_percent(self.subtasks().map(|s| &s.status))
    }

    pub fn to_subtasks(&self) -> Vec<Subtask> {
        self.subtasks()
            .map(|s| Subtask {
                id: s.id.clone(),
                title: s.description.clone(),
                status: s.status,
            })
            .collect()
    }

    /// Copy orchestrator-owned fields from `task`; phases stay as the worker wrote them.
    pub fn apply_task_state(&mut self, task: &Task) {
        self.feature = Some(task.title.clone());
        self.status = task.status;
        self.review_reason = task.review_reason;
        self.execution_progress = Some(task.execution_progress.clone());
        self.updated_at = Some(task.updated_at);
    }
}

// ---------------------------------------------------------------------------
// Metadata record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub task_id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub metadata: TaskMetadata,
}

impl MetadataRecord {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.task_id,
            title: task.title.clone(),
            created_at: task.created_at,
            metadata: task.metadata.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker claim
// ---------------------------------------------------------------------------

/// Written next to the main status record while an orchestrator has a live
/// worker for the task, so other processes can tell a running task from a
/// stuck one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerClaim {
    pub orchestrator_id: Uuid,
    pub owner_pid: u32,
    pub spawn_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

impl WorkerClaim {
    /// The owning process and (when known) the worker are both running.
    pub fn is_alive(&self) -> bool {
        pid_alive(self.owner_pid) && self.worker_pid.is_none_or(pid_alive)
    }

    pub fn is_spawn(&self, orchestrator_id: Uuid, spawn_id: u64) -> bool {
        self.orchestrator_id == orchestrator_id && self.spawn_id == spawn_id
    }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    Workspace,
    Main,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledRecord {
    pub record: StatusRecord,
    pub source: RecordSource,
}

/// Two-source precedence: the workspace copy wins whenever it is present.
pub fn reconcile(
    main: Option<StatusRecord>,
    workspace: Option<StatusRecord>,
) -> Option<ReconciledRecord> {
    match (workspace, main) {
        (Some(record), _) => Some(ReconciledRecord {
            record,
            source: RecordSource::Workspace,
        }),
        (None, Some(record)) => Some(ReconciledRecord {
            record,
            source: RecordSource::Main,
        }),
        (None, None) => None,
    }
}

/// Read both copies leniently and reconcile them.
pub fn load_reconciled(main_path: &Path, workspace_path: &Path) -> Option<ReconciledRecord> {
    reconcile(read_json_lenient(main_path), read_json_lenient(workspace_path))
}

// ---------------------------------------------------------------------------
// File IO
// ---------------------------------------------------------------------------

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let io_err = |source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let json = serde_json::to_vec_pretty(value).map_err(|source| RecordError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "record".into());
    let tmp = dir.join(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        Uuid::new_v4().simple()
    ));

    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    };
    if let Err(e) = write() {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(e));
    }
    Ok(())
}

/// `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(RecordError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| RecordError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Like [`read_json`] but treats unreadable or malformed files as absent.
pub fn read_json_lenient<T: DeserializeOwned>(path: &Path) -> Option<T> {
    match read_json(path) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: TaskStatus, subtasks: &[SubtaskStatus]) -> StatusRecord {
        StatusRecord {
            status,
            phases: vec![PlanPhase {
                name: "impl".into(),
                subtasks: subtasks
                    .iter()
                    .enumerate()
                    .map(|(i, s)| PlanSubtask {
                        id: format!("1.{i}"),
                        status: *s,
                        ..Default::default()
                    })
                    .collect(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn worker_claim_liveness_follows_owner_and_worker() {
        let claim = WorkerClaim {
            orchestrator_id: Uuid::new_v4(),
            owner_pid: std::process::id(),
            spawn_id: 3,
            worker_pid: None,
            started_at: Utc::now(),
        };
        assert!(claim.is_alive());
        assert!(claim.is_spawn(claim.orchestrator_id, 3));
        assert!(!claim.is_spawn(Uuid::new_v4(), 3));

        let dead_worker = WorkerClaim {
            worker_pid: Some(4_000_000),
            ..claim.clone()
        };
        assert!(!dead_worker.is_alive());
        let dead_owner = WorkerClaim {
            owner_pid: 4_000_000,
            ..claim
        };
        assert!(!dead_owner.is_alive());
    }

    #[test]
    fn reconcile_prefers_workspace() {
        let main = record(TaskStatus::Backlog, &[]);
        let ws = record(TaskStatus::InProgress, &[SubtaskStatus::Completed]);

        let r = reconcile(Some(main.clone()), Some(ws.clone())).unwrap();
        assert_eq!(r.source, RecordSource::Workspace);
        assert_eq!(r.record, ws);

        let r = reconcile(Some(main.clone()), None).unwrap();
        assert_eq!(r.source, RecordSource::Main);
        assert_eq!(r.record, main);

        assert!(reconcile(None, None).is_none());
    }

    #[test]
    fn completion_over_all_phases() {
        let mut rec = record(
            TaskStatus::InProgress,
            &[SubtaskStatus::Completed, SubtaskStatus::Pending],
        );
        rec.phases.push(PlanPhase {
            name: "qa".into(),
            subtasks: vec![PlanSubtask {
                status: SubtaskStatus::Completed,
                ..Default::default()
            }],
        });
        assert_eq!(rec.completion_percent(), 66);
        assert_eq!(rec.to_subtasks().len(), 3);
    }

    #[test]
    fn parses_worker_written_record() {
        let json = r#"{
            "feature": "Login",
            "status": "in_progress",
            "phases": [{
                "name": "Implementation",
                "subtasks": [
                    {"id": "1", "description": "a", "status": "completed",
                     "input_tokens": 1200, "output_tokens": 300, "total_cost_usd": 0.04},
                    {"id": "2", "description": "b", "status": "in_progress"}
                ]
            }],
            "extra_field": true
        }"#;
        let rec: StatusRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.status, TaskStatus::InProgress);
        assert_eq!(rec.completion_percent(), 50);
        let first = rec.subtasks().next().unwrap();
        assert_eq!(first.input_tokens, Some(1200));
    }

    #[test]
    fn atomic_write_then_read() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("implementation_plan.json");
        let rec = record(TaskStatus::AiReview, &[SubtaskStatus::Completed]);
        write_json_atomic(&path, &rec).unwrap();

        let back: StatusRecord = read_json(&path).unwrap().unwrap();
        assert_eq!(back, rec);

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_and_malformed_reads() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("none.json");
        assert!(read_json::<StatusRecord>(&missing).unwrap().is_none());

        let bad = tmp.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(
            read_json::<StatusRecord>(&bad),
            Err(RecordError::Parse { .. })
        ));
        assert!(read_json_lenient::<StatusRecord>(&bad).is_none());
    }

    #[test]
    fn load_reconciled_skips_malformed_workspace_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let main = tmp.path().join("main.json");
        let ws = tmp.path().join("ws.json");
        write_json_atomic(&main, &record(TaskStatus::Queue, &[])).unwrap();
        std::fs::write(&ws, "garbage").unwrap();

        let r = load_reconciled(&main, &ws).unwrap();
        assert_eq!(r.source, RecordSource::Main);
        assert_eq!(r.record.status, TaskStatus::Queue);
    }

    #[test]
    fn apply_task_state_keeps_phases() {
        let mut rec = record(TaskStatus::Backlog, &[SubtaskStatus::Pending]);
        let mut task = Task::new("001-a", "p", "A");
        task.status = TaskStatus::InProgress;
        rec.apply_task_state(&task);
        assert_eq!(rec.status, TaskStatus::InProgress);
        assert_eq!(rec.phases.len(), 1);
        assert_eq!(rec.feature.as_deref(), Some("A"));
    }
}
