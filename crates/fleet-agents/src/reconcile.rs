//! Stuck-task detection.
//!
//! A task is stuck when its status claims a worker is running but the
//! orchestrator holds no live handle for it, typically after a crash of the
//! orchestrator process or a worker that died without an exit event.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use fleet_core::types::{Task, TaskStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckTask {
    pub task_id: Uuid,
    pub spec_id: String,
    pub status: TaskStatus,
    /// Last time the task record changed.
    pub since: DateTime<Utc>,
}

/// Result of a single reconciliation sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub stuck: Vec<StuckTask>,
    pub timestamp: DateTime<Utc>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.stuck.is_empty()
    }
}

pub fn is_stuck(task: &Task, live: &HashSet<Uuid>) -> bool {
    task.status.expects_worker() && !task.is_archived() && !live.contains(&task.task_id)
}

pub fn find_stuck<'a>(tasks: impl IntoIterator<Item = &'a Task>, live: &HashSet<Uuid>) -> Vec<&'a Task> {
    tasks.into_iter().filter(|t| is_stuck(t, live)).collect()
}

pub fn reconcile(tasks: &[Task], live: &HashSet<Uuid>, now: DateTime<Utc>) -> ReconcileReport {
    let stuck = find_stuck(tasks, live)
        .into_iter()
        .map(|t| StuckTask {
            task_id: t.task_id,
            spec_id: t.spec_id.clone(),
            status: t.status,
            since: t.updated_at,
        })
        .collect();
    ReconcileReport {
        checked: tasks.len(),
        stuck,
        timestamp: now,
    }
}
