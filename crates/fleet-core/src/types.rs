use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a task. Allowed moves live in [`crate::task_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Backlog,
    Queue,
    InProgress,
    AiReview,
    HumanReview,
    Done,
    PrCreated,
    Error,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Backlog,
        TaskStatus::Queue,
        TaskStatus::InProgress,
        TaskStatus::AiReview,
        TaskStatus::HumanReview,
        TaskStatus::Done,
        TaskStatus::PrCreated,
        TaskStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Queue => "queue",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::AiReview => "ai_review",
            TaskStatus::HumanReview => "human_review",
            TaskStatus::Done => "done",
            TaskStatus::PrCreated => "pr_created",
            TaskStatus::Error => "error",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status: {s}"))
    }
}

// ---------------------------------------------------------------------------
// ReviewReason
// ---------------------------------------------------------------------------

/// Why a task landed in a review (or error) state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    Completed,
    Errors,
    QaRejected,
    PlanReview,
    Stopped,
    RateLimited,
}

impl ReviewReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewReason::Completed => "completed",
            ReviewReason::Errors => "errors",
            ReviewReason::QaRejected => "qa_rejected",
            ReviewReason::PlanReview => "plan_review",
            ReviewReason::Stopped => "stopped",
            ReviewReason::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for ReviewReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskCategory / TaskPriority / TaskComplexity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    #[default]
    Feature,
    BugFix,
    Refactoring,
    Documentation,
    Security,
    Performance,
    Infrastructure,
    Testing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Trivial,
    Small,
    #[default]
    Medium,
    Large,
    Complex,
}

// ---------------------------------------------------------------------------
// TaskMetadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: TaskCategory,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub complexity: TaskComplexity,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Soft, reversible archival marker.
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    /// Link to an integration artifact such as a pull request.
    #[serde(default)]
    pub pr_url: Option<String>,
    /// Origin of the task (e.g. `idea:42`), used to refuse duplicate conversions.
    #[serde(default)]
    pub source_ref: Option<String>,
    /// Branch the task's workspace was forked from.
    #[serde(default)]
    pub base_branch: Option<String>,
}

// ---------------------------------------------------------------------------
// Subtasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    #[default]
    Pending,
    InProgress,
    #[serde(alias = "complete", alias = "done")]
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub title: String,
    pub status: SubtaskStatus,
}

/// Percentage of subtasks in `Completed`; zero when there are none.
pub fn completion_percent<'a>(statuses: impl IntoIterator<Item = &'a SubtaskStatus>) -> u8 {
    let mut total = 0u32;
    let mut completed = 0u32;
    for status in statuses {
        total += 1;
        if *status == SubtaskStatus::Completed {
            completed += 1;
        }
    }
    if total == 0 {
        0
    } else {
        ((completed * 100) / total) as u8
    }
}

// ---------------------------------------------------------------------------
// ExecutionPhase / ExecutionProgress
// ---------------------------------------------------------------------------

/// Phase a worker reports while executing a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    #[default]
    Idle,
    Planning,
    Coding,
    QaReview,
    QaFixing,
    Complete,
    Failed,
}

impl ExecutionPhase {
    /// Overall-progress band `(start, end)` covered by this phase.
    pub fn overall_band(&self) -> (u8, u8) {
        match self {
            ExecutionPhase::Idle => (0, 0),
            ExecutionPhase::Planning => (0, 20),
            ExecutionPhase::Coding => (20, 80),
            ExecutionPhase::QaReview => (80, 95),
            ExecutionPhase::QaFixing => (80, 95),
            ExecutionPhase::Complete => (100, 100),
            ExecutionPhase::Failed => (0, 0),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "idle" => Some(ExecutionPhase::Idle),
            "planning" | "plan" => Some(ExecutionPhase::Planning),
            "coding" | "code" | "implementation" => Some(ExecutionPhase::Coding),
            "qa_review" | "qa" | "review" => Some(ExecutionPhase::QaReview),
            "qa_fixing" | "fixing" | "fix" => Some(ExecutionPhase::QaFixing),
            "complete" | "completed" | "done" => Some(ExecutionPhase::Complete),
            "failed" | "error" => Some(ExecutionPhase::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExecutionPhase::Idle => "idle",
            ExecutionPhase::Planning => "planning",
            ExecutionPhase::Coding => "coding",
            ExecutionPhase::QaReview => "qa_review",
            ExecutionPhase::QaFixing => "qa_fixing",
            ExecutionPhase::Complete => "complete",
            ExecutionPhase::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub phase: ExecutionPhase,
    pub phase_percent: u8,
    pub overall_percent: u8,
    #[serde(default)]
    pub current_subtask: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    /// Name of the task's spec directory, e.g. `004-add-login`.
    pub spec_id: String,
    pub project_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub review_reason: Option<ReviewReason>,
    pub metadata: TaskMetadata,
    pub subtasks: Vec<Subtask>,
    pub execution_progress: ExecutionProgress,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        spec_id: impl Into<String>,
        project_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            spec_id: spec_id.into(),
            project_id: project_id.into(),
            title: title.into(),
            status: TaskStatus::Backlog,
            review_reason: None,
            metadata: TaskMetadata::default(),
            subtasks: Vec::new(),
            execution_progress: ExecutionProgress::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.metadata.archived_at.is_some()
    }

    pub fn subtask_completion_percent(&self) -> u8 {
        completion_percent(self.subtasks.iter().map(|s| &s.status))
    }
}
