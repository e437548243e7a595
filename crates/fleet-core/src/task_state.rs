use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ReviewReason, Task, TaskStatus};

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

impl TaskStatus {
    /// Destinations reachable from this status in one step.
    pub fn allowed_targets(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Backlog => &[Queue],
            Queue => &[InProgress, Backlog],
            InProgress => &[AiReview, HumanReview, Error, Backlog],
            AiReview => &[InProgress, Done, HumanReview, Error],
            HumanReview => &[InProgress, Done, Backlog],
            Done => &[Backlog],
            PrCreated => &[Done],
            Error => &[InProgress, HumanReview, Backlog],
        }
    }

    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Board column this status is displayed in.
    ///
    /// `pr_created` shows under `done` and `error` under `human_review`; the
    /// statuses themselves stay distinct everywhere else.
    pub fn board_column(&self) -> TaskStatus {
        match self {
            TaskStatus::PrCreated => TaskStatus::Done,
            TaskStatus::Error => TaskStatus::HumanReview,
            other => *other,
        }
    }

    /// Work on the task is finished for monitoring purposes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::PrCreated)
    }

    /// Statuses that imply a live worker.
    pub fn expects_worker(&self) -> bool {
        matches!(self, TaskStatus::InProgress)
    }

    /// Shortest sequence of legal steps to `target`, excluding `self`.
    ///
    /// Empty when already there; `None` when the table has no route.
    pub fn path_to(&self, target: TaskStatus) -> Option<Vec<TaskStatus>> {
        let mut previous: Vec<(TaskStatus, TaskStatus)> = Vec::new();
        let mut frontier = VecDeque::from([*self]);
        let mut seen = vec![*self];
        while let Some(current) = frontier.pop_front() {
            if current == target {
                let mut path = Vec::new();
                let mut step = current;
                while step != *self {
                    path.push(step);
                    step = previous.iter().find(|(to, _)| *to == step).map(|(_, from)| *from)?;
                }
                path.reverse();
                return Some(path);
            }
            for next in current.allowed_targets() {
                if !seen.contains(next) {
                    seen.push(*next);
                    previous.push((*next, current));
                    frontier.push_back(*next);
                }
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("invalid transition for task {spec_id}: {from} -> {to}")]
    Invalid {
        spec_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

// ---------------------------------------------------------------------------
// TransitionRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub reason: Option<ReviewReason>,
    pub forced: bool,
    pub at: DateTime<Utc>,
}

impl Task {
    /// Move the task along an edge of the transition table.
    ///
    /// A rejected transition leaves the task untouched.
    pub fn transition(
        &mut self,
        to: TaskStatus,
        reason: Option<ReviewReason>,
    ) -> Result<TransitionRecord, TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError::Invalid {
                spec_id: self.spec_id.clone(),
                from: self.status,
                to,
            });
        }
        Ok(self.apply_status(to, reason, false))
    }

    /// Set the status without consulting the table.
    ///
    /// Stuck-task recovery uses this after a fresh worker has been spawned
    /// for a task whose status already claims one is running.
    pub fn force_status(&mut self, to: TaskStatus, reason: Option<ReviewReason>) -> TransitionRecord {
        self.apply_status(to, reason, true)
    }

    /// Attach a pull request and move to `pr_created`.
    ///
    /// The table has no edge into `pr_created`, so the status is forced, but
    /// only from a task that has been reviewed or finished.
    pub fn record_pull_request(&mut self, url: impl Into<String>) -> Result<TransitionRecord, TransitionError> {
        use TaskStatus::*;
        if !matches!(self.status, AiReview | HumanReview | Done | PrCreated) {
            return Err(TransitionError::Invalid {
                spec_id: self.spec_id.clone(),
                from: self.status,
                to: PrCreated,
            });
        }
        self.metadata.pr_url = Some(url.into());
        Ok(self.apply_status(PrCreated, None, true))
    }

    fn apply_status(
        &mut self,
        to: TaskStatus,
        reason: Option<ReviewReason>,
        forced: bool,
    ) -> TransitionRecord {
        let from = self.status;
        let now = Utc::now();
        self.status = to;
        self.review_reason = match to {
            TaskStatus::AiReview | TaskStatus::HumanReview | TaskStatus::Error => reason,
            _ => None,
        };
        self.updated_at = now;
        tracing::debug!(
            spec_id = %self.spec_id,
            task_id = %self.task_id,
            %from,
            %to,
            forced,
            "task status transition"
        );
        TransitionRecord {
            from,
            to,
            reason: self.review_reason,
            forced,
            at: now,
        }
    }
}
