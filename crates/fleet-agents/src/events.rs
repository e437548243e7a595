use chrono::{DateTime, Utc};
use fleet_core::types::{ExecutionPhase, ReviewReason, TaskStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Everything the orchestrator reports to its subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    Progress {
        task_id: Uuid,
        phase: ExecutionPhase,
        percent: u8,
        message: Option<String>,
    },
    Log {
        task_id: Uuid,
        text: String,
    },
    StatusChange {
        task_id: Uuid,
        status: TaskStatus,
        reason: Option<ReviewReason>,
    },
    RateLimited {
        task_id: Uuid,
        profile_id: Option<Uuid>,
        reset_at: DateTime<Utc>,
        suggested_profile_id: Option<Uuid>,
    },
    Exit {
        task_id: Uuid,
        code: i32,
    },
}

impl OrchestratorEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            OrchestratorEvent::Progress { task_id, .. }
            | OrchestratorEvent::Log { task_id, .. }
            | OrchestratorEvent::StatusChange { task_id, .. }
            | OrchestratorEvent::RateLimited { task_id, .. }
            | OrchestratorEvent::Exit { task_id, .. } => *task_id,
        }
    }

    /// Short label used in log lines and the CLI event stream.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorEvent::Progress { .. } => "progress",
            OrchestratorEvent::Log { .. } => "log",
            OrchestratorEvent::StatusChange { .. } => "status_change",
            OrchestratorEvent::RateLimited { .. } => "rate_limited",
            OrchestratorEvent::Exit { .. } => "exit",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(OrchestratorEvent::Exit { task_id: id, code: 2 }).unwrap();
        assert_eq!(json["type"], "exit");
        assert_eq!(json["code"], 2);

        let json = serde_json::to_value(OrchestratorEvent::StatusChange {
            task_id: id,
            status: TaskStatus::HumanReview,
            reason: Some(ReviewReason::RateLimited),
        })
        .unwrap();
        assert_eq!(json["type"], "status_change");
        assert_eq!(json["status"], "human_review");
        assert_eq!(json["reason"], "rate_limited");
    }

    #[test]
    fn task_id_and_kind() {
        let id = Uuid::new_v4();
        let ev = OrchestratorEvent::Log {
            task_id: id,
            text: "hello".into(),
        };
        assert_eq!(ev.task_id(), id);
        assert_eq!(ev.kind(), "log");
    }
}
