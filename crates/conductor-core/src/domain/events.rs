//! Sprint log events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{OverlapRegion, SessionId, TaskId, TaskStatus};

/// Something that happened during a sprint, recorded in the sprint log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SprintEvent {
    TaskTransitioned {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    SessionStarted {
        task_id: TaskId,
        session_id: SessionId,
        retry_count: u32,
    },
    SessionFailed {
        task_id: TaskId,
        session_id: SessionId,
        failure: String,
    },
    SessionClosed {
        task_id: TaskId,
        session_id: SessionId,
    },
    SpawnFailed {
        task_id: TaskId,
        attempt: u32,
        error: String,
    },
    MergeRecorded {
        artifact: String,
        task_id: TaskId,
        merged_with: Vec<TaskId>,
    },
    ConflictRaised {
        artifact: String,
        task_a: TaskId,
        task_b: TaskId,
        overlap_region: OverlapRegion,
    },
    ConflictResolved {
        artifact: String,
    },
}

/// A sprint event with the time it was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SprintEvent,
}

impl SprintEvent {
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            SprintEvent::TaskTransitioned { task_id, .. }
            | SprintEvent::SessionStarted { task_id, .. }
            | SprintEvent::SessionFailed { task_id, .. }
            | SprintEvent::SessionClosed { task_id, .. }
            | SprintEvent::SpawnFailed { task_id, .. }
            | SprintEvent::MergeRecorded { task_id, .. } => Some(task_id),
            SprintEvent::ConflictRaised { .. } | SprintEvent::ConflictResolved { .. } => None,
        }
    }
}
