use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{CompletionNotes, TaskId, TaskStatus};

/// Capability tag of a worker role ("database", "api", "ui", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleTag(String);

impl RoleTag {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoleTag {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RoleTag {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RoleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One unit of work in a sprint.
///
/// Status-conditional fields:
/// - `completed_at` + `completion_notes` are present iff status is `completed`
/// - `deferred_reason` is present iff status is `deferred`
///
/// `revision` is bumped by the store on every write and is used for the
/// optimistic read-modify-write check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub phase: String,
    pub assigned_role: RoleTag,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<TaskId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_effort: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_notes: Option<CompletionNotes>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred_reason: Option<String>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub revision: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl Task {
    /// A pending task with no dependencies.
    pub fn new(
        id: impl Into<TaskId>,
        name: impl Into<String>,
        phase: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: TaskStatus::Pending,
            phase: phase.into(),
            assigned_role: RoleTag::new(role),
            dependencies: Vec::new(),
            estimated_effort: None,
            description: None,
            completed_at: None,
            completion_notes: None,
            deferred_reason: None,
            revision: 0,
        }
    }

    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_effort(mut self, effort: f64) -> Self {
        self.estimated_effort = Some(effort);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Effort used for critical-path and timeout computation.
    pub fn effort_or(&self, default_effort: f64) -> f64 {
        self.estimated_effort.unwrap_or(default_effort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_roundtrips_camel_case() {
        let task = Task::new("T2", "API layer", "build", "api")
            .depends_on("T1")
            .with_effort(3.0);
        let yaml = serde_yaml::to_string(&task).unwrap();
        assert!(yaml.contains("assignedRole: api"));
        assert!(yaml.contains("estimatedEffort: 3.0"));
        assert!(!yaml.contains("revision"));

        let back: Task = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn effort_falls_back_to_default() {
        let task = Task::new("T1", "x", "p", "r");
        assert_eq!(task.effort_or(1.0), 1.0);
        assert_eq!(task.with_effort(5.0).effort_or(1.0), 5.0);
    }
}
