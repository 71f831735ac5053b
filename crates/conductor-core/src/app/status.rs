//! Status views: where the sprint stands and why tasks are not moving.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::domain::{
    ConflictError, LoggedEvent, ProgressEntry, SprintEvent, Task, TaskId, TaskStatus, WorkSession,
};
use crate::graph::{CriticalPath, DependencyGraph, TieBreak};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SprintCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub deferred: usize,
}

impl SprintCounts {
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Deferred => counts.deferred += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.deferred
    }

    /// Every task is completed or deferred.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

/// A pending task waiting on dependencies that are not completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedTask {
    pub task_id: TaskId,
    pub blocked_by: Vec<Blocker>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blocker {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredTask {
    pub task_id: TaskId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SprintStatus {
    pub sprint: String,
    pub counts: SprintCounts,
    pub ready: Vec<TaskId>,
    pub critical_path: CriticalPath,
    pub blocked: Vec<BlockedTask>,
    pub deferred: Vec<DeferredTask>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_sessions: Vec<WorkSession>,
    /// Latest progress entry of every task in progress that reported one.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub latest_progress: BTreeMap<TaskId, ProgressEntry>,
    pub unresolved_conflicts: Vec<ConflictError>,
}

impl SprintStatus {
    pub fn collect(
        sprint: impl Into<String>,
        tasks: &[Task],
        graph: &DependencyGraph,
        default_effort: f64,
        tie_break: TieBreak,
    ) -> Self {
        let statuses: HashMap<TaskId, TaskStatus> =
            tasks.iter().map(|t| (t.id.clone(), t.status)).collect();

        let blocked = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter_map(|t| {
                let blockers = graph.blocked_by(&t.id, &statuses);
                (!blockers.is_empty()).then(|| BlockedTask {
                    task_id: t.id.clone(),
                    blocked_by: blockers
                        .into_iter()
                        .map(|(task_id, status)| Blocker { task_id, status })
                        .collect(),
                })
            })
            .collect();

        let deferred = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Deferred)
            .map(|t| DeferredTask {
                task_id: t.id.clone(),
                reason: t.deferred_reason.clone().unwrap_or_default(),
            })
            .collect();

        Self {
            sprint: sprint.into(),
            counts: SprintCounts::from_tasks(tasks),
            ready: graph.ready_set(&statuses),
            critical_path: graph.remaining_critical_path(&statuses, default_effort, tie_break),
            blocked,
            deferred,
            active_sessions: Vec::new(),
            latest_progress: BTreeMap::new(),
            unresolved_conflicts: Vec::new(),
        }
    }

    pub fn with_sessions(mut self, sessions: Vec<WorkSession>) -> Self {
        self.active_sessions = sessions;
        self
    }

    pub fn with_progress(mut self, entry: ProgressEntry) -> Self {
        self.latest_progress.insert(entry.task_id.clone(), entry);
        self
    }

    pub fn with_conflicts(mut self, conflicts: Vec<ConflictError>) -> Self {
        self.unresolved_conflicts = conflicts;
        self
    }

    pub fn has_unresolved_conflicts(&self) -> bool {
        !self.unresolved_conflicts.is_empty()
    }
}

/// Conflicts raised in the sprint log and not resolved since.
pub fn unresolved_conflicts(events: &[LoggedEvent]) -> Vec<ConflictError> {
    let mut open: BTreeMap<String, Vec<ConflictError>> = BTreeMap::new();
    for logged in events {
        match &logged.event {
            SprintEvent::ConflictRaised {
                artifact,
                task_a,
                task_b,
                overlap_region,
            } => open.entry(artifact.clone()).or_default().push(ConflictError {
                artifact: artifact.clone(),
                task_a: task_a.clone(),
                task_b: task_b.clone(),
                overlap_region: overlap_region.clone(),
            }),
            SprintEvent::ConflictResolved { artifact } => {
                open.remove(artifact);
            }
            _ => {}
        }
    }
    open.into_values().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OverlapRegion;
    use chrono::Utc;

    fn sprint() -> Vec<Task> {
        vec![
            Task::new("A", "schema", "build", "db")
                .with_effort(3.0)
                .with_status(TaskStatus::InProgress),
            Task::new("B", "api", "build", "api").depends_on("A"),
            Task::new("C", "docs", "build", "docs"),
        ]
    }

    #[test]
    fn counts_by_status() {
        let counts = SprintCounts::from_tasks(&sprint());
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.total(), 3);
        assert!(!counts.is_settled());
    }

    #[test]
    fn status_explains_blocked_tasks() {
        let tasks = sprint();
        let graph = DependencyGraph::build(&tasks).unwrap();
        let status = SprintStatus::collect("demo", &tasks, &graph, 1.0, TieBreak::FirstDefined);

        assert_eq!(status.ready, vec![TaskId::new("C")]);
        assert_eq!(
            status.blocked,
            vec![BlockedTask {
                task_id: "B".into(),
                blocked_by: vec![Blocker {
                    task_id: "A".into(),
                    status: TaskStatus::InProgress,
                }],
            }]
        );
        assert_eq!(status.critical_path.path, vec![TaskId::new("A"), TaskId::new("B")]);
    }

    #[test]
    fn resolved_conflicts_drop_out_of_the_log_view() {
        let raised = |artifact: &str| LoggedEvent {
            at: Utc::now(),
            event: SprintEvent::ConflictRaised {
                artifact: artifact.to_string(),
                task_a: "X".into(),
                task_b: "Y".into(),
                overlap_region: OverlapRegion::WholeFile,
            },
        };
        let events = vec![
            raised("a.rs"),
            raised("b.rs"),
            LoggedEvent {
                at: Utc::now(),
                event: SprintEvent::ConflictResolved {
                    artifact: "a.rs".to_string(),
                },
            },
        ];
        let open = unresolved_conflicts(&events);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].artifact, "b.rs");
    }
}
