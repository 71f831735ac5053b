//! Error taxonomy.
//!
//! Load-time errors (schema, cycle) halt scheduling of the whole sprint.
//! Per-task errors (transition, validation, session conflict) are local.
//! IPC errors are retried and only surface once retries are exhausted.
//! Artifact conflicts flag the sprint but never stop it.
//!
//! Every error converts to an [`ErrorReport`]: a serializable payload with
//! the current state, the expected state and a suggested fix.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{RoleTag, SessionId, TaskId, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Schema,
    Cycle,
    Transition,
    Validation,
    Ipc,
    SessionConflict,
    Conflict,
    Store,
    Spawn,
    Config,
    NotFound,
}

impl ErrorKind {
    /// Load-time errors block the whole sprint.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::Schema | ErrorKind::Cycle | ErrorKind::Config)
    }
}

/// One problem found in a sprint definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaProblem {
    /// Task id, or `#<index>` when the id itself is missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl SchemaProblem {
    pub fn new(task: Option<String>, field: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            task,
            field: field.map(str::to_string),
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.task, &self.field) {
            (Some(task), Some(field)) => write!(f, "task {task}: {field}: {}", self.message),
            (Some(task), None) => write!(f, "task {task}: {}", self.message),
            (None, Some(field)) => write!(f, "{field}: {}", self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sprint definition is invalid: {}", join(.problems, "; "))]
pub struct SchemaError {
    pub problems: Vec<SchemaProblem>,
}

impl SchemaError {
    pub fn single(problem: SchemaProblem) -> Self {
        Self {
            problems: vec![problem],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle detected: {}", join(.cycle_path, " -> "))]
pub struct CycleError {
    /// Starts and ends with the same task id.
    pub cycle_path: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("task '{task_id}' cannot move from {from} to {to}")]
    Illegal {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task '{task_id}' is blocked by unfinished dependencies: {}", describe_blockers(.blocked_by))]
    DependenciesIncomplete {
        task_id: TaskId,
        blocked_by: Vec<(TaskId, TaskStatus)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task '{task_id}' cannot become {target}: {}", .problems.join("; "))]
pub struct ValidationError {
    pub task_id: TaskId,
    pub target: TaskStatus,
    pub problems: Vec<String>,
    /// Ready-to-fill template for the missing documentation.
    pub template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task '{task_id}' already has an active work session{}", .session_id.map(|s| format!(" ({s})")).unwrap_or_default())]
pub struct SessionConflictError {
    pub task_id: TaskId,
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("{op} failed for {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        op: &'static str,
        attempts: u32,
        last_error: String,
    },

    #[error("corrupt record at {path}: {message}")]
    Corrupt { path: String, message: String },

    #[error("task '{0}' already has a completion signal; invalidate it first")]
    AlreadyPublished(TaskId),
}

impl IpcError {
    /// Worth retrying: plain I/O failures, but not semantic refusals.
    pub fn is_transient(&self) -> bool {
        match self {
            IpcError::Io { source, .. } => !matches!(
                source.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::AlreadyExists
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidInput
            ),
            _ => false,
        }
    }
}

/// Region two tasks both edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverlapRegion {
    /// Zero-based, half-open line range of the artifact's base content.
    Lines { start: usize, end: usize },
    /// At least one side did not report which lines it touched.
    WholeFile,
}

impl fmt::Display for OverlapRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlapRegion::Lines { start, end } => write!(f, "lines {start}..{end}"),
            OverlapRegion::WholeFile => f.write_str("whole file"),
        }
    }
}

/// Artifact-level conflict between two completed tasks.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("conflicting edits to {artifact} by '{task_a}' and '{task_b}' ({overlap_region})")]
pub struct ConflictError {
    pub artifact: String,
    /// Task whose edit was accepted first.
    pub task_a: TaskId,
    /// Task whose edit was refused.
    pub task_b: TaskId,
    pub overlap_region: OverlapRegion,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("could not parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("task '{0}' not found")]
    TaskNotFound(TaskId),

    #[error("task '{task_id}' changed concurrently (expected revision {expected}, found {found})")]
    RevisionConflict {
        task_id: TaskId,
        expected: u64,
        found: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpawnError {
    #[error("no worker registered for role '{0}'")]
    UnknownRole(RoleTag),

    #[error("failed to launch worker for role '{role}': {message}")]
    Launch { role: RoleTag, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Every error the core can return.
#[derive(Debug, Error)]
pub enum ConductorError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    SessionConflict(#[from] SessionConflictError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ConductorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConductorError::Schema(_) => ErrorKind::Schema,
            ConductorError::Cycle(_) => ErrorKind::Cycle,
            ConductorError::Transition(_) => ErrorKind::Transition,
            ConductorError::Validation(_) => ErrorKind::Validation,
            ConductorError::Ipc(_) => ErrorKind::Ipc,
            ConductorError::SessionConflict(_) => ErrorKind::SessionConflict,
            ConductorError::Conflict(_) => ErrorKind::Conflict,
            ConductorError::Store(StoreError::TaskNotFound(_)) => ErrorKind::NotFound,
            ConductorError::Store(StoreError::Schema(_)) => ErrorKind::Schema,
            ConductorError::Store(_) => ErrorKind::Store,
            ConductorError::Spawn(_) => ErrorKind::Spawn,
            ConductorError::Config(_) => ErrorKind::Config,
        }
    }

    /// Structured payload for automation and humans.
    pub fn report(&self) -> ErrorReport {
        let mut report = ErrorReport::new(self.kind(), self.to_string());
        match self {
            ConductorError::Schema(_) | ConductorError::Store(StoreError::Schema(_)) => {
                report.remediation = "Fix the listed fields in the sprint definition; no task is \
                                      scheduled until the whole file validates."
                    .to_string();
            }
            ConductorError::Cycle(e) => {
                report.remediation = format!(
                    "Remove one dependency edge from the cycle {}.",
                    join(&e.cycle_path, " -> ")
                );
            }
            ConductorError::Transition(TransitionError::Illegal { task_id, from, to }) => {
                report.task_id = Some(task_id.clone());
                report.current_state = Some(*from);
                report.expected_state = legal_source(*to);
                report.remediation = match (from, to) {
                    (TaskStatus::Pending, TaskStatus::Completed | TaskStatus::Deferred) => {
                        format!("Start task '{task_id}' before finishing it.")
                    }
                    (TaskStatus::Completed, _) => {
                        format!("Task '{task_id}' is completed; completed tasks are final.")
                    }
                    _ => format!(
                        "Allowed moves: pending -> in_progress -> completed|deferred, \
                         deferred -> in_progress. Task '{task_id}' is {from}."
                    ),
                };
            }
            ConductorError::Transition(TransitionError::DependenciesIncomplete {
                task_id,
                blocked_by,
            }) => {
                report.task_id = Some(task_id.clone());
                report.remediation = format!(
                    "Complete {} before starting '{task_id}'.",
                    describe_blockers(blocked_by)
                );
            }
            ConductorError::Validation(e) => {
                report.task_id = Some(e.task_id.clone());
                report.current_state = Some(TaskStatus::InProgress);
                report.expected_state = Some(e.target);
                report.template = e.template.clone();
                report.remediation = match e.target {
                    TaskStatus::Completed => {
                        "Fill in the completion notes template and retry.".to_string()
                    }
                    TaskStatus::Deferred => "Give a non-empty reason for deferring.".to_string(),
                    _ => "Supply the missing fields and retry.".to_string(),
                };
            }
            ConductorError::SessionConflict(e) => {
                report.task_id = Some(e.task_id.clone());
                report.current_state = Some(TaskStatus::InProgress);
                report.remediation = format!(
                    "Wait for the running session of '{}' to finish, or defer the task first.",
                    e.task_id
                );
            }
            ConductorError::Conflict(e) => {
                report.task_id = Some(e.task_b.clone());
                report.remediation = format!(
                    "Reconcile {} by hand, then mark the conflict resolved.",
                    e.artifact
                );
            }
            ConductorError::Store(StoreError::TaskNotFound(id)) => {
                report.task_id = Some(id.clone());
                report.remediation = "Check the task id against `conductor status`.".to_string();
            }
            ConductorError::Store(StoreError::RevisionConflict { task_id, .. }) => {
                report.task_id = Some(task_id.clone());
                report.remediation =
                    "Another writer changed the task; re-read it and retry.".to_string();
            }
            ConductorError::Store(_) | ConductorError::Ipc(_) => {
                report.remediation =
                    "Check that the sprint and state directories are readable and writable."
                        .to_string();
            }
            ConductorError::Spawn(SpawnError::UnknownRole(role)) => {
                report.remediation = format!("Register a worker for role '{role}'.");
            }
            ConductorError::Spawn(SpawnError::Launch { role, .. }) => {
                report.remediation = format!("Check the command configured for role '{role}'.");
            }
            ConductorError::Config(_) => {
                report.remediation = "Fix the `settings` block of the sprint definition.".to_string();
            }
        }
        report
    }
}

/// Structured error response for the lifecycle surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_state: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_state: Option<TaskStatus>,
    pub message: String,
    pub remediation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl ErrorReport {
    fn new(kind: ErrorKind, message: String) -> Self {
        Self {
            kind,
            task_id: None,
            current_state: None,
            expected_state: None,
            message,
            remediation: String::new(),
            template: None,
        }
    }
}

/// The status a task must be in before it may move to `to`.
fn legal_source(to: TaskStatus) -> Option<TaskStatus> {
    match to {
        TaskStatus::InProgress => Some(TaskStatus::Pending),
        TaskStatus::Completed | TaskStatus::Deferred => Some(TaskStatus::InProgress),
        TaskStatus::Pending => None,
    }
}

fn join<T: fmt::Display>(items: &[T], sep: &str) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(sep)
}

fn describe_blockers(blocked_by: &[(TaskId, TaskStatus)]) -> String {
    blocked_by
        .iter()
        .map(|(id, status)| format!("{id} ({status})"))
        .collect::<Vec<_>>()
        .join(", ")
}
