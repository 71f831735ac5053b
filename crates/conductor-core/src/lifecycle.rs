//! Lifecycle validator: the only place task status may change.
//!
//! ```text
//! pending ──▶ in_progress ──▶ completed
//!                 │  ▲
//!                 ▼  │
//!              deferred
//! ```
//!
//! Validation is pure. The caller gathers the context (dependency statuses,
//! live sessions, current time) and persists the returned task.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{
    COMPLETION_NOTES_TEMPLATE, CompletionNotes, ConductorError, NotesProblem,
    SessionConflictError, SessionId, Task, TaskId, TaskStatus, TransitionError, ValidationError,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    SessionConflict(#[from] SessionConflictError),
}

impl From<LifecycleError> for ConductorError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::Transition(e) => ConductorError::Transition(e),
            LifecycleError::Validation(e) => ConductorError::Validation(e),
            LifecycleError::SessionConflict(e) => ConductorError::SessionConflict(e),
        }
    }
}

/// Fields supplied with a transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionFields {
    pub completion_notes: Option<CompletionNotes>,
    pub deferred_reason: Option<String>,
}

impl TransitionFields {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn notes(notes: CompletionNotes) -> Self {
        Self {
            completion_notes: Some(notes),
            ..Self::default()
        }
    }

    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            deferred_reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// World state the preconditions are checked against.
#[derive(Debug, Clone)]
pub struct TransitionContext {
    /// Status of every dependency of the task.
    pub dependency_statuses: Vec<(TaskId, TaskStatus)>,
    /// A live session for the task that does not belong to the caller.
    pub active_session: Option<SessionId>,
    pub now: DateTime<Utc>,
}

impl TransitionContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            dependency_statuses: Vec::new(),
            active_session: None,
            now,
        }
    }
}

pub struct LifecycleValidator;

impl LifecycleValidator {
    /// Legal targets from `from`.
    pub fn allowed_targets(from: TaskStatus) -> &'static [TaskStatus] {
        match from {
            TaskStatus::Pending => &[TaskStatus::InProgress],
            TaskStatus::InProgress => &[TaskStatus::Completed, TaskStatus::Deferred],
            TaskStatus::Deferred => &[TaskStatus::InProgress],
            TaskStatus::Completed => &[],
        }
    }

    pub fn is_allowed(from: TaskStatus, to: TaskStatus) -> bool {
        Self::allowed_targets(from).contains(&to)
    }

    /// Check `task -> to` and return the updated record. `task` itself is
    /// never modified, so a rejected transition leaves no trace.
    pub fn transition(
        task: &Task,
        to: TaskStatus,
        fields: TransitionFields,
        ctx: &TransitionContext,
    ) -> Result<Task, LifecycleError> {
        if !Self::is_allowed(task.status, to) {
            return Err(TransitionError::Illegal {
                task_id: task.id.clone(),
                from: task.status,
                to,
            }
            .into());
        }

        let mut next = task.clone();
        match to {
            TaskStatus::InProgress => {
                let blocked_by: Vec<(TaskId, TaskStatus)> = ctx
                    .dependency_statuses
                    .iter()
                    .filter(|(_, status)| *status != TaskStatus::Completed)
                    .cloned()
                    .collect();
                if !blocked_by.is_empty() {
                    return Err(TransitionError::DependenciesIncomplete {
                        task_id: task.id.clone(),
                        blocked_by,
                    }
                    .into());
                }
                if let Some(session_id) = ctx.active_session {
                    return Err(SessionConflictError {
                        task_id: task.id.clone(),
                        session_id: Some(session_id),
                    }
                    .into());
                }
                next.deferred_reason = None;
            }
            TaskStatus::Completed => {
                let Some(notes) = fields.completion_notes else {
                    return Err(Self::notes_rejected(&task.id, vec![NotesProblem::Missing]).into());
                };
                notes
                    .validate()
                    .map_err(|problems| Self::notes_rejected(&task.id, problems))?;
                next.completion_notes = Some(notes);
                next.completed_at = Some(ctx.now);
                next.deferred_reason = None;
            }
            TaskStatus::Deferred => {
                let reason = fields
                    .deferred_reason
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty());
                let Some(reason) = reason else {
                    return Err(ValidationError {
                        task_id: task.id.clone(),
                        target: TaskStatus::Deferred,
                        problems: vec!["deferredReason must not be empty".to_string()],
                        template: None,
                    }
                    .into());
                };
                next.deferred_reason = Some(reason);
            }
            TaskStatus::Pending => {
                return Err(TransitionError::Illegal {
                    task_id: task.id.clone(),
                    from: task.status,
                    to,
                }
                .into());
            }
        }
        next.status = to;
        Ok(next)
    }

    /// Rejection for missing or malformed completion notes, with the
    /// template to fill in.
    pub fn notes_rejected(task_id: &TaskId, problems: Vec<NotesProblem>) -> ValidationError {
        ValidationError {
            task_id: task_id.clone(),
            target: TaskStatus::Completed,
            problems: problems.iter().map(ToString::to_string).collect(),
            template: Some(COMPLETION_NOTES_TEMPLATE.to_string()),
        }
    }

    /// Re-check a persisted record: status-conditional fields must match
    /// its status.
    pub fn check_record(task: &Task) -> Result<(), ValidationError> {
        let mut problems = Vec::new();
        let completed = task.status == TaskStatus::Completed;
        if completed != task.completed_at.is_some() {
            problems.push(format!("completedAt does not match status {}", task.status));
        }
        match (&task.completion_notes, completed) {
            (Some(notes), true) => {
                if let Err(notes_problems) = notes.validate() {
                    problems.extend(notes_problems.iter().map(ToString::to_string));
                }
            }
            (None, false) => {}
            _ => problems.push(format!("completionNotes do not match status {}", task.status)),
        }
        let deferred = task.status == TaskStatus::Deferred;
        if deferred != task.deferred_reason.is_some() {
            problems.push(format!("deferredReason does not match status {}", task.status));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                task_id: task.id.clone(),
                target: task.status,
                problems,
                template: completed.then(|| COMPLETION_NOTES_TEMPLATE.to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    use TaskStatus::*;

    fn ctx() -> TransitionContext {
        TransitionContext::at(Utc::now())
    }

    fn valid_notes() -> CompletionNotes {
        CompletionNotes::new("Implemented the endpoint").with_file("src/api.rs")
    }

    fn fields_for(to: TaskStatus) -> TransitionFields {
        match to {
            Completed => TransitionFields::notes(valid_notes()),
            Deferred => TransitionFields::reason("blocked on vendor"),
            _ => TransitionFields::none(),
        }
    }

    #[rstest]
    #[case(Pending, InProgress, true)]
    #[case(Pending, Completed, false)]
    #[case(Pending, Deferred, false)]
    #[case(InProgress, Completed, true)]
    #[case(InProgress, Deferred, true)]
    #[case(InProgress, Pending, false)]
    #[case(Deferred, InProgress, true)]
    #[case(Deferred, Completed, false)]
    #[case(Completed, InProgress, false)]
    #[case(Completed, Deferred, false)]
    #[case(Completed, Pending, false)]
    #[case(Pending, Pending, false)]
    fn transition_table(#[case] from: TaskStatus, #[case] to: TaskStatus, #[case] legal: bool) {
        let mut task = Task::new("T1", "t", "p", "r").with_status(from);
        if from == Deferred {
            task.deferred_reason = Some("earlier".into());
        }
        let result = LifecycleValidator::transition(&task, to, fields_for(to), &ctx());
        if legal {
            assert_eq!(result.unwrap().status, to);
        } else {
            assert!(matches!(
                result,
                Err(LifecycleError::Transition(TransitionError::Illegal { .. }))
            ));
        }
    }

    #[test]
    fn start_requires_completed_dependencies() {
        let task = Task::new("B", "b", "p", "r").depends_on("A");
        let mut ctx = ctx();
        ctx.dependency_statuses = vec![(TaskId::new("A"), InProgress)];
        let err = LifecycleValidator::transition(&task, InProgress, TransitionFields::none(), &ctx)
            .unwrap_err();
        match err {
            LifecycleError::Transition(TransitionError::DependenciesIncomplete {
                blocked_by,
                ..
            }) => assert_eq!(blocked_by, vec![(TaskId::new("A"), InProgress)]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn start_refuses_a_second_session() {
        let task = Task::new("T1", "t", "p", "r");
        let mut ctx = ctx();
        ctx.active_session = Some(SessionId::from_ulid(Ulid::new()));
        let err = LifecycleValidator::transition(&task, InProgress, TransitionFields::none(), &ctx)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::SessionConflict(_)));
    }

    #[test]
    fn complete_without_notes_returns_template() {
        let task = Task::new("T1", "t", "p", "r").with_status(InProgress);
        let err = LifecycleValidator::transition(&task, Completed, TransitionFields::none(), &ctx())
            .unwrap_err();
        match err {
            LifecycleError::Validation(e) => {
                assert_eq!(e.template.as_deref(), Some(COMPLETION_NOTES_TEMPLATE));
                assert_eq!(e.problems, vec!["completion notes are missing".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn complete_with_placeholder_summary_is_rejected() {
        let task = Task::new("T1", "t", "p", "r").with_status(InProgress);
        let notes = CompletionNotes::new("<what was delivered>");
        let err = LifecycleValidator::transition(&task, Completed, TransitionFields::notes(notes), &ctx())
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));
    }

    #[test]
    fn complete_sets_completed_at_and_notes() {
        let task = Task::new("T1", "t", "p", "r").with_status(InProgress);
        let ctx = ctx();
        let done = LifecycleValidator::transition(
            &task,
            Completed,
            TransitionFields::notes(valid_notes()),
            &ctx,
        )
        .unwrap();
        assert_eq!(done.completed_at, Some(ctx.now));
        assert_eq!(done.completion_notes, Some(valid_notes()));
        assert!(LifecycleValidator::check_record(&done).is_ok());
        assert_eq!(task.status, InProgress);
    }

    #[test]
    fn defer_requires_reason_and_reentry_clears_it() {
        let task = Task::new("T1", "t", "p", "r").with_status(InProgress);
        let err = LifecycleValidator::transition(&task, Deferred, TransitionFields::reason("  "), &ctx())
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));

        let deferred =
            LifecycleValidator::transition(&task, Deferred, TransitionFields::reason("waiting"), &ctx())
                .unwrap();
        assert_eq!(deferred.deferred_reason.as_deref(), Some("waiting"));

        let resumed =
            LifecycleValidator::transition(&deferred, InProgress, TransitionFields::none(), &ctx())
                .unwrap();
        assert_eq!(resumed.deferred_reason, None);
        assert!(LifecycleValidator::check_record(&resumed).is_ok());
    }

    #[test]
    fn check_record_catches_inconsistent_fields() {
        let mut task = Task::new("T1", "t", "p", "r").with_status(Completed);
        task.completed_at = Some(Utc::now());
        let err = LifecycleValidator::check_record(&task).unwrap_err();
        assert!(err.template.is_some());
        assert!(err.problems.iter().any(|p| p.contains("completionNotes")));
    }
}
