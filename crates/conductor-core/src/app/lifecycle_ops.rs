//! TaskLifecycle: the status-changing surface.
//!
//! Every status write in the crate goes through here: the task is read
//! fresh, the transition is validated, the record is written with the
//! store's revision check, then read back and re-validated. A write that
//! loses a race is retried against the new state.
//!
//! `start`, `complete` and `defer` are idempotent: asking for the state the
//! task is already in returns the record unchanged. `transition` is the
//! strict form the scheduler uses to claim a task.
//!
//! With a progress channel attached, `start` archives the completion signal
//! an earlier session left for the task, so a scheduler does not settle the
//! restarted task with that old outcome.

use std::sync::Arc;

use tracing::{debug, info};

use crate::app::SprintLog;
use crate::domain::{
    CompletionNotes, ConductorError, SprintEvent, StoreError, Task, TaskId, TaskStatus,
    ValidationError,
};
use crate::lifecycle::{LifecycleValidator, TransitionContext, TransitionFields};
use crate::ports::{Clock, ProgressChannel, TaskStore};

/// Attempts at a read-validate-write cycle before a revision conflict is
/// returned to the caller.
const MAX_WRITE_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct TaskLifecycle {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    log: SprintLog,
    channel: Option<Arc<dyn ProgressChannel>>,
}

impl TaskLifecycle {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, log: SprintLog) -> Self {
        Self {
            store,
            clock,
            log,
            channel: None,
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn ProgressChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// `pending|deferred -> in_progress`. On a task already in progress the
    /// current record is returned.
    pub async fn start(&self, id: &TaskId) -> Result<Task, ConductorError> {
        if let Some(channel) = &self.channel
            && matches!(
                self.store.task(id).await?.status,
                TaskStatus::Pending | TaskStatus::Deferred
            )
            && channel.invalidate(id).await?
        {
            info!(task_id = %id, "archived the completion signal of an earlier session");
        }
        self.apply(id, TaskStatus::InProgress, TransitionFields::none(), true)
            .await
    }

    /// `in_progress -> completed` with notes in the template's text form.
    pub async fn complete(&self, id: &TaskId, notes: &str) -> Result<Task, ConductorError> {
        let notes = CompletionNotes::parse(notes)
            .map_err(|problems| LifecycleValidator::notes_rejected(id, problems))?;
        self.complete_with(id, notes).await
    }

    /// `in_progress -> completed` with structured notes.
    pub async fn complete_with(
        &self,
        id: &TaskId,
        notes: CompletionNotes,
    ) -> Result<Task, ConductorError> {
        // notes are checked before the idempotence shortcut so bad notes
        // are always refused
        notes
            .validate()
            .map_err(|problems| LifecycleValidator::notes_rejected(id, problems))?;
        self.apply(id, TaskStatus::Completed, TransitionFields::notes(notes), true)
            .await
    }

    /// `in_progress -> deferred`.
    pub async fn defer(&self, id: &TaskId, reason: &str) -> Result<Task, ConductorError> {
        if reason.trim().is_empty() {
            return Err(ValidationError {
                task_id: id.clone(),
                target: TaskStatus::Deferred,
                problems: vec!["deferredReason must not be empty".to_string()],
                template: None,
            }
            .into());
        }
        self.apply(id, TaskStatus::Deferred, TransitionFields::reason(reason), true)
            .await
    }

    /// Strict transition: asking for the current state is an error.
    pub async fn transition(
        &self,
        id: &TaskId,
        to: TaskStatus,
        fields: TransitionFields,
    ) -> Result<Task, ConductorError> {
        self.apply(id, to, fields, false).await
    }

    async fn apply(
        &self,
        id: &TaskId,
        to: TaskStatus,
        fields: TransitionFields,
        idempotent: bool,
    ) -> Result<Task, ConductorError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let tasks = self.store.snapshot().await?;
            let task = tasks
                .iter()
                .find(|t| &t.id == id)
                .ok_or_else(|| StoreError::TaskNotFound(id.clone()))?;
            if idempotent && task.status == to {
                debug!(task_id = %id, status = %to, "already in requested state");
                return Ok(task.clone());
            }

            let ctx = TransitionContext {
                dependency_statuses: task
                    .dependencies
                    .iter()
                    .map(|dep| {
                        let status = tasks
                            .iter()
                            .find(|t| &t.id == dep)
                            .map(|t| t.status)
                            .unwrap_or(TaskStatus::Pending);
                        (dep.clone(), status)
                    })
                    .collect(),
                active_session: None,
                now: self.clock.now(),
            };
            let next = LifecycleValidator::transition(task, to, fields.clone(), &ctx)?;
            let from = task.status;

            match self.store.replace(next).await {
                Ok(written) => {
                    let stored = self.store.task(id).await?;
                    LifecycleValidator::check_record(&stored)?;
                    info!(task_id = %id, from = %from, to = %to, revision = written.revision, "task transitioned");
                    self.log
                        .emit(SprintEvent::TaskTransitioned {
                            task_id: id.clone(),
                            from,
                            to,
                            reason: written.deferred_reason.clone(),
                        })
                        .await;
                    return Ok(written);
                }
                Err(StoreError::RevisionConflict { .. }) if attempt < MAX_WRITE_ATTEMPTS => {
                    debug!(task_id = %id, attempt, "task changed concurrently, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, TransitionError};
    use crate::impls::{MemoryEventSink, MemoryTaskStore};
    use crate::ports::SystemClock;

    fn lifecycle(tasks: Vec<Task>) -> (Arc<MemoryTaskStore>, Arc<MemoryEventSink>, TaskLifecycle) {
        let store = Arc::new(MemoryTaskStore::new(tasks));
        let events = Arc::new(MemoryEventSink::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let lifecycle = TaskLifecycle::new(
            store.clone(),
            clock.clone(),
            SprintLog::new(events.clone(), clock),
        );
        (store, events, lifecycle)
    }

    fn sprint() -> Vec<Task> {
        vec![
            Task::new("A", "schema", "build", "db"),
            Task::new("B", "api", "build", "api").depends_on("A"),
        ]
    }

    const NOTES: &str = "summary: Added the schema.\nfilesChanged:\n  - db/schema.sql\n";

    #[tokio::test]
    async fn start_is_idempotent() {
        let (_, events, lifecycle) = lifecycle(sprint());
        let first = lifecycle.start(&"A".into()).await.unwrap();
        let second = lifecycle.start(&"A".into()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.status, TaskStatus::InProgress);
        assert_eq!(events.events().len(), 1);
    }

    #[tokio::test]
    async fn strict_transition_refuses_the_current_state() {
        let (_, _, lifecycle) = lifecycle(sprint());
        lifecycle.start(&"A".into()).await.unwrap();
        let err = lifecycle
            .transition(&"A".into(), TaskStatus::InProgress, TransitionFields::none())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConductorError::Transition(TransitionError::Illegal { .. })
        ));
    }

    #[tokio::test]
    async fn start_waits_for_dependencies() {
        let (_, _, lifecycle) = lifecycle(sprint());
        let err = lifecycle.start(&"B".into()).await.unwrap_err();
        let report = err.report();
        assert_eq!(report.kind, ErrorKind::Transition);
        assert!(report.remediation.contains("A (pending)"));
    }

    #[tokio::test]
    async fn empty_notes_are_rejected_with_template() {
        let (store, _, lifecycle) = lifecycle(sprint());
        lifecycle.start(&"A".into()).await.unwrap();

        let err = lifecycle.complete(&"A".into(), "").await.unwrap_err();
        let report = err.report();
        assert_eq!(report.kind, ErrorKind::Validation);
        assert!(report.template.is_some());
        assert_eq!(
            store.task(&"A".into()).await.unwrap().status,
            TaskStatus::InProgress
        );
    }

    #[tokio::test]
    async fn complete_sets_notes_and_timestamp() {
        let (_, _, lifecycle) = lifecycle(sprint());
        lifecycle.start(&"A".into()).await.unwrap();
        let done = lifecycle.complete(&"A".into(), NOTES).await.unwrap();

        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(
            done.completion_notes.unwrap().files_changed,
            vec!["db/schema.sql".to_string()]
        );

        let again = lifecycle.complete(&"A".into(), NOTES).await.unwrap();
        assert_eq!(again.revision, done.revision);
    }

    #[tokio::test]
    async fn defer_then_restart_clears_reason() {
        let (_, _, lifecycle) = lifecycle(sprint());
        lifecycle.start(&"A".into()).await.unwrap();
        assert!(lifecycle.defer(&"A".into(), "   ").await.is_err());

        let deferred = lifecycle.defer(&"A".into(), "blocked on infra").await.unwrap();
        assert_eq!(deferred.deferred_reason.as_deref(), Some("blocked on infra"));

        let restarted = lifecycle.start(&"A".into()).await.unwrap();
        assert_eq!(restarted.deferred_reason, None);
    }

    #[tokio::test]
    async fn restart_archives_the_old_signal() {
        use crate::domain::{CompletionSignal, SessionId, SignalId, SignalStatus};
        use crate::impls::FsProgressChannel;
        use crate::retry::RetryPolicy;
        use chrono::Utc;
        use ulid::Ulid;

        let dir = tempfile::tempdir().unwrap();
        let channel: Arc<dyn ProgressChannel> = Arc::new(
            FsProgressChannel::open(dir.path(), RetryPolicy::none())
                .await
                .unwrap(),
        );
        let signal = |status: SignalStatus| CompletionSignal {
            signal_id: SignalId::from_ulid(Ulid::new()),
            task_id: "A".into(),
            session_id: SessionId::from_ulid(Ulid::new()),
            status,
            summary: Some("done".into()),
            files_changed: Vec::new(),
            design_decisions: Vec::new(),
            next_tasks: Vec::new(),
            testing: None,
            error: None,
            timestamp: Utc::now(),
        };
        let (_, _, lifecycle) = lifecycle(sprint());
        let lifecycle = lifecycle.with_channel(Arc::clone(&channel));
        lifecycle.start(&"A".into()).await.unwrap();
        lifecycle.defer(&"A".into(), "worker gave up").await.unwrap();
        channel
            .publish_completion(&signal(SignalStatus::Failure))
            .await
            .unwrap();

        lifecycle.start(&"A".into()).await.unwrap();
        assert!(channel.completion(&"A".into()).await.unwrap().is_none());

        // an idempotent start leaves a fresh signal alone
        channel
            .publish_completion(&signal(SignalStatus::Success))
            .await
            .unwrap();
        lifecycle.start(&"A".into()).await.unwrap();
        assert!(channel.completion(&"A".into()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn completed_task_cannot_be_deferred() {
        let (_, _, lifecycle) = lifecycle(sprint());
        lifecycle.start(&"A".into()).await.unwrap();
        lifecycle.complete(&"A".into(), NOTES).await.unwrap();

        let err = lifecycle.defer(&"A".into(), "too late").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transition);
    }

    #[tokio::test]
    async fn concurrent_starts_leave_one_transition() {
        let (store, events, lifecycle) = lifecycle(sprint());
        let id: TaskId = "A".into();
        let (a, b) = tokio::join!(lifecycle.start(&id), lifecycle.start(&id));
        assert_eq!(a.unwrap().status, TaskStatus::InProgress);
        assert_eq!(b.unwrap().status, TaskStatus::InProgress);
        assert_eq!(store.task(&"A".into()).await.unwrap().revision, 1);
        assert_eq!(events.events().len(), 1);
    }
}
