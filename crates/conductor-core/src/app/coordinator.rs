//! WorkerCoordinator: owns the live WorkSessions.
//!
//! One session per task at most. The coordinator launches workers through
//! the capability registry, watches their heartbeats and exits, and carries
//! out the decider's restart-or-give-up verdict. Status changes are not its
//! business: the scheduler moves tasks through the lifecycle service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::app::SprintLog;
use crate::config::ConductorConfig;
use crate::domain::{
    ConductorError, Decider, Decision, DependencyArtifact, RetryBudgetDecider, SessionConflictError,
    SessionFailure, SessionId, SpawnError, SprintEvent, Task, TaskId, WorkSession,
};
use crate::ports::{
    CancelToken, CapabilityRegistry, Clock, IdGenerator, ProgressChannel, SessionReporter,
    WorkerHandle, WorkerInput,
};

struct ActiveSession {
    session: WorkSession,
    /// Payload of the current session, reused for restarts.
    input: WorkerInput,
    cancel: CancelToken,
    /// `None` once the worker has exited and its exit was examined.
    handle: Option<WorkerHandle>,
}

impl ActiveSession {
    fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// A session the sweep found dead or stalled.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionFault {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub failure: SessionFailure,
}

/// What [`WorkerCoordinator::recover`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// A fresh session is running.
    Restarted(WorkSession),
    /// Retry budget spent. A failure signal was published; the task must be
    /// deferred with `reason`.
    GaveUp { session_id: SessionId, reason: String },
}

pub struct WorkerCoordinator {
    registry: CapabilityRegistry,
    channel: Arc<dyn ProgressChannel>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    decider: Arc<dyn Decider>,
    log: SprintLog,
    config: ConductorConfig,
    sessions: Mutex<HashMap<TaskId, ActiveSession>>,
}

impl WorkerCoordinator {
    pub fn new(
        registry: CapabilityRegistry,
        channel: Arc<dyn ProgressChannel>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        log: SprintLog,
        config: ConductorConfig,
    ) -> Self {
        Self {
            registry,
            channel,
            clock,
            ids,
            decider: Arc::new(RetryBudgetDecider::new(config.max_retries)),
            log,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<TaskId, ActiveSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Launch a worker for `task`.
    ///
    /// Any signal left over from an earlier run of the task is archived
    /// first so the new session can publish its own.
    pub async fn start(
        &self,
        task: &Task,
        dependencies: Vec<DependencyArtifact>,
    ) -> Result<WorkSession, ConductorError> {
        if let Some(session_id) = self.session_id(&task.id) {
            return Err(SessionConflictError {
                task_id: task.id.clone(),
                session_id: Some(session_id),
            }
            .into());
        }
        if self.channel.invalidate(&task.id).await? {
            debug!(task_id = %task.id, "archived stale completion signal");
        }

        let input = WorkerInput::new(task, self.ids.generate_session_id(), 0, dependencies);
        let active = self.launch(input).await?;
        let session = active.session.clone();

        let raced = {
            let mut sessions = self.sessions();
            match sessions.get(&task.id) {
                Some(existing) => Some((existing.session.session_id, active)),
                None => {
                    sessions.insert(task.id.clone(), active);
                    None
                }
            }
        };
        if let Some((existing, mut launched)) = raced {
            // a concurrent start won; stop the worker just launched
            launched.stop();
            return Err(SessionConflictError {
                task_id: task.id.clone(),
                session_id: Some(existing),
            }
            .into());
        }

        self.session_started(&session).await;
        Ok(session)
    }

    async fn launch(&self, input: WorkerInput) -> Result<ActiveSession, SpawnError> {
        let launcher = self.registry.resolve(&input.assigned_role)?;
        let session_id = input.session_id;
        let retry_count = input.retry_count;

        let session = WorkSession::new(
            session_id,
            input.task_id.clone(),
            self.clock.now(),
            retry_count,
            self.config.session_timeout(input.estimated_effort),
        );
        let cancel = CancelToken::new();
        let reporter = SessionReporter::new(
            input.task_id.clone(),
            session_id,
            Arc::clone(&self.channel),
            Arc::clone(&self.clock),
            Arc::clone(&self.ids),
            cancel.clone(),
        );
        let handle = launcher.launch(input.clone(), reporter).await?;
        Ok(ActiveSession {
            session,
            input,
            cancel,
            handle: Some(handle),
        })
    }

    async fn session_started(&self, session: &WorkSession) {
        info!(
            task_id = %session.task_id,
            session_id = %session.session_id,
            retry_count = session.retry_count,
            timeout_ms = session.timeout.as_millis() as u64,
            "session started"
        );
        self.log
            .emit(SprintEvent::SessionStarted {
                task_id: session.task_id.clone(),
                session_id: session.session_id,
                retry_count: session.retry_count,
            })
            .await;
    }

    pub fn session(&self, task_id: &TaskId) -> Option<WorkSession> {
        self.sessions().get(task_id).map(|a| a.session.clone())
    }

    fn session_id(&self, task_id: &TaskId) -> Option<SessionId> {
        self.sessions().get(task_id).map(|a| a.session.session_id)
    }

    /// Live sessions ordered by task id.
    pub fn active_sessions(&self) -> Vec<WorkSession> {
        let mut sessions: Vec<WorkSession> =
            self.sessions().values().map(|a| a.session.clone()).collect();
        sessions.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        sessions
    }

    pub fn active_count(&self) -> usize {
        self.sessions().len()
    }

    /// Refresh heartbeats from the progress log and report sessions that
    /// stalled, crashed, or exited without publishing a signal.
    pub async fn sweep(&self) -> Vec<SessionFault> {
        let live: Vec<(TaskId, SessionId)> = self
            .sessions()
            .iter()
            .map(|(task_id, a)| (task_id.clone(), a.session.session_id))
            .collect();

        let mut faults = Vec::new();
        for (task_id, session_id) in live {
            let activity = match self.channel.last_activity(&task_id, session_id).await {
                Ok(activity) => activity,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "could not read progress log");
                    None
                }
            };

            let exited = {
                let mut sessions = self.sessions();
                let Some(active) = sessions.get_mut(&task_id) else {
                    continue;
                };
                if active.session.session_id != session_id {
                    continue;
                }
                if let Some(at) = activity {
                    active.session.touch(at);
                }
                if active.handle.as_ref().is_some_and(WorkerHandle::is_finished) {
                    active.handle.take()
                } else {
                    None
                }
            };

            if let Some(handle) = exited {
                let failure = match handle.wait().await {
                    Err(e) => Some(SessionFailure::Crashed(e)),
                    Ok(()) => match self.channel.completion(&task_id).await {
                        Ok(Some(signal)) if signal.session_id == session_id => None,
                        Ok(_) => Some(SessionFailure::NoSignal),
                        Err(e) => {
                            warn!(task_id = %task_id, error = %e, "could not read completion signal");
                            None
                        }
                    },
                };
                if let Some(failure) = failure {
                    faults.push(SessionFault {
                        task_id,
                        session_id,
                        failure,
                    });
                }
                continue;
            }

            let now = self.clock.now();
            let stalled = self
                .sessions()
                .get(&task_id)
                .filter(|a| a.session.session_id == session_id && a.handle.is_some())
                .is_some_and(|a| a.session.is_stalled(now));
            if stalled {
                faults.push(SessionFault {
                    task_id,
                    session_id,
                    failure: SessionFailure::Stalled,
                });
            }
        }
        faults
    }

    /// Stop the failed session of `task_id` and act on the decider's verdict.
    ///
    /// Returns `None` when the coordinator holds no session for the task.
    pub async fn recover(
        &self,
        task_id: &TaskId,
        failure: SessionFailure,
    ) -> Option<Recovery> {
        let mut failed = self.sessions().remove(task_id)?;
        failed.stop();
        warn!(
            task_id = %task_id,
            session_id = %failed.session.session_id,
            retry_count = failed.session.retry_count,
            failure = %failure,
            "session failed"
        );
        self.log
            .emit(SprintEvent::SessionFailed {
                task_id: task_id.clone(),
                session_id: failed.session.session_id,
                failure: failure.to_string(),
            })
            .await;

        if let Err(e) = self.channel.invalidate(task_id).await {
            warn!(task_id = %task_id, error = %e, "could not archive completion signal");
        }

        let mut session = failed.session;
        let mut failure = failure;
        loop {
            match self.decider.decide(&session, &failure) {
                Decision::Restart {
                    retry_count,
                    reason,
                } => {
                    info!(task_id = %task_id, retry_count, reason = %reason, "restarting task");
                    let mut input = failed.input.clone();
                    input.session_id = self.ids.generate_session_id();
                    input.retry_count = retry_count;
                    match self.launch(input).await {
                        Ok(next) => {
                            let restarted = next.session.clone();
                            self.sessions().insert(task_id.clone(), next);
                            self.session_started(&restarted).await;
                            return Some(Recovery::Restarted(restarted));
                        }
                        Err(e) => {
                            warn!(task_id = %task_id, retry_count, error = %e, "relaunch failed");
                            self.log
                                .emit(SprintEvent::SpawnFailed {
                                    task_id: task_id.clone(),
                                    attempt: retry_count,
                                    error: e.to_string(),
                                })
                                .await;
                            session.retry_count = retry_count;
                            failure = SessionFailure::SpawnFailed(e.to_string());
                        }
                    }
                }
                Decision::GiveUp { reason } => {
                    warn!(task_id = %task_id, reason = %reason, "giving up on task");
                    let reporter = SessionReporter::new(
                        task_id.clone(),
                        session.session_id,
                        Arc::clone(&self.channel),
                        Arc::clone(&self.clock),
                        Arc::clone(&self.ids),
                        CancelToken::new(),
                    );
                    if let Err(e) = reporter.fail(reason.clone()).await {
                        warn!(task_id = %task_id, error = %e, "could not publish failure signal");
                    }
                    return Some(Recovery::GaveUp {
                        session_id: session.session_id,
                        reason,
                    });
                }
            }
        }
    }

    /// Close the session after its success signal was accepted.
    pub async fn finish(&self, task_id: &TaskId, session_id: SessionId) -> Option<WorkSession> {
        let closed = {
            let mut sessions = self.sessions();
            match sessions.get(task_id) {
                Some(a) if a.session.session_id == session_id => sessions.remove(task_id),
                _ => None,
            }
        }?;
        self.closed(&closed.session).await;
        Some(closed.session)
    }

    /// Stop and forget the session of `task_id`, if any.
    pub async fn abandon(&self, task_id: &TaskId) -> Option<WorkSession> {
        let mut active = self.sessions().remove(task_id)?;
        active.stop();
        self.closed(&active.session).await;
        Some(active.session)
    }

    /// Cancel every live session. Returns the sessions that were closed.
    pub async fn shutdown(&self) -> Vec<WorkSession> {
        let task_ids: Vec<TaskId> = self.sessions().keys().cloned().collect();
        let mut closed = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            if let Some(session) = self.abandon(&task_id).await {
                closed.push(session);
            }
        }
        closed
    }

    async fn closed(&self, session: &WorkSession) {
        debug!(task_id = %session.task_id, session_id = %session.session_id, "session closed");
        self.log
            .emit(SprintEvent::SessionClosed {
                task_id: session.task_id.clone(),
                session_id: session.session_id,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CompletionReport, SignalStatus};
    use crate::impls::{FsProgressChannel, InProcessLauncher, MemoryEventSink, WorkerHandler};
    use crate::ports::{ManualClock, UlidGenerator, WorkerLauncher};
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    struct Hang;

    #[async_trait]
    impl WorkerHandler for Hang {
        async fn run(
            &self,
            _input: WorkerInput,
            _reporter: SessionReporter,
        ) -> Result<CompletionReport, String> {
            std::future::pending().await
        }
    }

    struct Boom;

    #[async_trait]
    impl WorkerHandler for Boom {
        async fn run(
            &self,
            _input: WorkerInput,
            _reporter: SessionReporter,
        ) -> Result<CompletionReport, String> {
            Err("segfault in codegen".to_string())
        }
    }

    /// Exits cleanly without ever publishing.
    struct Silent;

    #[async_trait]
    impl WorkerLauncher for Silent {
        async fn launch(
            &self,
            _input: WorkerInput,
            _reporter: SessionReporter,
        ) -> Result<WorkerHandle, SpawnError> {
            Ok(WorkerHandle::new(tokio::spawn(async { Ok(()) })))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        clock: ManualClock,
        channel: Arc<FsProgressChannel>,
        events: Arc<MemoryEventSink>,
        coordinator: WorkerCoordinator,
    }

    async fn fixture(launcher: Arc<dyn WorkerLauncher>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(
            FsProgressChannel::open(dir.path(), RetryPolicy::none())
                .await
                .unwrap(),
        );
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let events = Arc::new(MemoryEventSink::new());
        let mut registry = CapabilityRegistry::new();
        registry.register("db".into(), launcher).unwrap();
        let coordinator = WorkerCoordinator::new(
            registry,
            channel.clone(),
            Arc::new(clock.clone()),
            Arc::new(UlidGenerator::new(clock.clone())),
            SprintLog::new(events.clone(), Arc::new(clock.clone())),
            ConductorConfig::default(),
        );
        Fixture {
            _dir: dir,
            clock,
            channel,
            events,
            coordinator,
        }
    }

    fn task() -> Task {
        Task::new("T1", "schema", "build", "db")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn second_start_is_a_session_conflict() {
        let f = fixture(Arc::new(InProcessLauncher::new(Hang))).await;
        let first = f.coordinator.start(&task(), Vec::new()).await.unwrap();

        let err = f.coordinator.start(&task(), Vec::new()).await.unwrap_err();
        match err {
            ConductorError::SessionConflict(e) => assert_eq!(e.session_id, Some(first.session_id)),
            other => panic!("expected SessionConflict, got {other:?}"),
        }
        assert_eq!(f.coordinator.active_count(), 1);
    }

    #[tokio::test]
    async fn unknown_role_is_a_spawn_error() {
        let f = fixture(Arc::new(InProcessLauncher::new(Hang))).await;
        let err = f
            .coordinator
            .start(&Task::new("T2", "ui", "build", "frontend"), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Spawn(SpawnError::UnknownRole(_))));
        assert_eq!(f.coordinator.active_count(), 0);
    }

    #[tokio::test]
    async fn silent_session_is_reported_stalled_after_timeout() {
        let f = fixture(Arc::new(InProcessLauncher::new(Hang))).await;
        let session = f.coordinator.start(&task(), Vec::new()).await.unwrap();

        f.clock.advance(session.timeout);
        assert!(f.coordinator.sweep().await.is_empty());

        f.clock.advance(Duration::from_secs(1));
        let faults = f.coordinator.sweep().await;
        assert_eq!(
            faults,
            vec![SessionFault {
                task_id: "T1".into(),
                session_id: session.session_id,
                failure: SessionFailure::Stalled,
            }]
        );
    }

    #[tokio::test]
    async fn heartbeat_keeps_session_alive() {
        let f = fixture(Arc::new(InProcessLauncher::new(Hang))).await;
        let session = f.coordinator.start(&task(), Vec::new()).await.unwrap();

        f.clock.advance(session.timeout);
        let reporter = SessionReporter::new(
            "T1".into(),
            session.session_id,
            f.channel.clone(),
            Arc::new(f.clock.clone()),
            Arc::new(UlidGenerator::new(f.clock.clone())),
            CancelToken::new(),
        );
        reporter.heartbeat().await.unwrap();
        f.clock.advance(Duration::from_secs(1));

        assert!(f.coordinator.sweep().await.is_empty());
    }

    #[tokio::test]
    async fn crashed_worker_is_reported_with_its_error() {
        let f = fixture(Arc::new(InProcessLauncher::new(Boom))).await;
        f.coordinator.start(&task(), Vec::new()).await.unwrap();
        settle().await;

        let faults = f.coordinator.sweep().await;
        assert_eq!(faults.len(), 1);
        assert_eq!(
            faults[0].failure,
            SessionFailure::Crashed("segfault in codegen".to_string())
        );
    }

    #[tokio::test]
    async fn clean_exit_without_signal_is_a_fault() {
        let f = fixture(Arc::new(Silent)).await;
        f.coordinator.start(&task(), Vec::new()).await.unwrap();
        settle().await;

        let faults = f.coordinator.sweep().await;
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].failure, SessionFailure::NoSignal);
    }

    #[tokio::test]
    async fn recover_restarts_until_budget_then_gives_up() {
        let f = fixture(Arc::new(InProcessLauncher::new(Hang))).await;
        let first = f.coordinator.start(&task(), Vec::new()).await.unwrap();
        let id: TaskId = "T1".into();

        let mut last = first.session_id;
        for expected_retry in 1..=3 {
            match f.coordinator.recover(&id, SessionFailure::Stalled).await {
                Some(Recovery::Restarted(session)) => {
                    assert_eq!(session.retry_count, expected_retry);
                    assert_ne!(session.session_id, last);
                    last = session.session_id;
                }
                other => panic!("expected restart, got {other:?}"),
            }
        }

        let Some(Recovery::GaveUp { reason, session_id }) =
            f.coordinator.recover(&id, SessionFailure::Stalled).await
        else {
            panic!("expected give up");
        };
        assert!(reason.contains("exceeded retry budget"));
        assert_eq!(session_id, last);
        assert_eq!(f.coordinator.active_count(), 0);

        let signal = f.channel.completion(&id).await.unwrap().unwrap();
        assert_eq!(signal.status, SignalStatus::Failure);
        assert!(signal.error.unwrap().contains("exceeded retry budget"));

        let started = f
            .events
            .events()
            .iter()
            .filter(|e| matches!(e.event, SprintEvent::SessionStarted { .. }))
            .count();
        assert_eq!(started, 4);
    }

    #[tokio::test]
    async fn finish_only_closes_the_matching_session() {
        let f = fixture(Arc::new(InProcessLauncher::new(Hang))).await;
        let session = f.coordinator.start(&task(), Vec::new()).await.unwrap();
        let other = crate::domain::SessionId::from_ulid(ulid::Ulid::new());

        assert!(f.coordinator.finish(&"T1".into(), other).await.is_none());
        assert!(
            f.coordinator
                .finish(&"T1".into(), session.session_id)
                .await
                .is_some()
        );
        assert_eq!(f.coordinator.active_count(), 0);
    }
}
