//! Scheduler: the single control loop of a sprint.
//!
//! Each round:
//! 1. settles the completion signals published since the last round
//! 2. drops sessions whose task left `in_progress` behind the scheduler's
//!    back, then sweeps the rest for stalls and crashes
//! 3. fills free worker slots from the ready set, critical path first
//!
//! Between rounds it sleeps for the poll interval, or less when an
//! in-process worker publishes.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::app::{
    ConflictResolver, Recovery, SprintCounts, SprintLog, SprintStatus, TaskLifecycle,
    WorkerCoordinator,
};
use crate::config::ConductorConfig;
use crate::domain::{
    CompletionSignal, ConductorError, ConflictError, DependencyArtifact, ErrorKind, SessionFailure,
    SignalStatus, SpawnError, SprintEvent, StoreError, Task, TaskId, TaskStatus,
};
use crate::graph::DependencyGraph;
use crate::lifecycle::TransitionFields;
use crate::ports::{ProgressChannel, TaskStore};

/// Deferred reason of tasks whose session was cancelled by a shutdown.
pub const INTERRUPTED: &str = "interrupted by shutdown";

/// What happened in one round.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundReport {
    pub started: Vec<TaskId>,
    pub completed: Vec<TaskId>,
    pub restarted: Vec<TaskId>,
    pub deferred: Vec<TaskId>,
    pub spawn_failures: Vec<TaskId>,
    pub conflicts: Vec<ConflictError>,
}

impl RoundReport {
    fn absorb(&mut self, other: &RoundReport) {
        self.started.extend(other.started.iter().cloned());
        self.completed.extend(other.completed.iter().cloned());
        self.restarted.extend(other.restarted.iter().cloned());
        self.deferred.extend(other.deferred.iter().cloned());
        self.spawn_failures.extend(other.spawn_failures.iter().cloned());
        self.conflicts.extend(other.conflicts.iter().cloned());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every task is completed or deferred.
    Settled,
    /// Nothing is running and nothing can be scheduled.
    Stuck,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub rounds: u64,
    pub started: usize,
    pub completed: usize,
    pub restarts: usize,
    pub deferred: usize,
    pub counts: SprintCounts,
    pub unresolved_conflicts: Vec<ConflictError>,
    pub status: SprintStatus,
}

/// Ready tasks in dispatch order: members of the remaining critical path
/// first (in path order), then larger `estimatedEffort`, then task id.
pub fn dispatch_order(
    graph: &DependencyGraph,
    tasks: &[Task],
    statuses: &HashMap<TaskId, TaskStatus>,
    config: &ConductorConfig,
) -> Vec<TaskId> {
    let critical = graph.remaining_critical_path(
        statuses,
        config.default_effort,
        config.critical_path_tie_break,
    );
    let effort: HashMap<&TaskId, f64> = tasks
        .iter()
        .map(|t| (&t.id, t.effort_or(config.default_effort)))
        .collect();
    let effort_of = |id: &TaskId| effort.get(id).copied().unwrap_or(config.default_effort);

    let mut ready = graph.ready_set(statuses);
    ready.sort_by(|a, b| match (critical.position(a), critical.position(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => effort_of(b)
            .total_cmp(&effort_of(a))
            .then_with(|| a.cmp(b)),
    });
    ready
}

fn statuses_of(tasks: &[Task]) -> HashMap<TaskId, TaskStatus> {
    tasks.iter().map(|t| (t.id.clone(), t.status)).collect()
}

/// Errors that concern one task and must not stop the loop.
fn is_task_local(e: &ConductorError) -> bool {
    matches!(
        e.kind(),
        ErrorKind::Transition | ErrorKind::Validation | ErrorKind::SessionConflict
    ) || matches!(
        e,
        ConductorError::Store(StoreError::RevisionConflict { .. } | StoreError::TaskNotFound(_))
    )
}

pub struct Scheduler {
    sprint: String,
    store: Arc<dyn TaskStore>,
    channel: Arc<dyn ProgressChannel>,
    graph: DependencyGraph,
    lifecycle: TaskLifecycle,
    coordinator: WorkerCoordinator,
    resolver: ConflictResolver,
    log: SprintLog,
    config: ConductorConfig,
    spawn_attempts: HashMap<TaskId, u32>,
    totals: RoundReport,
    rounds: u64,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        sprint: String,
        store: Arc<dyn TaskStore>,
        channel: Arc<dyn ProgressChannel>,
        graph: DependencyGraph,
        lifecycle: TaskLifecycle,
        coordinator: WorkerCoordinator,
        resolver: ConflictResolver,
        log: SprintLog,
        config: ConductorConfig,
    ) -> Self {
        Self {
            sprint,
            store,
            channel,
            graph,
            lifecycle,
            coordinator,
            resolver,
            log,
            config,
            spawn_attempts: HashMap::new(),
            totals: RoundReport::default(),
            rounds: 0,
        }
    }

    pub fn coordinator(&self) -> &WorkerCoordinator {
        &self.coordinator
    }

    pub fn lifecycle(&self) -> &TaskLifecycle {
        &self.lifecycle
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// One scheduling round.
    pub async fn round(&mut self) -> Result<RoundReport, ConductorError> {
        self.rounds += 1;
        let mut report = RoundReport::default();

        for signal in self.channel.take_new_completions().await? {
            let (task_id, signal_id) = (signal.task_id.clone(), signal.signal_id);
            self.settle(signal, &mut report).await?;
            self.channel.mark_settled(&task_id, signal_id).await?;
        }

        self.reconcile().await?;
        for fault in self.coordinator.sweep().await {
            self.recover(&fault.task_id, fault.failure, &mut report).await?;
        }

        self.dispatch(&mut report).await?;

        debug!(
            round = self.rounds,
            started = report.started.len(),
            completed = report.completed.len(),
            restarted = report.restarted.len(),
            deferred = report.deferred.len(),
            active = self.coordinator.active_count(),
            "round finished"
        );
        self.totals.absorb(&report);
        Ok(report)
    }

    async fn settle(
        &mut self,
        signal: CompletionSignal,
        report: &mut RoundReport,
    ) -> Result<(), ConductorError> {
        let task_id = signal.task_id.clone();
        let task = match self.store.task(&task_id).await {
            Ok(task) => task,
            Err(StoreError::TaskNotFound(_)) => {
                warn!(task_id = %task_id, "completion signal for an unknown task");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match self.coordinator.session(&task_id) {
            Some(session) if session.session_id != signal.session_id => {
                debug!(
                    task_id = %task_id,
                    signal_session = %signal.session_id,
                    "ignoring signal of a superseded session"
                );
                if let Some(current) = self.channel.completion(&task_id).await?
                    && current.signal_id == signal.signal_id
                {
                    self.channel.invalidate(&task_id).await?;
                }
                return Ok(());
            }
            Some(_) if task.status != TaskStatus::InProgress => {
                self.coordinator.abandon(&task_id).await;
                return Ok(());
            }
            Some(_) => {}
            None if task.status != TaskStatus::InProgress => {
                debug!(task_id = %task_id, status = %task.status, "ignoring signal for a task not in progress");
                return Ok(());
            }
            None => {
                info!(task_id = %task_id, "settling signal of a session started elsewhere");
            }
        }

        match signal.status {
            SignalStatus::Success => {
                let fields = TransitionFields::notes(signal.completion_notes());
                match self
                    .lifecycle
                    .transition(&task_id, TaskStatus::Completed, fields)
                    .await
                {
                    Ok(_) => {
                        self.coordinator.finish(&task_id, signal.session_id).await;
                        report.completed.push(task_id.clone());
                        let merge = self.resolver.apply(&task_id, &signal.files_changed).await;
                        report.conflicts.extend(merge.conflicts);
                    }
                    Err(ConductorError::Validation(e)) => {
                        self.recover(&task_id, SessionFailure::Rejected(e.to_string()), report)
                            .await?;
                    }
                    Err(e) if is_task_local(&e) => {
                        warn!(task_id = %task_id, error = %e, "could not complete task");
                        self.coordinator.abandon(&task_id).await;
                    }
                    Err(e) => return Err(e),
                }
            }
            SignalStatus::Failure => {
                let error = signal
                    .error
                    .unwrap_or_else(|| "worker gave no error context".to_string());
                self.recover(&task_id, SessionFailure::Reported(error), report)
                    .await?;
            }
        }
        Ok(())
    }

    /// Drop sessions whose task is no longer in progress, e.g. completed
    /// or deferred by hand while the worker was running.
    async fn reconcile(&mut self) -> Result<(), ConductorError> {
        if self.coordinator.active_count() == 0 {
            return Ok(());
        }
        let statuses = statuses_of(&self.store.snapshot().await?);
        for session in self.coordinator.active_sessions() {
            let status = statuses.get(&session.task_id).copied();
            if status != Some(TaskStatus::InProgress) {
                info!(
                    task_id = %session.task_id,
                    status = ?status,
                    "task left in_progress externally, stopping its session"
                );
                self.coordinator.abandon(&session.task_id).await;
            }
        }
        Ok(())
    }

    async fn recover(
        &mut self,
        task_id: &TaskId,
        failure: SessionFailure,
        report: &mut RoundReport,
    ) -> Result<(), ConductorError> {
        match self.coordinator.recover(task_id, failure.clone()).await {
            Some(Recovery::Restarted(_)) => {
                report.restarted.push(task_id.clone());
                Ok(())
            }
            Some(Recovery::GaveUp { reason, .. }) => self.defer(task_id, reason, report).await,
            None => self.defer(task_id, failure.to_string(), report).await,
        }
    }

    async fn defer(
        &mut self,
        task_id: &TaskId,
        reason: String,
        report: &mut RoundReport,
    ) -> Result<(), ConductorError> {
        match self
            .lifecycle
            .transition(task_id, TaskStatus::Deferred, TransitionFields::reason(reason))
            .await
        {
            Ok(_) => {
                report.deferred.push(task_id.clone());
                Ok(())
            }
            Err(e) if is_task_local(&e) => {
                warn!(task_id = %task_id, error = %e, "could not defer task");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn dispatch(&mut self, report: &mut RoundReport) -> Result<(), ConductorError> {
        let free = self
            .config
            .max_parallel_workers
            .saturating_sub(self.coordinator.active_count());
        if free == 0 {
            return Ok(());
        }
        let tasks = self.store.snapshot().await?;
        let statuses = statuses_of(&tasks);
        let queue = dispatch_order(&self.graph, &tasks, &statuses, &self.config);

        let mut started = 0;
        for task_id in queue {
            if started == free {
                debug!(waiting = %task_id, "all worker slots busy");
                break;
            }
            let Some(task) = tasks.iter().find(|t| t.id == task_id) else {
                continue;
            };
            let dependencies = self.dependency_artifacts(task, &tasks).await?;
            match self.coordinator.start(task, dependencies).await {
                Ok(_) => {
                    self.spawn_attempts.remove(&task_id);
                    match self
                        .lifecycle
                        .transition(&task_id, TaskStatus::InProgress, TransitionFields::none())
                        .await
                    {
                        Ok(_) => {
                            started += 1;
                            report.started.push(task_id);
                        }
                        Err(e) => {
                            self.coordinator.abandon(&task_id).await;
                            if !is_task_local(&e) {
                                return Err(e);
                            }
                            warn!(task_id = %task_id, error = %e, "could not claim task");
                        }
                    }
                }
                Err(ConductorError::Spawn(e)) => self.spawn_failed(task_id, e, report).await?,
                Err(ConductorError::SessionConflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn spawn_failed(
        &mut self,
        task_id: TaskId,
        error: SpawnError,
        report: &mut RoundReport,
    ) -> Result<(), ConductorError> {
        let attempts = {
            let n = self.spawn_attempts.entry(task_id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        warn!(task_id = %task_id, attempt = attempts, error = %error, "worker spawn failed");
        self.log
            .emit(SprintEvent::SpawnFailed {
                task_id: task_id.clone(),
                attempt: attempts,
                error: error.to_string(),
            })
            .await;
        report.spawn_failures.push(task_id.clone());

        if attempts < self.config.max_spawn_attempts {
            return Ok(());
        }
        self.spawn_attempts.remove(&task_id);
        let reason = format!("worker spawn failed after {attempts} attempts: {error}");
        // deferred is only reachable from in_progress
        let claimed = self
            .lifecycle
            .transition(&task_id, TaskStatus::InProgress, TransitionFields::none())
            .await;
        match claimed {
            Ok(_) => self.defer(&task_id, reason, report).await,
            Err(e) if is_task_local(&e) => {
                warn!(task_id = %task_id, error = %e, "could not defer unspawnable task");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Outputs of the task's dependencies: their success signal, or their
    /// completion notes when they were completed by hand.
    async fn dependency_artifacts(
        &self,
        task: &Task,
        tasks: &[Task],
    ) -> Result<Vec<DependencyArtifact>, ConductorError> {
        let mut artifacts = Vec::with_capacity(task.dependencies.len());
        for dep in &task.dependencies {
            let signal = self.channel.completion(dep).await?;
            let artifact = match signal {
                Some(signal) if signal.status == SignalStatus::Success => {
                    DependencyArtifact::from(&signal)
                }
                _ => match tasks
                    .iter()
                    .find(|t| &t.id == dep)
                    .and_then(|t| t.completion_notes.as_ref())
                {
                    Some(notes) => DependencyArtifact::from_notes(dep.clone(), notes),
                    None => continue,
                },
            };
            artifacts.push(artifact);
        }
        Ok(artifacts)
    }

    /// Clear the conflict flag of `artifact` after manual reconciliation.
    pub async fn resolve_conflict(&mut self, artifact: &str) -> Result<bool, String> {
        self.resolver.resolve(artifact).await
    }

    pub fn has_unresolved_conflicts(&self) -> bool {
        self.resolver.has_unresolved_conflicts()
    }

    pub async fn status(&self) -> Result<SprintStatus, ConductorError> {
        let tasks = self.store.snapshot().await?;
        let mut status = SprintStatus::collect(
            self.sprint.clone(),
            &tasks,
            &self.graph,
            self.config.default_effort,
            self.config.critical_path_tie_break,
        )
        .with_sessions(self.coordinator.active_sessions())
        .with_conflicts(self.resolver.unresolved());
        for task in tasks.iter().filter(|t| t.status == TaskStatus::InProgress) {
            if let Some(entry) = self.channel.progress(&task.id).await?.pop() {
                status = status.with_progress(entry);
            }
        }
        Ok(status)
    }

    /// Cancel every live session and defer its task, so the next run can
    /// pick it up again after a `start`.
    async fn interrupt(&mut self) -> Result<(), ConductorError> {
        let mut report = RoundReport::default();
        for session in self.coordinator.shutdown().await {
            self.defer(&session.task_id, INTERRUPTED.to_string(), &mut report)
                .await?;
        }
        self.totals.absorb(&report);
        Ok(())
    }

    /// Run rounds until the sprint settles, gets stuck, or `shutdown`
    /// turns `true`. On shutdown every live session is cancelled and its
    /// task deferred.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary, ConductorError> {
        let notify = self.channel.notifier();
        let poll = self.config.poll_interval();
        info!(
            sprint = %self.sprint,
            tasks = self.graph.len(),
            max_workers = self.config.max_parallel_workers,
            poll_ms = poll.as_millis() as u64,
            "scheduler started"
        );

        let outcome = loop {
            if *shutdown.borrow() {
                break RunOutcome::Shutdown;
            }
            self.round().await?;

            let tasks = self.store.snapshot().await?;
            let counts = SprintCounts::from_tasks(&tasks);
            let idle = self.coordinator.active_count() == 0;
            if idle && counts.is_settled() {
                break RunOutcome::Settled;
            }
            if idle && self.graph.ready_set(&statuses_of(&tasks)).is_empty() {
                // in_progress tasks without a session belong to someone else
                if counts.in_progress > 0 {
                    warn!(
                        in_progress = counts.in_progress,
                        "tasks in progress with no session here; complete or defer them by hand"
                    );
                }
                break RunOutcome::Stuck;
            }

            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown_requested(&mut shutdown) => {}
            }
        };

        if outcome == RunOutcome::Shutdown {
            self.interrupt().await?;
        }
        let status = self.status().await?;
        let summary = RunSummary {
            outcome,
            rounds: self.rounds,
            started: self.totals.started.len(),
            completed: self.totals.completed.len(),
            restarts: self.totals.restarted.len(),
            deferred: self.totals.deferred.len(),
            counts: status.counts,
            unresolved_conflicts: status.unresolved_conflicts.clone(),
            status,
        };
        info!(
            outcome = ?summary.outcome,
            rounds = summary.rounds,
            completed = summary.counts.completed,
            deferred = summary.counts.deferred,
            conflicts = summary.unresolved_conflicts.len(),
            "scheduler stopped"
        );
        Ok(summary)
    }
}

/// Resolves once shutdown is requested. A dropped sender never requests it.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
