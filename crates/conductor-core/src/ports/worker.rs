//! Worker port: launching workers and the handle a worker reports through.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::{
    CompletionReport, CompletionSignal, DependencyArtifact, IpcError, ProgressEntry, RoleTag,
    SessionId, SignalStatus, SpawnError, Task, TaskId,
};
use crate::ports::{Clock, IdGenerator, ProgressChannel};

/// Payload handed to a worker: the task plus what its dependencies produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInput {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub name: String,
    pub phase: String,
    pub assigned_role: RoleTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_effort: Option<f64>,
    pub retry_count: u32,
    #[serde(default)]
    pub dependencies: Vec<DependencyArtifact>,
}

impl WorkerInput {
    pub fn new(
        task: &Task,
        session_id: SessionId,
        retry_count: u32,
        dependencies: Vec<DependencyArtifact>,
    ) -> Self {
        Self {
            task_id: task.id.clone(),
            session_id,
            name: task.name.clone(),
            phase: task.phase.clone(),
            assigned_role: task.assigned_role.clone(),
            description: task.description.clone(),
            estimated_effort: task.estimated_effort,
            retry_count,
            dependencies,
        }
    }
}

/// Per-session cancellation. Cancelling is sticky and best-effort: the
/// worker only stops when it next awaits [`CancelToken::cancelled`] or is
/// killed by its launcher.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        // ignore send error: no receiver left means nobody is listening
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a worker needs to report on one session.
#[derive(Clone)]
pub struct SessionReporter {
    task_id: TaskId,
    session_id: SessionId,
    channel: Arc<dyn ProgressChannel>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    cancel: CancelToken,
}

impl SessionReporter {
    pub fn new(
        task_id: TaskId,
        session_id: SessionId,
        channel: Arc<dyn ProgressChannel>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            task_id,
            session_id,
            channel,
            clock,
            ids,
            cancel,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub async fn progress(&self, percent: u8, message: impl Into<String>) -> Result<(), IpcError> {
        let entry = ProgressEntry::progress(
            self.task_id.clone(),
            self.session_id,
            self.clock.now(),
            percent,
            message,
        );
        self.channel.append_progress(&entry).await
    }

    pub async fn heartbeat(&self) -> Result<(), IpcError> {
        let entry = ProgressEntry::heartbeat(self.task_id.clone(), self.session_id, self.clock.now());
        self.channel.append_progress(&entry).await
    }

    /// Publish a `success` signal carrying the report.
    pub async fn complete(&self, report: CompletionReport) -> Result<(), IpcError> {
        let mut signal = self.signal(SignalStatus::Success);
        signal.summary = Some(report.summary);
        signal.files_changed = report.files_changed;
        signal.design_decisions = report.design_decisions;
        signal.next_tasks = report.next_tasks;
        signal.testing = report.testing;
        self.channel.publish_completion(&signal).await
    }

    /// Publish a `failure` signal with the error context.
    pub async fn fail(&self, error: impl Into<String>) -> Result<(), IpcError> {
        let mut signal = self.signal(SignalStatus::Failure);
        signal.error = Some(error.into());
        self.channel.publish_completion(&signal).await
    }

    fn signal(&self, status: SignalStatus) -> CompletionSignal {
        CompletionSignal {
            signal_id: self.ids.generate_signal_id(),
            task_id: self.task_id.clone(),
            session_id: self.session_id,
            status,
            summary: None,
            files_changed: Vec::new(),
            design_decisions: Vec::new(),
            next_tasks: Vec::new(),
            testing: None,
            error: None,
            timestamp: self.clock.now(),
        }
    }
}

/// How a worker run ended. `Err` carries the captured error context.
pub type WorkerExit = Result<(), String>;

/// Handle on a launched worker.
pub struct WorkerHandle {
    join: JoinHandle<WorkerExit>,
}

impl WorkerHandle {
    pub fn new(join: JoinHandle<WorkerExit>) -> Self {
        Self { join }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the worker. A panic or abort counts as a crash.
    pub async fn wait(self) -> WorkerExit {
        match self.join.await {
            Ok(exit) => exit,
            Err(e) if e.is_cancelled() => Err("worker task was aborted".to_string()),
            Err(e) => Err(format!("worker task panicked: {e}")),
        }
    }

    pub fn abort(&self) {
        self.join.abort();
    }
}

/// Starts a worker for one session.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        input: WorkerInput,
        reporter: SessionReporter,
    ) -> Result<WorkerHandle, SpawnError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a worker is already registered for role '{0}'")]
    DuplicateRole(RoleTag),
}

/// Capability registry: role tag -> launcher.
///
/// Built during initialization, read-only afterwards. Assignment is a
/// direct lookup on the task's `assignedRole`.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    launchers: BTreeMap<RoleTag, Arc<dyn WorkerLauncher>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        role: RoleTag,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<(), RegistryError> {
        if self.launchers.contains_key(&role) {
            return Err(RegistryError::DuplicateRole(role));
        }
        self.launchers.insert(role, launcher);
        Ok(())
    }

    pub fn resolve(&self, role: &RoleTag) -> Result<Arc<dyn WorkerLauncher>, SpawnError> {
        self.launchers
            .get(role)
            .cloned()
            .ok_or_else(|| SpawnError::UnknownRole(role.clone()))
    }

    pub fn roles(&self) -> impl Iterator<Item = &RoleTag> {
        self.launchers.keys()
    }

    pub fn len(&self) -> usize {
        self.launchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.launchers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverLaunches;

    #[async_trait]
    impl WorkerLauncher for NeverLaunches {
        async fn launch(
            &self,
            input: WorkerInput,
            _reporter: SessionReporter,
        ) -> Result<WorkerHandle, SpawnError> {
            Err(SpawnError::Launch {
                role: input.assigned_role,
                message: "disabled".into(),
            })
        }
    }

    #[test]
    fn duplicate_role_is_rejected() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(RoleTag::new("api"), Arc::new(NeverLaunches))
            .unwrap();
        let err = registry
            .register(RoleTag::new("api"), Arc::new(NeverLaunches))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateRole(RoleTag::new("api")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_role_is_a_spawn_error() {
        let registry = CapabilityRegistry::new();
        let err = registry.resolve(&RoleTag::new("ui")).err().unwrap();
        assert_eq!(err, SpawnError::UnknownRole(RoleTag::new("ui")));
    }

    #[tokio::test]
    async fn cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let join = tokio::spawn(async move { waiter.cancelled().await });
        assert!(!token.is_cancelled());
        token.cancel();
        join.await.unwrap();
        assert!(token.is_cancelled());
    }
}
