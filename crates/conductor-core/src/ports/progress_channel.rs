//! ProgressChannel port: how workers talk back to the orchestrator.
//!
//! Two streams, kept apart:
//! - an append-only, advisory progress log per task
//! - at most one immutable completion signal per task
//!
//! A published signal is never observed half-written, and
//! [`ProgressChannel::take_new_completions`] hands each one out exactly once.
//! Once the consumer has acted on a signal it marks it settled; settled
//! signals stay readable through [`ProgressChannel::completion`] but are not
//! handed out again, not even to a channel opened later on the same state.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::domain::{CompletionSignal, IpcError, ProgressEntry, SessionId, SignalId, TaskId};

#[async_trait]
pub trait ProgressChannel: Send + Sync {
    async fn append_progress(&self, entry: &ProgressEntry) -> Result<(), IpcError>;

    /// Full progress log of a task, oldest first.
    async fn progress(&self, task_id: &TaskId) -> Result<Vec<ProgressEntry>, IpcError>;

    /// Newest progress or heartbeat written by `session_id`.
    async fn last_activity(
        &self,
        task_id: &TaskId,
        session_id: SessionId,
    ) -> Result<Option<DateTime<Utc>>, IpcError>;

    /// Publish the terminal record for a task. Fails with
    /// [`IpcError::AlreadyPublished`] while an earlier signal is in place.
    async fn publish_completion(&self, signal: &CompletionSignal) -> Result<(), IpcError>;

    /// Current signal of a task, if any.
    async fn completion(&self, task_id: &TaskId) -> Result<Option<CompletionSignal>, IpcError>;

    /// Signals published since the last call that are not settled yet.
    async fn take_new_completions(&self) -> Result<Vec<CompletionSignal>, IpcError>;

    /// Record that a taken signal has been acted on. Idempotent.
    async fn mark_settled(&self, task_id: &TaskId, signal_id: SignalId) -> Result<(), IpcError>;

    /// Archive the current signal of a task so a new session can publish.
    /// Returns `false` when there was nothing to archive.
    async fn invalidate(&self, task_id: &TaskId) -> Result<bool, IpcError>;

    /// Woken after every in-process publish. Writers in other processes are
    /// only seen by polling.
    fn notifier(&self) -> Arc<Notify>;
}
