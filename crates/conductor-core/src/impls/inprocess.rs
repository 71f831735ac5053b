//! In-process workers: one tokio task per session.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{CompletionReport, SpawnError};
use crate::ports::{SessionReporter, WorkerHandle, WorkerInput, WorkerLauncher};

/// Worker logic run inside the orchestrator process.
///
/// Returning `Ok` publishes a success signal with the report. Returning
/// `Err` counts as a crash. Long-running handlers should call
/// [`SessionReporter::heartbeat`] or [`SessionReporter::progress`] so the
/// session is not considered stalled.
#[async_trait]
pub trait WorkerHandler: Send + Sync {
    async fn run(
        &self,
        input: WorkerInput,
        reporter: SessionReporter,
    ) -> Result<CompletionReport, String>;
}

pub struct InProcessLauncher {
    handler: Arc<dyn WorkerHandler>,
}

impl InProcessLauncher {
    pub fn new(handler: impl WorkerHandler + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    pub fn from_arc(handler: Arc<dyn WorkerHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(
        &self,
        input: WorkerInput,
        reporter: SessionReporter,
    ) -> Result<WorkerHandle, SpawnError> {
        let handler = Arc::clone(&self.handler);
        let cancel = reporter.cancel_token().clone();
        let join = tokio::spawn(async move {
            let task_id = input.task_id.clone();
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(task_id = %task_id, "in-process worker cancelled");
                    Ok(())
                }
                result = handler.run(input, reporter.clone()) => match result {
                    Ok(report) => reporter
                        .complete(report)
                        .await
                        .map_err(|e| format!("could not publish completion: {e}")),
                    Err(e) => Err(e),
                },
            }
        });
        Ok(WorkerHandle::new(join))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SessionId, SignalStatus, Task};
    use crate::impls::FsProgressChannel;
    use crate::ports::{CancelToken, ProgressChannel, SystemClock, UlidGenerator};
    use crate::retry::RetryPolicy;
    use ulid::Ulid;

    struct Echo;

    #[async_trait]
    impl WorkerHandler for Echo {
        async fn run(
            &self,
            input: WorkerInput,
            reporter: SessionReporter,
        ) -> Result<CompletionReport, String> {
            reporter.progress(50, "halfway").await.map_err(|e| e.to_string())?;
            Ok(CompletionReport::new(format!("did {}", input.name)))
        }
    }

    struct Forever;

    #[async_trait]
    impl WorkerHandler for Forever {
        async fn run(
            &self,
            _input: WorkerInput,
            _reporter: SessionReporter,
        ) -> Result<CompletionReport, String> {
            std::future::pending().await
        }
    }

    async fn setup() -> (tempfile::TempDir, Arc<FsProgressChannel>) {
        let dir = tempfile::tempdir().unwrap();
        let channel = FsProgressChannel::open(dir.path(), RetryPolicy::none())
            .await
            .unwrap();
        (dir, Arc::new(channel))
    }

    fn reporter(channel: Arc<FsProgressChannel>, session_id: SessionId) -> SessionReporter {
        SessionReporter::new(
            "T1".into(),
            session_id,
            channel,
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
            CancelToken::new(),
        )
    }

    #[tokio::test]
    async fn successful_handler_publishes_signal() {
        let (_dir, channel) = setup().await;
        let session_id = SessionId::from_ulid(Ulid::new());
        let task = Task::new("T1", "schema", "build", "db");
        let input = WorkerInput::new(&task, session_id, 0, Vec::new());

        let handle = InProcessLauncher::new(Echo)
            .launch(input, reporter(Arc::clone(&channel), session_id))
            .await
            .unwrap();
        assert_eq!(handle.wait().await, Ok(()));

        let signal = channel.completion(&"T1".into()).await.unwrap().unwrap();
        assert_eq!(signal.status, SignalStatus::Success);
        assert_eq!(signal.summary.as_deref(), Some("did schema"));
        assert_eq!(signal.session_id, session_id);
        assert_eq!(channel.progress(&"T1".into()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_stops_a_running_handler() {
        let (_dir, channel) = setup().await;
        let session_id = SessionId::from_ulid(Ulid::new());
        let task = Task::new("T1", "schema", "build", "db");
        let reporter = reporter(Arc::clone(&channel), session_id);
        let cancel = reporter.cancel_token().clone();

        let handle = InProcessLauncher::new(Forever)
            .launch(WorkerInput::new(&task, session_id, 0, Vec::new()), reporter)
            .await
            .unwrap();
        cancel.cancel();
        assert_eq!(handle.wait().await, Ok(()));
        assert!(channel.completion(&"T1".into()).await.unwrap().is_none());
    }
}
