//! Subprocess workers.
//!
//! The worker gets its input as a JSON file and reports through the
//! file-based channel directory, both named by environment variables:
//!
//! | variable                | value                               |
//! |-------------------------|-------------------------------------|
//! | `CONDUCTOR_TASK_ID`     | task id                             |
//! | `CONDUCTOR_SESSION_ID`  | session id                          |
//! | `CONDUCTOR_CHANNEL_DIR` | state directory holding the channel |
//! | `CONDUCTOR_INPUT`       | path of `inputs/<sessionId>.json`   |
//!
//! The input file is removed once the process has exited or been killed.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::domain::{RoleCommand, SpawnError};
use crate::ports::{SessionReporter, WorkerHandle, WorkerInput, WorkerLauncher};

pub const ENV_TASK_ID: &str = "CONDUCTOR_TASK_ID";
pub const ENV_SESSION_ID: &str = "CONDUCTOR_SESSION_ID";
pub const ENV_CHANNEL_DIR: &str = "CONDUCTOR_CHANNEL_DIR";
pub const ENV_INPUT: &str = "CONDUCTOR_INPUT";

/// Bytes of stderr kept as error context for a failed run.
const STDERR_TAIL: usize = 2_048;

pub struct CommandLauncher {
    command: RoleCommand,
    state_dir: PathBuf,
    working_dir: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new(command: RoleCommand, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            state_dir: state_dir.into(),
            working_dir: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    async fn write_input(&self, input: &WorkerInput) -> Result<PathBuf, String> {
        let dir = self.state_dir.join("inputs");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("create {}: {e}", dir.display()))?;
        let path = dir.join(format!("{}.json", input.session_id));
        let json = serde_json::to_vec_pretty(input).map_err(|e| e.to_string())?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| format!("write {}: {e}", path.display()))?;
        Ok(path)
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(
        &self,
        input: WorkerInput,
        reporter: SessionReporter,
    ) -> Result<WorkerHandle, SpawnError> {
        let role = input.assigned_role.clone();
        let launch_error = |message: String| SpawnError::Launch {
            role: role.clone(),
            message,
        };

        let input_path = self.write_input(&input).await.map_err(launch_error)?;

        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .envs(&self.command.env)
            .env(ENV_TASK_ID, input.task_id.as_str())
            .env(ENV_SESSION_ID, input.session_id.to_string())
            .env(ENV_CHANNEL_DIR, &self.state_dir)
            .env(ENV_INPUT, &input_path)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                remove_input(&input_path).await;
                return Err(launch_error(format!("{}: {e}", self.command.program)));
            }
        };
        debug!(
            task_id = %input.task_id,
            session_id = %input.session_id,
            pid = child.id(),
            "worker process started"
        );

        let stderr = child.stderr.take();
        let cancel = reporter.cancel_token().clone();
        let task_id = input.task_id;
        let join = tokio::spawn(async move {
            let tail = tokio::spawn(read_tail(stderr));
            let status = tokio::select! {
                _ = cancel.cancelled() => None,
                status = child.wait() => Some(status),
            };
            let Some(status) = status else {
                if let Err(e) = child.kill().await {
                    warn!(task_id = %task_id, error = %e, "could not kill worker process");
                }
                remove_input(&input_path).await;
                return Ok(());
            };
            remove_input(&input_path).await;
            let tail = tail.await.unwrap_or_default();
            match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) if tail.is_empty() => Err(format!("worker exited with {status}")),
                Ok(status) => Err(format!("worker exited with {status}: {tail}")),
                Err(e) => Err(format!("could not wait for worker: {e}")),
            }
        });
        Ok(WorkerHandle::new(join))
    }
}

async fn remove_input(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "could not remove worker input");
    }
}

/// Last [`STDERR_TAIL`] bytes of the stream, trimmed. Older output is
/// dropped as it arrives.
async fn read_tail(stderr: Option<tokio::process::ChildStderr>) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };
    let mut tail = Vec::with_capacity(2 * STDERR_TAIL);
    let mut chunk = [0u8; 1024];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > STDERR_TAIL {
                    tail.drain(..tail.len() - STDERR_TAIL);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).trim().to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::{SessionId, Task};
    use crate::impls::FsProgressChannel;
    use crate::ports::{CancelToken, SystemClock, UlidGenerator};
    use crate::retry::RetryPolicy;
    use std::sync::Arc;
    use ulid::Ulid;

    async fn launch(
        dir: &std::path::Path,
        command: RoleCommand,
    ) -> (WorkerHandle, CancelToken, SessionId) {
        let channel = FsProgressChannel::open(dir, RetryPolicy::none())
            .await
            .unwrap();
        let session_id = SessionId::from_ulid(Ulid::new());
        let cancel = CancelToken::new();
        let reporter = SessionReporter::new(
            "T1".into(),
            session_id,
            Arc::new(channel),
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
            cancel.clone(),
        );
        let task = Task::new("T1", "schema", "build", "sh");
        let handle = CommandLauncher::new(command, dir)
            .launch(WorkerInput::new(&task, session_id, 0, Vec::new()), reporter)
            .await
            .unwrap();
        (handle, cancel, session_id)
    }

    #[tokio::test]
    async fn worker_sees_its_input_file_until_it_exits() {
        let dir = tempfile::tempdir().unwrap();
        let command = RoleCommand::new("sh").arg("-c").arg(
            "test \"$CONDUCTOR_TASK_ID\" = T1 && cp \"$CONDUCTOR_INPUT\" \"$CONDUCTOR_CHANNEL_DIR/seen.json\"",
        );
        let (handle, _, session_id) = launch(dir.path(), command).await;

        assert_eq!(handle.wait().await, Ok(()));
        let text = std::fs::read_to_string(dir.path().join("seen.json")).unwrap();
        assert!(text.contains("\"taskId\": \"T1\""));
        let input = dir.path().join("inputs").join(format!("{session_id}.json"));
        assert!(!input.exists());
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let command = RoleCommand::new("sh")
            .arg("-c")
            .arg("echo 'migration failed' >&2; exit 3");
        let (handle, _, _) = launch(dir.path(), command).await;

        let err = handle.wait().await.unwrap_err();
        assert!(err.contains("migration failed"), "{err}");
    }

    #[tokio::test]
    async fn chatty_stderr_keeps_only_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let command = RoleCommand::new("sh").arg("-c").arg(
            "head -c 1000000 /dev/zero | tr '\\0' x >&2; echo 'final words' >&2; exit 1",
        );
        let (handle, _, _) = launch(dir.path(), command).await;

        let err = handle.wait().await.unwrap_err();
        assert!(err.ends_with("final words"), "{err}");
        assert!(err.len() < STDERR_TAIL + 64);
    }

    #[tokio::test]
    async fn cancel_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let command = RoleCommand::new("sh").arg("-c").arg("sleep 30");
        let (handle, cancel, _) = launch(dir.path(), command).await;

        cancel.cancel();
        let exit = tokio::time::timeout(std::time::Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert_eq!(exit, Ok(()));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FsProgressChannel::open(dir.path(), RetryPolicy::none())
            .await
            .unwrap();
        let session_id = SessionId::from_ulid(Ulid::new());
        let reporter = SessionReporter::new(
            "T1".into(),
            session_id,
            Arc::new(channel),
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
            CancelToken::new(),
        );
        let task = Task::new("T1", "schema", "build", "sh");
        let err = CommandLauncher::new(RoleCommand::new("/nonexistent/worker"), dir.path())
            .launch(WorkerInput::new(&task, session_id, 0, Vec::new()), reporter)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SpawnError::Launch { .. }));
    }
}
