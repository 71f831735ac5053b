//! File-based progress channel.
//!
//! Layout under the state directory:
//!
//! ```text
//! progress/<taskId>.jsonl                  append-only progress log
//! signals/<taskId>.json                    current completion signal
//! signals/invalidated/<taskId>-<id>.json   archived signals of retried sessions
//! signals/settled/<taskId>-<id>            marker: the scheduler acted on it
//! ```
//!
//! A signal is written to a hidden temp file and then hard-linked into
//! place. The link either appears complete or not at all, and it fails when
//! a signal already exists, so a second publish cannot clobber the first.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::domain::{CompletionSignal, IpcError, ProgressEntry, SessionId, SignalId, TaskId};
use crate::ports::{Clock, ProgressChannel, SystemClock};
use crate::retry::RetryPolicy;

pub struct FsProgressChannel {
    root: PathBuf,
    retry: RetryPolicy,
    seen: Mutex<HashSet<SignalId>>,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl FsProgressChannel {
    /// Create the channel directories under `root` if needed.
    pub async fn open(root: impl Into<PathBuf>, retry: RetryPolicy) -> Result<Self, IpcError> {
        let root = root.into();
        for dir in [
            root.join("progress"),
            root.join("signals").join("invalidated"),
            root.join("signals").join("settled"),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| io_error("create_dir", &dir, e))?;
        }
        Ok(Self {
            root,
            retry,
            seen: Mutex::new(HashSet::new()),
            notify: Arc::new(Notify::new()),
            clock: Arc::new(SystemClock),
        })
    }

    /// Clock used to name archives of unreadable signals.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn progress_path(&self, task_id: &TaskId) -> PathBuf {
        self.root
            .join("progress")
            .join(format!("{}.jsonl", task_id.as_str()))
    }

    fn signals_dir(&self) -> PathBuf {
        self.root.join("signals")
    }

    fn signal_path(&self, task_id: &TaskId) -> PathBuf {
        self.signals_dir().join(format!("{}.json", task_id.as_str()))
    }

    fn settled_path(&self, task_id: &TaskId, signal_id: SignalId) -> PathBuf {
        self.signals_dir()
            .join("settled")
            .join(format!("{}-{}", task_id.as_str(), signal_id))
    }

    async fn is_settled(&self, signal: &CompletionSignal) -> Result<bool, IpcError> {
        let marker = &self.settled_path(&signal.task_id, signal.signal_id);
        self.retry
            .run("check_settled", move || async move {
                tokio::fs::try_exists(marker)
                    .await
                    .map_err(|e| io_error("check_settled", marker, e))
            })
            .await
    }
}

fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> IpcError {
    IpcError::Io {
        op,
        path: path.display().to_string(),
        source,
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, IpcError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error("read", path, e)),
    }
}

fn parse_signal(path: &Path, text: &str) -> Result<CompletionSignal, IpcError> {
    serde_json::from_str(text).map_err(|e| IpcError::Corrupt {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Progress lines that do not parse (a line being appended right now, or
/// foreign garbage) are skipped: progress is advisory.
fn parse_progress(path: &Path, text: &str) -> Vec<ProgressEntry> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping unreadable progress line");
                None
            }
        })
        .collect()
}

#[async_trait]
impl ProgressChannel for FsProgressChannel {
    async fn append_progress(&self, entry: &ProgressEntry) -> Result<(), IpcError> {
        let path = self.progress_path(&entry.task_id);
        let mut line = serde_json::to_string(entry).map_err(|e| IpcError::Corrupt {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        line.push('\n');

        let path = &path;
        let line = &line;
        self.retry
            .run("append_progress", move || async move {
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| io_error("append_progress", path, e))?;
                file.write_all(line.as_bytes())
                    .await
                    .map_err(|e| io_error("append_progress", path, e))?;
                file.flush()
                    .await
                    .map_err(|e| io_error("append_progress", path, e))
            })
            .await
    }

    async fn progress(&self, task_id: &TaskId) -> Result<Vec<ProgressEntry>, IpcError> {
        let path = &self.progress_path(task_id);
        let text = self
            .retry
            .run("read_progress", move || async move { read_optional(path).await })
            .await?;
        Ok(text.map(|t| parse_progress(path, &t)).unwrap_or_default())
    }

    async fn last_activity(
        &self,
        task_id: &TaskId,
        session_id: SessionId,
    ) -> Result<Option<DateTime<Utc>>, IpcError> {
        Ok(self
            .progress(task_id)
            .await?
            .into_iter()
            .filter(|entry| entry.session_id == session_id)
            .map(|entry| entry.timestamp)
            .max())
    }

    async fn publish_completion(&self, signal: &CompletionSignal) -> Result<(), IpcError> {
        let target = &self.signal_path(&signal.task_id);
        let tmp = &self
            .signals_dir()
            .join(format!(".{}.tmp", signal.signal_id));
        let body = &serde_json::to_vec_pretty(signal).map_err(|e| IpcError::Corrupt {
            path: target.display().to_string(),
            message: e.to_string(),
        })?;

        self.retry
            .run("write_signal", move || async move {
                let mut file = tokio::fs::File::create(tmp)
                    .await
                    .map_err(|e| io_error("write_signal", tmp, e))?;
                file.write_all(body)
                    .await
                    .map_err(|e| io_error("write_signal", tmp, e))?;
                file.sync_all()
                    .await
                    .map_err(|e| io_error("write_signal", tmp, e))
            })
            .await?;

        let linked = tokio::fs::hard_link(tmp, target).await;
        if let Err(e) = tokio::fs::remove_file(tmp).await {
            debug!(path = %tmp.display(), error = %e, "could not remove signal temp file");
        }
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(IpcError::AlreadyPublished(signal.task_id.clone()));
            }
            Err(e) => return Err(io_error("publish_signal", target, e)),
        }

        debug!(task_id = %signal.task_id, signal_id = %signal.signal_id, "completion signal published");
        self.notify.notify_one();
        Ok(())
    }

    async fn completion(&self, task_id: &TaskId) -> Result<Option<CompletionSignal>, IpcError> {
        let path = &self.signal_path(task_id);
        let text = self
            .retry
            .run("read_signal", move || async move { read_optional(path).await })
            .await?;
        text.map(|t| parse_signal(path, &t)).transpose()
    }

    async fn take_new_completions(&self) -> Result<Vec<CompletionSignal>, IpcError> {
        let dir = &self.signals_dir();
        let paths = self
            .retry
            .run("list_signals", move || async move {
                let mut entries = tokio::fs::read_dir(dir)
                    .await
                    .map_err(|e| io_error("list_signals", dir, e))?;
                let mut paths = Vec::new();
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| io_error("list_signals", dir, e))?
                {
                    let path = entry.path();
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if !name.starts_with('.') && name.ends_with(".json") {
                        paths.push(path);
                    }
                }
                Ok(paths)
            })
            .await?;

        let mut fresh = Vec::new();
        for path in paths {
            // A signal may be invalidated between listing and reading.
            let Some(text) = read_optional(&path).await? else {
                continue;
            };
            let signal = match parse_signal(&path, &text) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(error = %e, "ignoring unreadable completion signal");
                    continue;
                }
            };
            if self.is_settled(&signal).await? {
                continue;
            }
            let is_new = self
                .seen
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(signal.signal_id);
            if is_new {
                fresh.push(signal);
            }
        }
        fresh.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.signal_id.cmp(&b.signal_id))
        });
        Ok(fresh)
    }

    async fn mark_settled(&self, task_id: &TaskId, signal_id: SignalId) -> Result<(), IpcError> {
        let marker = &self.settled_path(task_id, signal_id);
        self.retry
            .run("mark_settled", move || async move {
                let created = tokio::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(marker)
                    .await;
                match created {
                    Ok(_) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
                    Err(e) => Err(io_error("mark_settled", marker, e)),
                }
            })
            .await
    }

    async fn invalidate(&self, task_id: &TaskId) -> Result<bool, IpcError> {
        let path = &self.signal_path(task_id);
        let text = self
            .retry
            .run("read_signal", move || async move { read_optional(path).await })
            .await?;
        let Some(text) = text else {
            return Ok(false);
        };
        let suffix = match parse_signal(path, &text) {
            Ok(signal) => signal.signal_id.to_string(),
            Err(_) => self.clock.now().timestamp_millis().to_string(),
        };
        let archived = &self
            .signals_dir()
            .join("invalidated")
            .join(format!("{}-{suffix}.json", task_id.as_str()));
        let moved = self
            .retry
            .run("invalidate_signal", move || async move {
                match tokio::fs::rename(path, archived).await {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(io_error("invalidate_signal", path, e)),
                }
            })
            .await?;
        if moved {
            debug!(task_id = %task_id, archived = %archived.display(), "completion signal invalidated");
        }
        Ok(moved)
    }

    fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SignalStatus;
    use crate::ports::ManualClock;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn signal(task: &str) -> CompletionSignal {
        CompletionSignal {
            signal_id: SignalId::from_ulid(Ulid::new()),
            task_id: TaskId::new(task),
            session_id: SessionId::from_ulid(Ulid::new()),
            status: SignalStatus::Success,
            summary: Some("done".into()),
            files_changed: Vec::new(),
            design_decisions: Vec::new(),
            next_tasks: Vec::new(),
            testing: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    async fn channel() -> (tempfile::TempDir, FsProgressChannel) {
        let dir = tempfile::tempdir().unwrap();
        let channel = FsProgressChannel::open(dir.path(), RetryPolicy::none())
            .await
            .unwrap();
        (dir, channel)
    }

    #[tokio::test]
    async fn signals_are_taken_exactly_once() {
        let (_dir, channel) = channel().await;
        let s = signal("T1");
        channel.publish_completion(&s).await.unwrap();

        let first = channel.take_new_completions().await.unwrap();
        assert_eq!(first, vec![s.clone()]);
        assert!(channel.take_new_completions().await.unwrap().is_empty());
        assert_eq!(channel.completion(&"T1".into()).await.unwrap(), Some(s));
    }

    #[tokio::test]
    async fn second_publish_needs_invalidation() {
        let (dir, channel) = channel().await;
        let first = signal("T1");
        channel.publish_completion(&first).await.unwrap();

        let err = channel.publish_completion(&signal("T1")).await.unwrap_err();
        assert!(matches!(err, IpcError::AlreadyPublished(_)));

        assert!(channel.invalidate(&"T1".into()).await.unwrap());
        assert!(!channel.invalidate(&"T1".into()).await.unwrap());
        let archived = dir
            .path()
            .join("signals/invalidated")
            .join(format!("T1-{}.json", first.signal_id));
        assert!(archived.exists());

        let retry = signal("T1");
        channel.publish_completion(&retry).await.unwrap();
        assert_eq!(channel.take_new_completions().await.unwrap(), vec![retry]);
    }

    #[tokio::test]
    async fn settled_signals_are_not_handed_out_by_a_reopened_channel() {
        let (dir, first) = channel().await;
        let settled = signal("T1");
        let pending = signal("T2");
        first.publish_completion(&settled).await.unwrap();
        first.publish_completion(&pending).await.unwrap();
        assert_eq!(first.take_new_completions().await.unwrap().len(), 2);
        first
            .mark_settled(&settled.task_id, settled.signal_id)
            .await
            .unwrap();
        first
            .mark_settled(&settled.task_id, settled.signal_id)
            .await
            .unwrap();

        let second = FsProgressChannel::open(dir.path(), RetryPolicy::none())
            .await
            .unwrap();
        assert_eq!(second.take_new_completions().await.unwrap(), vec![pending]);
        assert_eq!(second.completion(&"T1".into()).await.unwrap(), Some(settled));
    }

    #[tokio::test]
    async fn unreadable_signal_is_archived_under_the_clock_time() {
        let dir = tempfile::tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let channel = FsProgressChannel::open(dir.path(), RetryPolicy::none())
            .await
            .unwrap()
            .with_clock(Arc::new(ManualClock::new(at)));
        std::fs::write(dir.path().join("signals/T1.json"), "{not json").unwrap();

        assert!(channel.invalidate(&"T1".into()).await.unwrap());
        let archived = dir
            .path()
            .join("signals/invalidated")
            .join(format!("T1-{}.json", at.timestamp_millis()));
        assert!(archived.exists());
        assert!(channel.completion(&"T1".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_temp_files_are_left_behind() {
        let (dir, channel) = channel().await;
        channel.publish_completion(&signal("T1")).await.unwrap();
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir.path().join("signals")).unwrap() {
            names.push(entry.unwrap().file_name().to_string_lossy().into_owned());
        }
        names.sort();
        assert_eq!(
            names,
            vec![
                "T1.json".to_string(),
                "invalidated".to_string(),
                "settled".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn progress_is_per_session_and_tolerates_torn_lines() {
        let (dir, channel) = channel().await;
        let task = TaskId::new("T1");
        let s1 = SessionId::from_ulid(Ulid::new());
        let s2 = SessionId::from_ulid(Ulid::new());
        let t0 = Utc::now();

        channel
            .append_progress(&ProgressEntry::progress(task.clone(), s1, t0, 10, "start"))
            .await
            .unwrap();
        channel
            .append_progress(&ProgressEntry::heartbeat(
                task.clone(),
                s2,
                t0 + chrono::Duration::seconds(5),
            ))
            .await
            .unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("progress/T1.jsonl"))
            .and_then(|mut f| std::io::Write::write_all(&mut f, b"{\"taskId\": \"T1\", \"ses"))
            .unwrap();

        assert_eq!(channel.progress(&task).await.unwrap().len(), 2);
        assert_eq!(channel.last_activity(&task, s1).await.unwrap(), Some(t0));
        assert_eq!(
            channel.last_activity(&task, s2).await.unwrap(),
            Some(t0 + chrono::Duration::seconds(5))
        );
    }

    #[tokio::test]
    async fn publish_wakes_the_notifier() {
        let (_dir, channel) = channel().await;
        let notify = channel.notifier();
        channel.publish_completion(&signal("T1")).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), notify.notified())
            .await
            .unwrap();
    }
}
