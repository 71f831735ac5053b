//! TaskStore backed by the sprint definition file itself.
//!
//! The file stays the source of truth: every call re-reads it, so edits
//! made by another process (a `conductor complete` run while the scheduler
//! is active) are picked up. Writes go to a temp file that is renamed over
//! the original, then the file is read back and checked before returning.
//!
//! The whole read-check-write-read-back cycle runs under an advisory lock
//! on a sidecar `.<name>.lock` file, so writers in different processes
//! cannot overwrite each other's records.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs4::fs_std::FileExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{SprintDefinition, StoreError, Task, TaskId, ValidationError};
use crate::impls::memory_store::replace_checked;
use crate::lifecycle::LifecycleValidator;
use crate::ports::TaskStore;

pub struct FileTaskStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles inside this process.
    write_lock: Mutex<()>,
}

impl FileTaskStore {
    /// Open a sprint file, failing early when it does not validate.
    pub async fn open(path: impl Into<PathBuf>) -> Result<(Self, SprintDefinition), StoreError> {
        let store = Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        };
        let definition = store.definition().await?;
        Ok((store, definition))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current content of the sprint file.
    pub async fn definition(&self) -> Result<SprintDefinition, StoreError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(SprintDefinition::parse(&text)?)
    }

    async fn write_definition(&self, definition: &SprintDefinition) -> Result<(), StoreError> {
        let yaml = definition.to_yaml().map_err(|e| StoreError::Parse {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        let tmp = sidecar_path(&self.path, "tmp");
        tokio::fs::write(&tmp, yaml)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))
    }

    /// Blocks (off the runtime threads) until no other process holds the
    /// sprint file. The lock is released when the returned file is dropped.
    async fn lock_file(&self) -> Result<std::fs::File, StoreError> {
        let path = sidecar_path(&self.path, "lock");
        let locked = tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            FileExt::lock_exclusive(&file)?;
            Ok::<_, std::io::Error>(file)
        })
        .await
        .map_err(|e| StoreError::Io {
            path: self.path.display().to_string(),
            message: format!("lock task failed: {e}"),
        })?;
        locked.map_err(|e| self.io_error(e))
    }

    fn io_error(&self, e: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn snapshot(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.definition().await?.tasks)
    }

    async fn task(&self, id: &TaskId) -> Result<Task, StoreError> {
        self.definition()
            .await?
            .tasks
            .into_iter()
            .find(|t| &t.id == id)
            .ok_or_else(|| StoreError::TaskNotFound(id.clone()))
    }

    async fn replace(&self, task: Task) -> Result<Task, StoreError> {
        let _guard = self.write_lock.lock().await;
        let _file_lock = self.lock_file().await?;

        let mut definition = self.definition().await?;
        let written = replace_checked(&mut definition.tasks, task)?;
        self.write_definition(&definition).await?;

        // Read back: the whole file must still parse and the record must be
        // exactly what was written.
        let reread = self.definition().await?;
        let stored = reread
            .task(&written.id)
            .ok_or_else(|| StoreError::TaskNotFound(written.id.clone()))?;
        LifecycleValidator::check_record(stored).map_err(|e| readback_error(&self.path, e))?;
        if stored != &written {
            return Err(StoreError::RevisionConflict {
                task_id: written.id.clone(),
                expected: written.revision,
                found: stored.revision,
            });
        }
        debug!(task_id = %written.id, revision = written.revision, "task record written");
        Ok(written)
    }
}

fn readback_error(path: &Path, e: ValidationError) -> StoreError {
    StoreError::Parse {
        path: path.display().to_string(),
        message: format!("record failed re-validation after write: {e}"),
    }
}

/// Hidden file next to the sprint file: `.sprint.yaml.<suffix>`.
fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sprint.yaml".to_string());
    path.with_file_name(format!(".{name}.{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskStatus;

    const SPRINT: &str = "\
sprint: demo
settings:
  maxParallelWorkers: 2
tasks:
  - {id: A, name: first, status: pending, phase: p, assignedRole: r}
  - {id: B, name: second, status: pending, phase: p, assignedRole: r, dependencies: [A]}
";

    async fn store() -> (tempfile::TempDir, FileTaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sprint.yaml");
        tokio::fs::write(&path, SPRINT).await.unwrap();
        let (store, _) = FileTaskStore::open(&path).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn replace_persists_and_preserves_settings() {
        let (_dir, store) = store().await;
        let a = store.task(&"A".into()).await.unwrap();
        store
            .replace(a.with_status(TaskStatus::InProgress))
            .await
            .unwrap();

        let definition = store.definition().await.unwrap();
        assert_eq!(definition.tasks[0].status, TaskStatus::InProgress);
        assert_eq!(definition.tasks[0].revision, 1);
        assert!(definition.settings.is_some());
    }

    #[tokio::test]
    async fn concurrent_writers_cannot_both_win() {
        let (_dir, store) = store().await;
        let a1 = store.task(&"A".into()).await.unwrap();
        let a2 = a1.clone();

        store
            .replace(a1.with_status(TaskStatus::InProgress))
            .await
            .unwrap();
        let err = store
            .replace(a2.with_status(TaskStatus::InProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RevisionConflict { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_stores_on_one_file_keep_every_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sprint.yaml");
        let mut yaml = String::from("sprint: wide\ntasks:\n");
        for i in 0..30 {
            yaml.push_str(&format!(
                "  - {{id: T{i}, name: t, status: pending, phase: p, assignedRole: r}}\n"
            ));
        }
        tokio::fs::write(&path, yaml).await.unwrap();

        let (left, _) = FileTaskStore::open(&path).await.unwrap();
        let (right, _) = FileTaskStore::open(&path).await.unwrap();
        let claim = |store: FileTaskStore, ids: Vec<String>| {
            tokio::spawn(async move {
                for id in ids {
                    let task = store.task(&id.as_str().into()).await.unwrap();
                    store
                        .replace(task.with_status(TaskStatus::InProgress))
                        .await
                        .unwrap();
                }
            })
        };
        let evens = (0..30).step_by(2).map(|i| format!("T{i}")).collect();
        let odds = (1..30).step_by(2).map(|i| format!("T{i}")).collect();
        let (a, b) = tokio::join!(claim(left, evens), claim(right, odds));
        a.unwrap();
        b.unwrap();

        let (reader, _) = FileTaskStore::open(&path).await.unwrap();
        let tasks = reader.snapshot().await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::InProgress));
        assert!(tasks.iter().all(|t| t.revision == 1));
    }

    #[tokio::test]
    async fn invalid_file_is_a_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sprint.yaml");
        tokio::fs::write(&path, "sprint: x\ntasks:\n  - {id: A}\n")
            .await
            .unwrap();
        let err = FileTaskStore::open(&path).await.err().unwrap();
        assert!(matches!(err, StoreError::Schema(_)));
    }
}
