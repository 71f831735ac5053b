//! In-memory TaskStore for tests and embedding.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::{StoreError, Task, TaskId};
use crate::ports::TaskStore;

pub struct MemoryTaskStore {
    tasks: Mutex<Vec<Task>>,
}

impl MemoryTaskStore {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn snapshot(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.tasks.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn task(&self, id: &TaskId) -> Result<Task, StoreError> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|t| &t.id == id)
            .cloned()
            .ok_or_else(|| StoreError::TaskNotFound(id.clone()))
    }

    async fn replace(&self, task: Task) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        replace_checked(&mut tasks, task)
    }
}

/// Optimistic write shared by the stores: the stored revision must equal
/// the one the caller read.
pub(crate) fn replace_checked(tasks: &mut [Task], mut task: Task) -> Result<Task, StoreError> {
    let slot = tasks
        .iter_mut()
        .find(|t| t.id == task.id)
        .ok_or_else(|| StoreError::TaskNotFound(task.id.clone()))?;
    if slot.revision != task.revision {
        return Err(StoreError::RevisionConflict {
            task_id: task.id,
            expected: task.revision,
            found: slot.revision,
        });
    }
    task.revision += 1;
    *slot = task.clone();
    Ok(task)
}
