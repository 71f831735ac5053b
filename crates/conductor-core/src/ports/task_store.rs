//! TaskStore port: the authoritative record of every task in the sprint.
//!
//! Writes are optimistic read-modify-write: a caller reads a task, derives
//! the next record through the lifecycle validator and hands it back with
//! the revision it read. The store refuses the write when somebody else got
//! there first.

use async_trait::async_trait;

use crate::domain::{StoreError, Task, TaskId};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Every task, in definition order.
    async fn snapshot(&self) -> Result<Vec<Task>, StoreError>;

    async fn task(&self, id: &TaskId) -> Result<Task, StoreError>;

    /// Store `task` if the stored revision still equals `task.revision`.
    /// Returns the record as written, with its revision bumped.
    async fn replace(&self, task: Task) -> Result<Task, StoreError>;
}
