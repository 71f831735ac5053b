//! ArtifactStore port: the files workers change.

use async_trait::async_trait;

use crate::domain::IpcError;

/// Text artifacts addressed by workspace-relative path.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// `None` when the artifact does not exist yet.
    async fn read(&self, path: &str) -> Result<Option<String>, IpcError>;

    /// Replace the artifact's content atomically.
    async fn write(&self, path: &str, content: &str) -> Result<(), IpcError>;
}
