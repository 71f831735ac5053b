//! ArtifactStore over a workspace directory.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::domain::IpcError;
use crate::ports::ArtifactStore;

pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a workspace-relative path. Absolute paths and `..` are
    /// refused so a worker report cannot point outside the workspace.
    fn resolve(&self, path: &str) -> Result<PathBuf, IpcError> {
        let relative = Path::new(path);
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes || path.trim().is_empty() {
            return Err(IpcError::Io {
                op: "resolve_artifact",
                path: path.to_string(),
                source: std::io::Error::new(
                    ErrorKind::InvalidInput,
                    "artifact path must stay inside the workspace",
                ),
            });
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> IpcError {
    IpcError::Io {
        op,
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn read(&self, path: &str) -> Result<Option<String>, IpcError> {
        let full = self.resolve(path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read_artifact", &full, e)),
        }
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), IpcError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("write_artifact", parent, e))?;
        }
        let name = full
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = full.with_file_name(format!(".{name}.conductor-tmp"));
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| io_error("write_artifact", &tmp, e))?;
        tokio::fs::rename(&tmp, &full)
            .await
            .map_err(|e| io_error("write_artifact", &full, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        assert_eq!(store.read("src/lib.rs").await.unwrap(), None);

        store.write("src/lib.rs", "fn main() {}\n").await.unwrap();
        assert_eq!(
            store.read("src/lib.rs").await.unwrap().as_deref(),
            Some("fn main() {}\n")
        );
    }

    #[tokio::test]
    async fn paths_outside_the_workspace_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        assert!(store.read("../etc/passwd").await.is_err());
        assert!(store.write("/tmp/x", "y").await.is_err());
    }
}
