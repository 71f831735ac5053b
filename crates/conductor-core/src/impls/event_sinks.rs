//! Sprint log sinks.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::domain::{IpcError, LoggedEvent};
use crate::ports::EventSink;

/// Appends one JSON object per line to `sprint-log.jsonl`.
pub struct JsonlEventSink {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonlEventSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole log back. Unreadable lines are skipped.
    pub async fn read_all(&self) -> Result<Vec<LoggedEvent>, IpcError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(text
                .lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> IpcError {
        IpcError::Io {
            op: "sprint_log",
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl EventSink for JsonlEventSink {
    async fn record(&self, event: &LoggedEvent) -> Result<(), IpcError> {
        let mut line = serde_json::to_string(event).map_err(|e| IpcError::Corrupt {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))
    }
}

/// Keeps events in memory; for tests.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<LoggedEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LoggedEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn record(&self, event: &LoggedEvent) -> Result<(), IpcError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}
