//! EventSink port: where the sprint log goes.

use async_trait::async_trait;

use crate::domain::{IpcError, LoggedEvent};

/// Records sprint events. A failed write must never fail the operation
/// that produced the event; callers log it and move on.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: &LoggedEvent) -> Result<(), IpcError>;
}
