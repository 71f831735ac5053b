use std::sync::Arc;

use tracing::warn;

use crate::domain::{LoggedEvent, SprintEvent};
use crate::ports::{Clock, EventSink};

/// Timestamps events and hands them to the sink. The sprint log is an
/// audit trail: a failed append is logged and otherwise ignored.
#[derive(Clone)]
pub struct SprintLog {
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl SprintLog {
    pub fn new(sink: Arc<dyn EventSink>, clock: Arc<dyn Clock>) -> Self {
        Self { sink, clock }
    }

    pub async fn emit(&self, event: SprintEvent) {
        let logged = LoggedEvent {
            at: self.clock.now(),
            event,
        };
        if let Err(e) = self.sink.record(&logged).await {
            warn!(error = %e, "could not append to sprint log");
        }
    }
}
