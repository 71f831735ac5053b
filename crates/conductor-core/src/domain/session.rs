use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{SessionId, TaskId};

/// Ephemeral binding of one worker to one task.
///
/// A restart keeps the task but allocates a new session with
/// `retry_count + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkSession {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub retry_count: u32,
    /// Silence allowed before the session counts as stalled.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl WorkSession {
    pub fn new(
        session_id: SessionId,
        task_id: TaskId,
        now: DateTime<Utc>,
        retry_count: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            session_id,
            task_id,
            started_at: now,
            last_heartbeat: now,
            retry_count,
            timeout,
        }
    }

    /// Record activity seen at `at`. Older timestamps are ignored.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_heartbeat {
            self.last_heartbeat = at;
        }
    }

    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        let silence = now.signed_duration_since(self.last_heartbeat);
        silence.to_std().map(|s| s > self.timeout).unwrap_or(false)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
