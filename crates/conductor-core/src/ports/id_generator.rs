//! IdGenerator port.

use ulid::Ulid;

use crate::domain::{SessionId, SignalId};
use crate::ports::Clock;

/// Produces the ULID-based ids of sessions and signals.
///
/// ULIDs sort by creation time, which keeps session and signal listings in
/// the order they happened.
pub trait IdGenerator: Send + Sync {
    fn generate_session_id(&self) -> SessionId;

    fn generate_signal_id(&self) -> SignalId;
}

/// ULIDs whose timestamp part comes from a [`Clock`].
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_session_id(&self) -> SessionId {
        SessionId::from_ulid(self.next())
    }

    fn generate_signal_id(&self) -> SignalId {
        SignalId::from_ulid(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ManualClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);
        let a = id_gen.generate_session_id();
        let b = id_gen.generate_session_id();
        assert_ne!(a, b);
    }

    #[test]
    fn timestamp_part_comes_from_the_clock() {
        let fixed_time = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(ManualClock::new(fixed_time));

        let id = id_gen.generate_signal_id();
        assert_eq!(id.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert!(id.to_string().starts_with("signal-"));
        assert!(id_gen.generate_session_id().to_string().starts_with("session-"));
    }
}
