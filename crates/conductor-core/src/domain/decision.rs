//! Decision model: what to do with a task whose session failed.
//!
//! Deciders are pure: given the failed session and why it failed they
//! return the next action. Carrying it out (cancelling, relaunching,
//! deferring) is the coordinator's job.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::WorkSession;

/// Why a session ended without a successful completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SessionFailure {
    /// No progress or heartbeat within the session's timeout window.
    Stalled,
    /// Worker exited abnormally or raised an error.
    Crashed(String),
    /// Worker exited cleanly but never published a completion signal.
    NoSignal,
    /// Worker published a `failure` signal.
    Reported(String),
    /// Success signal was refused by the completion gate.
    Rejected(String),
    /// Relaunch could not spawn a worker.
    SpawnFailed(String),
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionFailure::Stalled => f.write_str("no heartbeat within the timeout window"),
            SessionFailure::Crashed(e) => write!(f, "worker crashed: {e}"),
            SessionFailure::NoSignal => f.write_str("worker exited without a completion signal"),
            SessionFailure::Reported(e) => write!(f, "worker reported failure: {e}"),
            SessionFailure::Rejected(e) => write!(f, "completion rejected: {e}"),
            SessionFailure::SpawnFailed(e) => write!(f, "worker relaunch failed: {e}"),
        }
    }
}

/// The next action for a task after a session failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Relaunch the task in a fresh session.
    Restart { retry_count: u32, reason: String },

    /// Stop retrying. The task will be deferred with `reason`.
    GiveUp { reason: String },
}

pub trait Decider: Send + Sync {
    fn decide(&self, session: &WorkSession, failure: &SessionFailure) -> Decision;
}

/// Restarts until `max_retries` restarts have been used, then gives up.
#[derive(Debug, Clone)]
pub struct RetryBudgetDecider {
    max_retries: u32,
}

impl RetryBudgetDecider {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }
}

impl Decider for RetryBudgetDecider {
    fn decide(&self, session: &WorkSession, failure: &SessionFailure) -> Decision {
        if session.retry_count >= self.max_retries {
            Decision::GiveUp {
                reason: format!(
                    "exceeded retry budget ({} retries): {failure}",
                    self.max_retries
                ),
            }
        } else {
            Decision::Restart {
                retry_count: session.retry_count + 1,
                reason: format!(
                    "restart {}/{} after {failure}",
                    session.retry_count + 1,
                    self.max_retries
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SessionId, TaskId};
    use chrono::Utc;
    use std::time::Duration;
    use ulid::Ulid;

    fn session(retry_count: u32) -> WorkSession {
        WorkSession::new(
            SessionId::from_ulid(Ulid::new()),
            TaskId::new("T1"),
            Utc::now(),
            retry_count,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn restarts_while_budget_remains() {
        let decider = RetryBudgetDecider::new(3);
        let decision = decider.decide(&session(2), &SessionFailure::Stalled);
        assert!(matches!(decision, Decision::Restart { retry_count: 3, .. }));
    }

    #[test]
    fn gives_up_when_budget_is_spent() {
        let decider = RetryBudgetDecider::new(3);
        let decision = decider.decide(&session(3), &SessionFailure::Crashed("exit 1".into()));
        match decision {
            Decision::GiveUp { reason } => {
                assert!(reason.contains("exceeded retry budget"));
                assert!(reason.contains("exit 1"));
            }
            other => panic!("expected GiveUp, got {other:?}"),
        }
    }

    #[test]
    fn zero_budget_never_restarts() {
        let decider = RetryBudgetDecider::new(0);
        assert!(matches!(
            decider.decide(&session(0), &SessionFailure::NoSignal),
            Decision::GiveUp { .. }
        ));
    }
}
