//! Retry policy: bounded exponential backoff for channel and store I/O.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::domain::IpcError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Total attempts, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the `attempts`-th failure (1-indexed):
    /// `base_delay * multiplier^(attempts - 1)`.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(attempts.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay_secs)
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget
    /// runs out. Only transient I/O errors are retried.
    pub async fn run<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T, IpcError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IpcError>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempts < self.max_attempts => {
                    let delay = self.next_delay(attempts);
                    debug!(op = op_name, attempts, ?delay, error = %err, "retrying channel i/o");
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    return Err(IpcError::Exhausted {
                        op: op_name,
                        attempts,
                        last_error: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}
