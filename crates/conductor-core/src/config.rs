//! Runtime configuration, read from the `settings` block of a sprint file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ConfigError;
use crate::graph::TieBreak;
use crate::retry::RetryPolicy;

/// Bounds for the completion detection latency.
pub const MIN_POLL_INTERVAL_MS: u64 = 10;
pub const MAX_POLL_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConductorConfig {
    /// Upper bound on concurrently running work sessions.
    pub max_parallel_workers: usize,

    /// How often the scheduler polls the progress channel. This is the
    /// completion detection latency floor. Clamped to 10..=5000 ms.
    pub poll_interval_ms: u64,

    /// Restarts granted to a failing task before it is deferred.
    pub max_retries: u32,

    /// Launch attempts before a task that cannot be spawned is deferred.
    pub max_spawn_attempts: u32,

    /// Minimum silence before a session counts as stalled.
    pub heartbeat_floor_ms: u64,

    /// Wall-clock length of one effort point.
    pub effort_unit_ms: u64,

    /// Stall window as a multiple of the task's estimated effort.
    pub timeout_multiplier: f64,

    /// Effort assumed for tasks without `estimatedEffort`.
    pub default_effort: f64,

    pub critical_path_tie_break: TieBreak,

    pub ipc_retry: IpcRetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IpcRetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for IpcRetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 50,
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            max_parallel_workers: 5,
            poll_interval_ms: 1_000,
            max_retries: 3,
            max_spawn_attempts: 3,
            heartbeat_floor_ms: 30_000,
            effort_unit_ms: 60_000,
            timeout_multiplier: 2.0,
            default_effort: 1.0,
            critical_path_tie_break: TieBreak::FirstDefined,
            ipc_retry: IpcRetryConfig::default(),
        }
    }
}

impl ConductorConfig {
    /// Read the raw `settings` block. Missing keys take their defaults.
    pub fn from_settings(settings: Option<&serde_yaml::Value>) -> Result<Self, ConfigError> {
        let config = match settings {
            None | Some(serde_yaml::Value::Null) => Self::default(),
            Some(value) => serde_yaml::from_value(value.clone())
                .map_err(|e| ConfigError(format!("settings: {e}")))?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_workers == 0 {
            return Err(ConfigError("maxParallelWorkers must be at least 1".into()));
        }
        if self.max_spawn_attempts == 0 {
            return Err(ConfigError("maxSpawnAttempts must be at least 1".into()));
        }
        if !(self.timeout_multiplier.is_finite() && self.timeout_multiplier > 0.0) {
            return Err(ConfigError(format!(
                "timeoutMultiplier must be positive, got {}",
                self.timeout_multiplier
            )));
        }
        if !(self.default_effort.is_finite() && self.default_effort >= 0.0) {
            return Err(ConfigError(format!(
                "defaultEffort must be non-negative, got {}",
                self.default_effort
            )));
        }
        if self.ipc_retry.max_attempts == 0 {
            return Err(ConfigError("ipcRetry.maxAttempts must be at least 1".into()));
        }
        if !(self.ipc_retry.multiplier.is_finite() && self.ipc_retry.multiplier >= 1.0) {
            return Err(ConfigError("ipcRetry.multiplier must be >= 1.0".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.poll_interval_ms
                .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS),
        )
    }

    /// Stall window for a task: `max(floor, multiplier * effort * unit)`.
    pub fn session_timeout(&self, estimated_effort: Option<f64>) -> Duration {
        let effort = estimated_effort.unwrap_or(self.default_effort).max(0.0);
        let scaled_ms = self.timeout_multiplier * effort * self.effort_unit_ms as f64;
        let floor = Duration::from_millis(self.heartbeat_floor_ms);
        if !scaled_ms.is_finite() {
            return floor;
        }
        floor.max(Duration::from_millis(scaled_ms.round() as u64))
    }

    pub fn ipc_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.ipc_retry.base_delay_ms),
            multiplier: self.ipc_retry.multiplier,
            max_attempts: self.ipc_retry.max_attempts,
        }
    }
}
