//! conductor-core
//!
//! Orchestrates a sprint of interdependent tasks across concurrent workers.
//!
//! # Modules
//! - **domain**: tasks, statuses, sessions, signals, events, errors
//! - **config**: runtime settings read from the sprint file
//! - **graph**: dependency DAG, ready set, critical path
//! - **lifecycle**: the pure transition validator
//! - **ports**: seams to the outside world (TaskStore, ProgressChannel, WorkerLauncher, ...)
//! - **impls**: file-backed and in-memory implementations of the ports
//! - **app**: scheduler, worker coordinator, lifecycle service, conflict resolver

pub mod app;
pub mod config;
pub mod domain;
pub mod graph;
pub mod impls;
pub mod lifecycle;
pub mod ports;
pub mod retry;

pub use app::{Scheduler, SchedulerBuilder, TaskLifecycle};
pub use config::ConductorConfig;
pub use domain::{ConductorError, ErrorReport, Task, TaskId, TaskStatus};
