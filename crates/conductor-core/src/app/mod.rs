//! App: the orchestration logic, built on top of the ports.
//!
//! # Components
//! - **SchedulerBuilder**: wiring and build-time checks
//! - **Scheduler**: the round loop (settle, sweep, dispatch)
//! - **WorkerCoordinator**: one live session per task, stall and crash recovery
//! - **TaskLifecycle**: every status write, validated and revision-checked
//! - **ConflictResolver**: merges workers' hunks into shared artifacts
//! - **SprintStatus**: where the sprint stands and why tasks wait

pub mod builder;
pub mod conflict;
pub mod coordinator;
pub mod lifecycle_ops;
pub mod scheduler;
pub mod sprint_log;
pub mod status;

pub use self::builder::SchedulerBuilder;
pub use self::conflict::{ConflictResolver, MergeOutcome};
pub use self::coordinator::{Recovery, SessionFault, WorkerCoordinator};
pub use self::lifecycle_ops::TaskLifecycle;
pub use self::scheduler::{
    INTERRUPTED, RoundReport, RunOutcome, RunSummary, Scheduler, dispatch_order,
};
pub use self::sprint_log::SprintLog;
pub use self::status::{
    BlockedTask, Blocker, DeferredTask, SprintCounts, SprintStatus, unresolved_conflicts,
};
