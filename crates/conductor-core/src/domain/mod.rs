//! Domain model (ids, tasks, sessions, signals, errors, events, ...).

pub mod decision;
pub mod errors;
pub mod events;
pub mod ids;
pub mod notes;
pub mod session;
pub mod signal;
pub mod sprint;
pub mod status;
pub mod task;

pub use decision::{Decider, Decision, RetryBudgetDecider, SessionFailure};
pub use errors::{
    ConductorError, ConfigError, ConflictError, CycleError, ErrorKind, ErrorReport, IpcError,
    OverlapRegion, SchemaError, SchemaProblem, SessionConflictError, SpawnError, StoreError,
    TransitionError, ValidationError,
};
pub use events::{LoggedEvent, SprintEvent};
pub use ids::{Id, IdMarker, ParseIdError, SessionId, SignalId, TaskId};
pub use notes::{COMPLETION_NOTES_TEMPLATE, CompletionNotes, NotesProblem};
pub use session::WorkSession;
pub use signal::{
    CompletionReport, CompletionSignal, DependencyArtifact, FileChange, Hunk, ProgressEntry,
    ProgressKind, SignalStatus,
};
pub use sprint::{RoleCommand, SprintDefinition};
pub use status::{ParseStatusError, TaskStatus};
pub use task::{RoleTag, Task};
