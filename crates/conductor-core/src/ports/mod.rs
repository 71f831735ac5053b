//! Ports: the seams between the orchestration logic and the outside world
//! (task storage, the progress channel, workers, artifacts, time, ids).

pub mod artifact_store;
pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod progress_channel;
pub mod task_store;
pub mod worker;

pub use self::artifact_store::ArtifactStore;
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::progress_channel::ProgressChannel;
pub use self::task_store::TaskStore;
pub use self::worker::{
    CancelToken, CapabilityRegistry, RegistryError, SessionReporter, WorkerExit, WorkerHandle,
    WorkerInput, WorkerLauncher,
};
