//! Port implementations: in-memory and file-backed stores, the file-based
//! progress channel, sprint log sinks and worker launchers.

pub mod command;
pub mod event_sinks;
pub mod file_store;
pub mod fs_artifacts;
pub mod fs_channel;
pub mod inprocess;
pub mod memory_store;

pub use self::command::CommandLauncher;
pub use self::event_sinks::{JsonlEventSink, MemoryEventSink};
pub use self::file_store::FileTaskStore;
pub use self::fs_artifacts::FsArtifactStore;
pub use self::fs_channel::FsProgressChannel;
pub use self::inprocess::{InProcessLauncher, WorkerHandler};
pub use self::memory_store::MemoryTaskStore;
