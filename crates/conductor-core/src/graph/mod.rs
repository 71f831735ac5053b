//! Dependency graph, topological ordering and critical-path analysis.

mod critical_path;
mod dependency;

pub use critical_path::{CriticalPath, TieBreak};
pub use dependency::DependencyGraph;

use thiserror::Error;

use crate::domain::{ConductorError, CycleError, SchemaError};

/// Why a task set could not be turned into a graph. Both are load-time
/// errors that block the whole sprint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Cycle(#[from] CycleError),
}

impl From<BuildError> for ConductorError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Schema(e) => ConductorError::Schema(e),
            BuildError::Cycle(e) => ConductorError::Cycle(e),
        }
    }
}
