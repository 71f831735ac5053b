//! SchedulerBuilder: wires ports, launchers and configuration into a
//! [`Scheduler`].
//!
//! Everything that can be checked before the first round is checked in
//! `build()`: the configuration, the sprint's dependency graph and the
//! launcher registry.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::warn;

use crate::app::{ConflictResolver, Scheduler, SprintLog, TaskLifecycle, WorkerCoordinator};
use crate::config::ConductorConfig;
use crate::domain::{ConductorError, Decider, RoleTag};
use crate::graph::DependencyGraph;
use crate::ports::{
    ArtifactStore, CapabilityRegistry, Clock, EventSink, IdGenerator, ProgressChannel,
    RegistryError, SystemClock, TaskStore, UlidGenerator, WorkerLauncher,
};

/// Builds a [`Scheduler`] for one sprint.
///
/// # Example
/// ```ignore
/// let scheduler = SchedulerBuilder::new(store, channel, artifacts, events)
///     .sprint_name("checkout-v2")
///     .config(config)
///     .register("database", Arc::new(InProcessLauncher::new(DbWorker)))?
///     .build()
///     .await?;
/// ```
///
/// # Checks at build time
/// - the configuration is valid
/// - the sprint's dependencies exist and form a DAG
/// - roles with no launcher are reported; their tasks fail to spawn and
///   end up deferred once the spawn attempts are used up
pub struct SchedulerBuilder {
    store: Arc<dyn TaskStore>,
    channel: Arc<dyn ProgressChannel>,
    artifacts: Arc<dyn ArtifactStore>,
    events: Arc<dyn EventSink>,
    registry: CapabilityRegistry,
    config: ConductorConfig,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    decider: Option<Arc<dyn Decider>>,
    sprint_name: String,
}

impl SchedulerBuilder {
    pub fn new(
        store: Arc<dyn TaskStore>,
        channel: Arc<dyn ProgressChannel>,
        artifacts: Arc<dyn ArtifactStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            channel,
            artifacts,
            events,
            registry: CapabilityRegistry::new(),
            config: ConductorConfig::default(),
            clock: Arc::new(SystemClock),
            ids: None,
            decider: None,
            sprint_name: "sprint".to_string(),
        }
    }

    pub fn config(mut self, config: ConductorConfig) -> Self {
        self.config = config;
        self
    }

    /// Ids default to ULIDs stamped by this clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Replace the retry-budget decider.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn sprint_name(mut self, name: impl Into<String>) -> Self {
        self.sprint_name = name.into();
        self
    }

    /// Register the launcher for a role. A role can be registered once.
    pub fn register(
        mut self,
        role: impl Into<RoleTag>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(role.into(), launcher)?;
        Ok(self)
    }

    pub async fn build(self) -> Result<Scheduler, ConductorError> {
        self.config.validate()?;
        let tasks = self.store.snapshot().await?;
        let graph = DependencyGraph::build(&tasks)?;

        let registered: BTreeSet<&RoleTag> = self.registry.roles().collect();
        let missing: BTreeSet<&RoleTag> = tasks
            .iter()
            .map(|t| &t.assigned_role)
            .filter(|role| !registered.contains(role))
            .collect();
        for role in missing {
            warn!(role = %role, "no worker registered for role");
        }

        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(Arc::clone(&self.clock))),
        };
        let log = SprintLog::new(self.events, Arc::clone(&self.clock));
        let lifecycle = TaskLifecycle::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            log.clone(),
        )
        .with_channel(Arc::clone(&self.channel));
        let mut coordinator = WorkerCoordinator::new(
            self.registry,
            Arc::clone(&self.channel),
            self.clock,
            ids,
            log.clone(),
            self.config.clone(),
        );
        if let Some(decider) = self.decider {
            coordinator = coordinator.with_decider(decider);
        }
        let resolver = ConflictResolver::new(self.artifacts, log.clone());

        Ok(Scheduler::new(
            self.sprint_name,
            self.store,
            self.channel,
            graph,
            lifecycle,
            coordinator,
            resolver,
            log,
            self.config,
        ))
    }
}
