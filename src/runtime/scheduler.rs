//! Scheduler facade combining the registry, its configuration and the
//! default telemetry sink.

use std::sync::Arc;

use anyhow::Context;

use crate::builders::SchedulerBuilder;
use crate::config::LoaderConfig;
use crate::core::descriptor::TaskSpec;
use crate::core::event::ProfileExport;
use crate::core::profile::{InMemoryProfileSink, ProfileSnapshot};
use crate::core::registry::{AddReport, RegistryStats, TaskRegistry};
use crate::core::{AppResult, LoaderError};
use crate::runtime::api::TaskBatch;

/// Entry point for transport layers.
#[derive(Debug)]
pub struct Scheduler {
    registry: TaskRegistry,
    config: LoaderConfig,
    snapshots: Option<Arc<InMemoryProfileSink>>,
}

impl Scheduler {
    /// Start building a scheduler.
    #[must_use]
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub(crate) const fn from_parts(
        registry: TaskRegistry,
        config: LoaderConfig,
        snapshots: Option<Arc<InMemoryProfileSink>>,
    ) -> Self {
        Self {
            registry,
            config,
            snapshots,
        }
    }

    /// Underlying registry.
    #[must_use]
    pub const fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Add task descriptions.
    ///
    /// # Errors
    ///
    /// See [`TaskRegistry::add_tasks`].
    pub fn add_tasks(&self, specs: Vec<TaskSpec>) -> Result<AddReport, LoaderError> {
        self.registry.add_tasks(specs)
    }

    /// Add task descriptions from a JSON document: either a list of tasks
    /// or an object with a `tasks` list.
    ///
    /// # Errors
    ///
    /// Fails if the document cannot be parsed or the registry is shut down.
    pub fn add_tasks_json(&self, input: &str) -> AppResult<AddReport> {
        let batch = TaskBatch::from_json(input).context("parsing task description")?;
        let report = self.registry.add_tasks(batch.tasks)?;
        Ok(report)
    }

    /// Stop and remove every task.
    ///
    /// # Errors
    ///
    /// See [`TaskRegistry::clear_tasks`].
    pub fn clear_tasks(&self) -> Result<usize, LoaderError> {
        self.registry.clear_tasks()
    }

    /// Register or replace a binary.
    ///
    /// # Errors
    ///
    /// See [`TaskRegistry::register_binary`].
    pub fn register_binary(&self, name: &str, image: impl Into<Arc<[u8]>>) -> Result<(), LoaderError> {
        self.registry.register_binary(name, image)
    }

    /// Arm all schedulable tasks.
    ///
    /// # Errors
    ///
    /// See [`TaskRegistry::start`].
    pub fn start(&self) -> Result<(), LoaderError> {
        self.registry.start()
    }

    /// Stop all tasks.
    pub fn stop(&self) {
        self.registry.stop();
    }

    /// Drain the event log as JSON.
    ///
    /// # Errors
    ///
    /// See [`TaskRegistry::profile_data`].
    pub fn profile_data(&self) -> Result<String, LoaderError> {
        self.registry.profile_data()
    }

    /// Drain the event log as a typed document.
    ///
    /// # Errors
    ///
    /// Fails only if the exported JSON does not parse back.
    pub fn profile_export(&self) -> AppResult<ProfileExport> {
        let json = self.registry.profile_data()?;
        ProfileExport::from_json(&json).context("parsing profile export")
    }

    /// Snapshots kept by the default in-memory sink; empty when a custom
    /// sink was configured.
    pub fn snapshots(&self) -> Vec<ProfileSnapshot> {
        self.snapshots
            .as_ref()
            .map(|sink| sink.snapshots())
            .unwrap_or_default()
    }

    /// Registry statistics.
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Shut down the registry and join its threads.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}
