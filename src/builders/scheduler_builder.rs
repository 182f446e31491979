//! Builder wiring configuration and collaborators into a [`Scheduler`].

use std::sync::Arc;
use std::time::Duration;

use crate::config::{DriverConfig, LoaderConfig};
use crate::core::admission::{AcceptAll, AdmissionControl};
use crate::core::host::ProcessHost;
use crate::core::profile::{InMemoryProfileSink, ProfileSink};
use crate::core::registry::{Driver, RegistryParts, TaskRegistry};
use crate::core::LoaderError;
use crate::runtime::Scheduler;
use crate::util::clock::{ManualClock, MonotonicClock};

/// Builder for [`Scheduler`].
///
/// Only the process host is mandatory. Admission defaults to
/// [`AcceptAll`] and telemetry to a bounded [`InMemoryProfileSink`].
#[derive(Default)]
pub struct SchedulerBuilder {
    config: LoaderConfig,
    host: Option<Arc<dyn ProcessHost>>,
    admission: Option<Arc<dyn AdmissionControl>>,
    profile: Option<Arc<dyn ProfileSink>>,
    clock: Option<ManualClock>,
}

impl SchedulerBuilder {
    /// Start from default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the configuration.
    #[must_use]
    pub fn config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Process creation primitive.
    #[must_use]
    pub fn host(mut self, host: Arc<dyn ProcessHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Admission-control collaborator.
    #[must_use]
    pub fn admission(mut self, admission: Arc<dyn AdmissionControl>) -> Self {
        self.admission = Some(admission);
        self
    }

    /// Telemetry sink receiving profile snapshots.
    #[must_use]
    pub fn profile_sink(mut self, sink: Arc<dyn ProfileSink>) -> Self {
        self.profile = Some(sink);
        self
    }

    /// Drive timers from `clock`; implies the manual driver.
    #[must_use]
    pub fn manual_clock(mut self, clock: ManualClock) -> Self {
        self.config.driver = DriverConfig::Manual;
        self.clock = Some(clock);
        self
    }

    /// Validate and assemble.
    ///
    /// # Errors
    ///
    /// [`LoaderError::InvalidConfig`] on invalid configuration or a missing
    /// host; [`LoaderError::Internal`] when worker threads cannot start.
    pub fn build(self) -> Result<Scheduler, LoaderError> {
        self.config.validate().map_err(LoaderError::InvalidConfig)?;
        let host = self
            .host
            .ok_or_else(|| LoaderError::InvalidConfig("a process host is required".into()))?;
        let (profile, memory_sink): (Arc<dyn ProfileSink>, _) = match self.profile {
            Some(sink) => (sink, None),
            None => {
                let sink = Arc::new(InMemoryProfileSink::new(self.config.profile_history));
                (Arc::clone(&sink) as Arc<dyn ProfileSink>, Some(sink))
            }
        };
        let driver = match self.config.driver {
            DriverConfig::Thread => Driver::Thread,
            DriverConfig::Manual => Driver::Manual(self.clock.unwrap_or_default()),
        };
        let registry = TaskRegistry::new(RegistryParts {
            ram_budget: self.config.ram_budget.bytes(),
            cap_budget: self.config.cap_budget,
            affinity_cores: self.config.affinity_cores,
            min_ram_quota: self.config.min_ram_quota.bytes(),
            drain_timeout: Duration::from_millis(self.config.drain_timeout_ms),
            worker_stack_size: self.config.worker_stack_size,
            clock: Arc::new(MonotonicClock::new()),
            driver,
            host,
            admission: self.admission.unwrap_or_else(|| Arc::new(AcceptAll)),
            profile,
        })?;
        Ok(Scheduler::from_parts(registry, self.config, memory_sink))
    }
}

impl std::fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("config", &self.config)
            .field("host", &self.host.is_some())
            .field("admission", &self.admission.is_some())
            .field("profile", &self.profile.is_some())
            .finish_non_exhaustive()
    }
}
