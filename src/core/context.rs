//! State shared by every task of a registry.

use std::sync::Arc;

use crate::core::admission::AdmissionControl;
use crate::core::binary::BinaryCache;
use crate::core::event::EventLog;
use crate::core::host::ProcessHost;
use crate::core::profile::ProfileSink;
use crate::core::quota::{AffinitySpace, ResourceBudget};
use crate::core::service::ServiceRegistry;
use crate::core::task::Task;
use crate::core::timer::TimerService;
use crate::core::workers::Submitter;

pub(crate) struct LoaderContext {
    pub(crate) events: Arc<EventLog>,
    pub(crate) timers: Arc<TimerService>,
    pub(crate) ram: Arc<ResourceBudget>,
    pub(crate) caps: Arc<ResourceBudget>,
    pub(crate) affinity: AffinitySpace,
    pub(crate) min_ram_quota: u64,
    pub(crate) host: Arc<dyn ProcessHost>,
    pub(crate) admission: Arc<dyn AdmissionControl>,
    pub(crate) profile: Arc<dyn ProfileSink>,
    pub(crate) binaries: BinaryCache,
    pub(crate) services: Arc<ServiceRegistry>,
    pub(crate) reclaimer: Submitter<Arc<Task>>,
}
