//! Core scheduling model: task descriptors, timers, child instances,
//! quota accounting and the task registry.

pub mod admission;
pub mod binary;
pub mod child;
pub(crate) mod context;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod host;
pub mod profile;
pub mod quota;
pub mod registry;
pub mod service;
pub mod task;
pub mod timer;
pub mod workers;

pub use admission::{AcceptAll, Admission, AdmissionControl, AdmissionRequest, StaticAdmission};
pub use binary::{BinaryCache, BinaryImage};
pub use child::{ChildInstance, ChildPolicy, InstanceState};
pub use descriptor::{CoreAffinity, SchedulingBand, TaskDescriptor, TaskSpec};
pub use error::{AppResult, LoaderError, ResourceKind};
pub use event::{Event, EventLog, EventType, ProfileExport};
pub use host::{ChildProcess, ExitReason, ProcessHost, ProcessId, SpawnRequest};
pub use profile::{build_snapshot, InMemoryProfileSink, ProfileSink, ProfileSnapshot, TracingProfileSink};
pub use quota::{AffinityLocation, AffinitySpace, CpuBinding, QuotaAccount, ResourceBudget};
pub use registry::{AddReport, Driver, RegistryParts, RegistryStats, TaskRegistry, LOADER_TASK_ID};
pub use service::{Resolution, ResolvedSession, ServiceHandle, ServiceProvider, ServiceRegistry, SessionRequest};
pub use task::{Task, TaskPhase};
pub use timer::{TimerAction, TimerId, TimerService, TimerTarget};
