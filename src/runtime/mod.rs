//! Scheduler facade and API surface.

pub mod api;
pub mod scheduler;

pub use api::{health, BinaryUpload, Health, SchedulerService, TaskBatch};
pub use scheduler::Scheduler;
