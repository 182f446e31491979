//! Admission control seam.
//!
//! The schedulability test itself lives in an external service. The loader
//! asks it exactly once per task when the task is added, and for
//! deadline-band tasks asks again on every tick whether the task may run.

use std::collections::HashSet;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::descriptor::TaskDescriptor;
use crate::util::serde::TaskId;

/// Outcome of the one-shot admission test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    /// Task may be scheduled.
    Accepted,
    /// Task is refused for its lifetime in the registry.
    Rejected,
}

/// Criticality class reported to the admission service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    /// High criticality (priority band).
    Hi,
    /// Low criticality (deadline band).
    Lo,
}

/// Scheduling strategy reported to the admission service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStrategy {
    /// Fixed priority.
    Priority,
    /// Earliest deadline.
    Deadline,
}

/// Run-queue record describing a task to the admission service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Task id.
    pub task_id: TaskId,
    /// Task name.
    pub name: String,
    /// Worst-case execution time (ms).
    pub wcet: u32,
    /// Priority (0 in the deadline band).
    pub prio: u32,
    /// Inter-arrival time, i.e. the period (ms).
    pub inter_arrival: u32,
    /// Deadline in microseconds (0 in the priority band).
    pub deadline_us: u64,
    /// Criticality class.
    pub task_class: TaskClass,
    /// Strategy.
    pub task_strategy: TaskStrategy,
}

impl AdmissionRequest {
    /// Build the request for a descriptor.
    #[must_use]
    pub fn for_task(desc: &TaskDescriptor) -> Self {
        let (task_class, task_strategy) = if desc.is_deadline_scheduled() {
            (TaskClass::Lo, TaskStrategy::Deadline)
        } else {
            (TaskClass::Hi, TaskStrategy::Priority)
        };
        Self {
            task_id: desc.id(),
            name: desc.name(),
            wcet: desc.execution_time(),
            prio: desc.priority(),
            inter_arrival: desc.period(),
            deadline_us: u64::from(desc.deadline()) * 1000,
            task_class,
            task_strategy,
        }
    }
}

/// External admission-control collaborator.
pub trait AdmissionControl: Send + Sync {
    /// One-shot schedulability test, called once when the task is added.
    fn admit(&self, request: &AdmissionRequest) -> Admission;

    /// Per-tick gate for deadline-band tasks.
    fn scheduling_allowed(&self, desc: &TaskDescriptor) -> bool {
        let _ = desc;
        true
    }
}

/// Admits everything and never gates a tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl AdmissionControl for AcceptAll {
    fn admit(&self, _request: &AdmissionRequest) -> Admission {
        Admission::Accepted
    }
}

/// Admission control driven by explicit task-id lists, for tests and bring-up.
#[derive(Debug, Default)]
pub struct StaticAdmission {
    rejected: Mutex<HashSet<TaskId>>,
    gated: Mutex<HashSet<TaskId>>,
}

impl StaticAdmission {
    /// Create an instance that accepts everything until told otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject `task_id` at admission time.
    pub fn reject(&self, task_id: TaskId) {
        self.rejected.lock().insert(task_id);
    }

    /// Disallow or re-allow ticks of deadline-band task `task_id`.
    pub fn set_gated(&self, task_id: TaskId, gated: bool) {
        let mut set = self.gated.lock();
        if gated {
            set.insert(task_id);
        } else {
            set.remove(&task_id);
        }
    }
}

impl AdmissionControl for StaticAdmission {
    fn admit(&self, request: &AdmissionRequest) -> Admission {
        if self.rejected.lock().contains(&request.task_id) {
            Admission::Rejected
        } else {
            Admission::Accepted
        }
    }

    fn scheduling_allowed(&self, desc: &TaskDescriptor) -> bool {
        !self.gated.lock().contains(&desc.id())
    }
}
