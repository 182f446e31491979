//! Process host seam and exit-code classification.
//!
//! The host OS provides address spaces, quota accounts and capability
//! delegation; the loader only asks it to spawn, activate and kill. Exit
//! notifications come back on a thread owned by the host, through
//! [`ChildPolicy::exit`](crate::core::child::ChildPolicy::exit).

use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::core::binary::BinaryImage;
use crate::core::child::ChildPolicy;
use crate::core::event::EventType;
use crate::core::quota::{CpuBinding, QuotaAccount};
use crate::core::service::ResolvedSession;
use crate::core::LoaderError;
use crate::util::serde::TaskId;

/// Why an instance terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    /// Normal completion (0).
    Normal,
    /// Killed at critical time (17).
    Critical,
    /// Stopped from outside (19).
    External,
    /// Killed on period overrun or job completion (20).
    Period,
    /// Ran out of capabilities (21).
    OutOfCaps,
    /// Ran out of RAM quota (22).
    OutOfQuota,
    /// Any other code.
    Error(i32),
}

impl ExitReason {
    /// Map a numeric exit code.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Normal,
            17 => Self::Critical,
            19 => Self::External,
            20 => Self::Period,
            21 => Self::OutOfCaps,
            22 => Self::OutOfQuota,
            other => Self::Error(other),
        }
    }

    /// Numeric exit code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Normal => 0,
            Self::Critical => 17,
            Self::External => 19,
            Self::Period => 20,
            Self::OutOfCaps => 21,
            Self::OutOfQuota => 22,
            Self::Error(code) => code,
        }
    }

    /// Event logged for this exit.
    #[must_use]
    pub const fn event_type(self) -> EventType {
        match self {
            Self::Normal => EventType::Exit,
            Self::Critical => EventType::ExitCritical,
            Self::External => EventType::ExitExternal,
            Self::Period => EventType::ExitPeriod,
            Self::OutOfCaps => EventType::OutOfCaps,
            Self::OutOfQuota => EventType::OutOfQuota,
            Self::Error(_) => EventType::ExitError,
        }
    }

    /// Soft exits keep the instance for reuse on the next tick.
    #[must_use]
    pub const fn is_soft(self) -> bool {
        matches!(self, Self::Normal | Self::OutOfCaps | Self::OutOfQuota)
    }
}

/// Host-assigned process identifier.
pub type ProcessId = u64;

/// Everything the host needs to create one child.
pub struct SpawnRequest {
    /// Owning task.
    pub task_id: TaskId,
    /// Unique child name (`"01.binary"`).
    pub name: String,
    /// Image to execute.
    pub image: Arc<BinaryImage>,
    /// RAM account the child allocates from.
    pub ram: Arc<QuotaAccount>,
    /// Capability account.
    pub caps: Arc<QuotaAccount>,
    /// CPU priority, deadline and placement.
    pub cpu: CpuBinding,
    /// Policy receiving exit notifications and session requests.
    pub policy: Arc<ChildPolicy>,
    /// Sessions that resolve after being parked as pending.
    pub late_sessions: Receiver<ResolvedSession>,
}

impl std::fmt::Debug for SpawnRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnRequest")
            .field("task_id", &self.task_id)
            .field("name", &self.name)
            .field("image", &self.image.name())
            .field("ram", &self.ram.granted())
            .field("caps", &self.caps.granted())
            .field("cpu", &self.cpu)
            .finish_non_exhaustive()
    }
}

/// Handle to a spawned child. Dropping it releases the process.
pub trait ChildProcess: Send {
    /// Host process id.
    fn id(&self) -> ProcessId;

    /// Let the child begin executing.
    fn activate(&mut self);

    /// Terminate the child with `reason`.
    fn kill(&mut self, reason: ExitReason);
}

/// Process creation primitive provided by the host OS.
pub trait ProcessHost: Send + Sync {
    /// Create a child in a non-running state.
    ///
    /// # Errors
    ///
    /// [`LoaderError::SpawnFailed`] or [`LoaderError::ResourceExhausted`]
    /// when the host cannot create the child; the loader retries next period.
    fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn ChildProcess>, LoaderError>;
}
