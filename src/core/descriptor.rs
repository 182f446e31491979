//! Immutable per-task configuration.
//!
//! A [`TaskSpec`] is the raw description handed in by the transport layer.
//! [`TaskDescriptor::new`] normalizes it once: the scheduling band is chosen
//! from the priority, and the fields of the other band are zeroed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::LoaderError;
use crate::util::serde::{ByteSize, TaskId};

/// Highest priority value that still selects the fixed-priority band.
pub const MAX_RT_PRIORITY: u32 = 127;

/// Raw task description as received from the transport layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TaskSpec {
    /// Task identifier.
    pub id: TaskId,
    /// Worst-case execution time in milliseconds.
    pub execution_time: u32,
    /// Time after start at which a running instance is force-killed (0 = never).
    pub critical_time: u32,
    /// Priority; values above [`MAX_RT_PRIORITY`] select deadline scheduling.
    pub priority: u32,
    /// Relative deadline in milliseconds (deadline band only).
    pub deadline: u32,
    /// Period in milliseconds (0 = run once).
    pub period: u32,
    /// Delay before the first start, in milliseconds.
    pub offset: u32,
    /// Number of jobs after which the task is done.
    pub number_of_jobs: u32,
    /// RAM quota delegated to each instance.
    pub ram_quota: ByteSize,
    /// Capability quota delegated to each instance.
    pub cap_quota: u32,
    /// Number of cores the instance may run on (0 = one core).
    pub core_count: u32,
    /// First core of the affinity window.
    pub core_offset: u32,
    /// Name of the registered binary image.
    pub binary_name: String,
    /// Private configuration blob served to the child as its `config` ROM.
    pub config: String,
}

/// Mutually exclusive scheduling class of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "band", content = "value")]
pub enum SchedulingBand {
    /// Fixed priority in `0..=127`.
    Priority(u8),
    /// Deadline scheduled with the given relative deadline (ms).
    Deadline(u32),
}

/// Core window an instance is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreAffinity {
    /// Number of cores.
    pub count: u32,
    /// First core index.
    pub offset: u32,
}

/// Normalized, immutable task configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    id: TaskId,
    execution_time: u32,
    critical_time: u32,
    band: SchedulingBand,
    period: u32,
    offset: u32,
    number_of_jobs: u32,
    ram_quota: u64,
    cap_quota: u32,
    affinity: CoreAffinity,
    binary_name: String,
    config: Arc<[u8]>,
}

impl TaskDescriptor {
    /// Normalize a raw spec.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError::InvalidDescriptor`] if the binary name is empty.
    pub fn new(spec: TaskSpec) -> Result<Self, LoaderError> {
        if spec.binary_name.trim().is_empty() {
            return Err(LoaderError::InvalidDescriptor(format!(
                "task {} has no binary name",
                spec.id
            )));
        }
        let band = match u8::try_from(spec.priority) {
            Ok(prio) if spec.priority <= MAX_RT_PRIORITY => SchedulingBand::Priority(prio),
            _ => SchedulingBand::Deadline(spec.deadline),
        };
        Ok(Self {
            id: spec.id,
            execution_time: spec.execution_time,
            critical_time: spec.critical_time,
            band,
            period: spec.period,
            offset: spec.offset,
            number_of_jobs: spec.number_of_jobs,
            ram_quota: spec.ram_quota.bytes(),
            cap_quota: spec.cap_quota,
            affinity: CoreAffinity {
                count: spec.core_count.max(1),
                offset: spec.core_offset,
            },
            binary_name: spec.binary_name,
            config: Arc::from(spec.config.into_bytes()),
        })
    }

    /// Task identifier.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Worst-case execution time (ms).
    #[must_use]
    pub const fn execution_time(&self) -> u32 {
        self.execution_time
    }

    /// Critical time (ms); zero disables the critical timer.
    #[must_use]
    pub const fn critical_time(&self) -> u32 {
        self.critical_time
    }

    /// Scheduling band.
    #[must_use]
    pub const fn band(&self) -> SchedulingBand {
        self.band
    }

    /// Effective priority; zero for deadline-scheduled tasks.
    #[must_use]
    pub const fn priority(&self) -> u32 {
        match self.band {
            SchedulingBand::Priority(p) => p as u32,
            SchedulingBand::Deadline(_) => 0,
        }
    }

    /// Effective deadline; zero for priority-scheduled tasks.
    #[must_use]
    pub const fn deadline(&self) -> u32 {
        match self.band {
            SchedulingBand::Priority(_) => 0,
            SchedulingBand::Deadline(d) => d,
        }
    }

    /// Whether the task belongs to the deadline band.
    #[must_use]
    pub const fn is_deadline_scheduled(&self) -> bool {
        matches!(self.band, SchedulingBand::Deadline(_))
    }

    /// Period (ms); zero means a single one-shot start.
    #[must_use]
    pub const fn period(&self) -> u32 {
        self.period
    }

    /// Offset before the first start (ms).
    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Target number of jobs.
    #[must_use]
    pub const fn number_of_jobs(&self) -> u32 {
        self.number_of_jobs
    }

    /// RAM quota in bytes.
    #[must_use]
    pub const fn ram_quota(&self) -> u64 {
        self.ram_quota
    }

    /// Capability quota.
    #[must_use]
    pub const fn cap_quota(&self) -> u32 {
        self.cap_quota
    }

    /// Requested core window.
    #[must_use]
    pub const fn affinity(&self) -> CoreAffinity {
        self.affinity
    }

    /// Name of the binary image to run.
    #[must_use]
    pub fn binary_name(&self) -> &str {
        &self.binary_name
    }

    /// Private configuration blob.
    #[must_use]
    pub fn config(&self) -> Arc<[u8]> {
        Arc::clone(&self.config)
    }

    /// Unique display name combining id and binary, e.g. `01.namaste`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{:02}.{}", self.id, self.binary_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(priority: u32, deadline: u32) -> TaskSpec {
        TaskSpec {
            id: 1,
            priority,
            deadline,
            binary_name: "namaste".into(),
            ..TaskSpec::default()
        }
    }

    #[test]
    fn priority_band_zeroes_deadline() {
        for prio in [0, 1, 64, 127] {
            let desc = TaskDescriptor::new(spec(prio, 500)).unwrap();
            assert_eq!(desc.deadline(), 0);
            assert_eq!(desc.priority(), prio);
            assert!(!desc.is_deadline_scheduled());
        }
    }

    #[test]
    fn deadline_band_zeroes_priority() {
        for prio in [128, 200, u32::MAX] {
            let desc = TaskDescriptor::new(spec(prio, 500)).unwrap();
            assert_eq!(desc.priority(), 0);
            assert_eq!(desc.deadline(), 500);
            assert!(desc.is_deadline_scheduled());
        }
    }

    #[test]
    fn name_pads_id() {
        let desc = TaskDescriptor::new(spec(3, 0)).unwrap();
        assert_eq!(desc.name(), "01.namaste");
    }

    #[test]
    fn empty_binary_rejected() {
        let mut s = spec(3, 0);
        s.binary_name = " ".into();
        assert!(matches!(
            TaskDescriptor::new(s),
            Err(LoaderError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn spec_deserializes_with_suffixed_quota() {
        let s: TaskSpec = serde_json::from_str(
            r#"{"id": 4, "priority": 10, "period": 100, "ram_quota": "1M", "binary_name": "hey"}"#,
        )
        .unwrap();
        assert_eq!(s.ram_quota.bytes(), 1 << 20);
        assert_eq!(s.number_of_jobs, 0);
    }
}
