//! Quota accounting and CPU placement policy.
//!
//! RAM and capability quotas are carved from a parent [`ResourceBudget`]
//! when an instance is spawned and flow back when its [`QuotaAccount`] is
//! dropped. Reservation is a lock-free CAS loop, so concurrent spawns and
//! reclaims never over-commit the budget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::descriptor::{CoreAffinity, SchedulingBand, TaskDescriptor};
use crate::core::error::{LoaderError, ResourceKind};

/// Number of distinct CPU priorities offered by the host.
pub const PRIORITY_LIMIT: u64 = 1 << 16;

/// Number of priority levels in the fixed-priority band.
pub const PRIORITY_LEVELS: u64 = 128;

/// Parent budget quotas are carved from.
#[derive(Debug)]
pub struct ResourceBudget {
    kind: ResourceKind,
    limit: u64,
    reserved: AtomicU64,
}

impl ResourceBudget {
    /// Create a budget of `limit` units.
    #[must_use]
    pub fn new(kind: ResourceKind, limit: u64) -> Arc<Self> {
        Arc::new(Self {
            kind,
            limit,
            reserved: AtomicU64::new(0),
        })
    }

    /// Resource kind this budget accounts.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Total units.
    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    /// Units not currently granted.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.limit
            .saturating_sub(self.reserved.load(Ordering::Acquire))
    }

    /// Whether `amount` could be granted right now.
    #[must_use]
    pub fn quota_available(&self, amount: u64) -> bool {
        amount <= self.available()
    }

    /// Try to reserve `amount` atomically using a CAS loop.
    fn try_reserve(&self, amount: u64) -> bool {
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            match current.checked_add(amount) {
                Some(next) if next <= self.limit => {}
                _ => return false,
            }
            match self.reserved.compare_exchange_weak(
                current,
                current + amount,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, amount: u64) {
        self.reserved.fetch_sub(amount, Ordering::AcqRel);
    }

    /// Carve an account of `amount` units out of this budget.
    ///
    /// # Errors
    ///
    /// [`LoaderError::ResourceExhausted`] when the budget cannot cover it.
    pub fn grant(self: &Arc<Self>, amount: u64) -> Result<QuotaAccount, LoaderError> {
        if !self.try_reserve(amount) {
            return Err(LoaderError::ResourceExhausted {
                kind: self.kind,
                requested: amount,
                available: self.available(),
            });
        }
        Ok(QuotaAccount {
            budget: Arc::clone(self),
            granted: amount,
            consumed: AtomicU64::new(0),
        })
    }
}

/// Quota delegated to one child instance; returned to the budget on drop.
#[derive(Debug)]
pub struct QuotaAccount {
    budget: Arc<ResourceBudget>,
    granted: u64,
    consumed: AtomicU64,
}

impl QuotaAccount {
    /// Units delegated.
    #[must_use]
    pub const fn granted(&self) -> u64 {
        self.granted
    }

    /// Units the child has consumed from its grant.
    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    /// Charge `amount` against the grant on behalf of the child.
    ///
    /// # Errors
    ///
    /// [`LoaderError::ResourceExhausted`] when the grant is used up; the
    /// child infrastructure turns this into an out-of-quota exit.
    pub fn charge(&self, amount: u64) -> Result<(), LoaderError> {
        let mut current = self.consumed.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(amount);
            if next > self.granted {
                return Err(LoaderError::ResourceExhausted {
                    kind: self.budget.kind,
                    requested: amount,
                    available: self.granted - current,
                });
            }
            match self.consumed.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Refill the account to its full grant before the instance is reused.
    /// Returns the number of units restored.
    pub fn top_up(&self) -> u64 {
        self.consumed.swap(0, Ordering::AcqRel)
    }
}

impl Drop for QuotaAccount {
    fn drop(&mut self) {
        self.budget.release(self.granted);
    }
}

/// Size of the host's affinity space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinitySpace {
    /// Number of cores available for placement.
    pub cores: u32,
}

/// Placement of an instance inside the affinity space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityLocation {
    /// First core.
    pub xpos: u32,
    /// Number of cores.
    pub width: u32,
}

impl AffinitySpace {
    /// Fit a requested window into the space, clamping the offset and width.
    #[must_use]
    pub fn locate(&self, affinity: CoreAffinity) -> AffinityLocation {
        let cores = self.cores.max(1);
        let xpos = affinity.offset.min(cores - 1);
        let width = affinity.count.clamp(1, cores - xpos);
        AffinityLocation { xpos, width }
    }
}

/// CPU session parameters derived from a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuBinding {
    /// Host priority value (higher is more urgent); zero in the deadline band.
    pub priority: u64,
    /// Relative deadline in microseconds; zero in the priority band.
    pub deadline_us: u64,
    /// Core placement.
    pub location: AffinityLocation,
}

impl CpuBinding {
    /// Derive the binding for `desc` within `space`.
    #[must_use]
    pub fn for_task(desc: &TaskDescriptor, space: AffinitySpace) -> Self {
        let location = space.locate(desc.affinity());
        match desc.band() {
            SchedulingBand::Priority(prio) => {
                let prio = u64::from(prio).min(PRIORITY_LEVELS - 1);
                Self {
                    priority: ((PRIORITY_LEVELS - prio) * (PRIORITY_LIMIT / PRIORITY_LEVELS))
                        .min(PRIORITY_LIMIT - 1),
                    deadline_us: 0,
                    location,
                }
            }
            SchedulingBand::Deadline(deadline) => Self {
                priority: 0,
                deadline_us: u64::from(deadline) * 1000,
                location,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor::TaskSpec;

    #[test]
    fn grant_and_release_round_trip_budget() {
        let budget = ResourceBudget::new(ResourceKind::Ram, 1000);
        let a = budget.grant(600).unwrap();
        assert_eq!(budget.available(), 400);
        assert!(!budget.quota_available(500));
        assert!(matches!(
            budget.grant(500),
            Err(LoaderError::ResourceExhausted { requested: 500, available: 400, .. })
        ));
        drop(a);
        assert_eq!(budget.available(), 1000);
    }

    #[test]
    fn concurrent_grants_never_overcommit() {
        let budget = ResourceBudget::new(ResourceKind::Caps, 100);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let budget = Arc::clone(&budget);
                std::thread::spawn(move || {
                    (0..50).filter_map(|_| budget.grant(3).ok()).collect::<Vec<_>>()
                })
            })
            .collect();
        let accounts: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        assert_eq!(accounts.len(), 33);
        assert_eq!(budget.available(), 1);
        drop(accounts);
        assert_eq!(budget.available(), 100);
    }

    #[test]
    fn charge_and_top_up() {
        let budget = ResourceBudget::new(ResourceKind::Ram, 100);
        let account = budget.grant(10).unwrap();
        account.charge(6).unwrap();
        assert!(account.charge(5).is_err());
        assert_eq!(account.top_up(), 6);
        account.charge(10).unwrap();
        assert_eq!(budget.available(), 90);
    }

    #[test]
    fn affinity_is_clamped_into_space() {
        let space = AffinitySpace { cores: 4 };
        assert_eq!(
            space.locate(CoreAffinity { count: 2, offset: 1 }),
            AffinityLocation { xpos: 1, width: 2 }
        );
        assert_eq!(
            space.locate(CoreAffinity { count: 8, offset: 9 }),
            AffinityLocation { xpos: 3, width: 1 }
        );
    }

    fn host_priority(priority: u32) -> u64 {
        let desc = TaskDescriptor::new(TaskSpec {
            id: 1,
            priority,
            binary_name: "a".into(),
            ..TaskSpec::default()
        })
        .unwrap();
        CpuBinding::for_task(&desc, AffinitySpace { cores: 2 }).priority
    }

    #[test]
    fn priority_band_maps_onto_host_range() {
        assert_eq!(host_priority(0), PRIORITY_LIMIT - 1);
        assert_eq!(host_priority(1), 127 * 512);
        assert_eq!(host_priority(127), 512);

        let desc = TaskDescriptor::new(TaskSpec {
            id: 2,
            priority: 300,
            deadline: 40,
            binary_name: "a".into(),
            ..TaskSpec::default()
        })
        .unwrap();
        let cpu = CpuBinding::for_task(&desc, AffinitySpace { cores: 2 });
        assert_eq!(cpu.priority, 0);
        assert_eq!(cpu.deadline_us, 40_000);
    }
}
