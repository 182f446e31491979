//! Timer service driving the start and critical-time ticks.
//!
//! Every timer is a slot holding a weak reference to its target and the
//! action its handler is currently bound to. Due times live in a min-heap
//! tagged with the slot's generation; re-arming stamps a fresh generation
//! from the service-wide sequence, so superseded entries are discarded when
//! they surface even after their slot has been released and reused. Firings are handed
//! out one at a time and dispatched by the caller with no lock held, so a
//! handler may freely re-arm timers.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::util::clock::Clock;

/// Handler binding of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerAction {
    /// Start-of-period tick.
    Start,
    /// Critical-time kill.
    Critical,
    /// No-op, used to disarm.
    Idle,
}

/// Object receiving timer firings.
pub trait TimerTarget: Send + Sync {
    /// Handle one firing of `action`.
    fn on_timer(&self, action: TimerAction);
}

/// Handle to a timer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

struct TimerSlot {
    target: Weak<dyn TimerTarget>,
    action: TimerAction,
    period: u64,
    generation: u64,
    armed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Due {
    at: u64,
    seq: u64,
    slot: usize,
    generation: u64,
}

#[derive(Default)]
struct TimerState {
    slots: Vec<Option<TimerSlot>>,
    free: Vec<usize>,
    queue: BinaryHeap<Reverse<Due>>,
    seq: u64,
    shutdown: bool,
}

impl TimerState {
    fn slot_mut(&mut self, id: TimerId) -> Option<&mut TimerSlot> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    fn schedule(&mut self, id: TimerId, at: u64, period: u64) {
        let seq = self.seq;
        let Some(slot) = self.slot_mut(id) else {
            tracing::debug!(timer = id.0, "trigger on released timer");
            return;
        };
        slot.generation = seq;
        slot.period = period;
        slot.armed = true;
        let generation = slot.generation;
        self.seq += 1;
        self.queue.push(Reverse(Due {
            at,
            seq,
            slot: id.0,
            generation,
        }));
    }

    /// Drop stale heap heads so `peek` reflects a live entry.
    fn prune(&mut self) {
        while let Some(Reverse(head)) = self.queue.peek() {
            let live = self
                .slots
                .get(head.slot)
                .and_then(Option::as_ref)
                .is_some_and(|s| s.armed && s.generation == head.generation);
            if live {
                break;
            }
            self.queue.pop();
        }
    }
}

/// One pending handler invocation.
pub struct Firing {
    target: Weak<dyn TimerTarget>,
    action: TimerAction,
    at: u64,
}

impl Firing {
    /// Scheduled time of the firing.
    #[must_use]
    pub const fn at(&self) -> u64 {
        self.at
    }

    /// Bound action.
    #[must_use]
    pub const fn action(&self) -> TimerAction {
        self.action
    }

    /// Invoke the handler if the target is still alive.
    pub fn dispatch(self) {
        if self.action == TimerAction::Idle {
            return;
        }
        if let Some(target) = self.target.upgrade() {
            target.on_timer(self.action);
        }
    }
}

/// Shared timer service.
pub struct TimerService {
    clock: Arc<dyn Clock>,
    state: Mutex<TimerState>,
    changed: Condvar,
}

impl TimerService {
    /// Create a service reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(TimerState::default()),
            changed: Condvar::new(),
        }
    }

    /// Clock the service schedules against.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Allocate a disarmed timer bound to `Idle`.
    pub fn create(&self, target: Weak<dyn TimerTarget>) -> TimerId {
        let mut state = self.state.lock();
        let slot = TimerSlot {
            target,
            action: TimerAction::Idle,
            period: 0,
            generation: 0,
            armed: false,
        };
        if let Some(index) = state.free.pop() {
            state.slots[index] = Some(slot);
            TimerId(index)
        } else {
            state.slots.push(Some(slot));
            TimerId(state.slots.len() - 1)
        }
    }

    /// Free a timer; pending firings are discarded.
    pub fn release(&self, id: TimerId) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(id.0) {
            if slot.take().is_some() {
                state.free.push(id.0);
            }
        }
    }

    /// Rebind the handler without touching the schedule.
    pub fn sigh(&self, id: TimerId, action: TimerAction) {
        if let Some(slot) = self.state.lock().slot_mut(id) {
            slot.action = action;
        }
    }

    /// Fire after `first_delay_ms` and then every `period_ms`.
    ///
    /// A zero period degenerates to a one-shot.
    pub fn trigger_periodic(&self, id: TimerId, first_delay_ms: u64, period_ms: u64) {
        let at = self.clock.now_ms().saturating_add(first_delay_ms);
        self.state.lock().schedule(id, at, period_ms);
        self.changed.notify_all();
    }

    /// Fire once after `delay_ms`, replacing any previous schedule.
    pub fn trigger_once(&self, id: TimerId, delay_ms: u64) {
        self.trigger_periodic(id, delay_ms, 0);
    }

    /// Whether `id` has a pending firing.
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.state
            .lock()
            .slots
            .get(id.0)
            .and_then(Option::as_ref)
            .is_some_and(|s| s.armed)
    }

    /// Number of timers with a pending firing.
    pub fn armed_count(&self) -> usize {
        self.state
            .lock()
            .slots
            .iter()
            .flatten()
            .filter(|s| s.armed)
            .count()
    }

    /// Number of allocated timers.
    pub fn len(&self) -> usize {
        self.state.lock().slots.iter().flatten().count()
    }

    /// Whether no timer is allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest pending firing time.
    pub fn next_deadline(&self) -> Option<u64> {
        let mut state = self.state.lock();
        state.prune();
        state.queue.peek().map(|Reverse(d)| d.at)
    }

    /// Take the earliest firing due at or before `now`.
    ///
    /// Periodic timers are rescheduled relative to their due time, not to
    /// `now`, so late dispatch does not accumulate drift.
    pub fn pop_due(&self, now: u64) -> Option<Firing> {
        let mut state = self.state.lock();
        state.prune();
        let due = match state.queue.peek() {
            Some(Reverse(head)) if head.at <= now => *head,
            _ => return None,
        };
        state.queue.pop();
        let seq = state.seq;
        let slot = state.slots.get_mut(due.slot).and_then(Option::as_mut)?;
        let firing = Firing {
            target: slot.target.clone(),
            action: slot.action,
            at: due.at,
        };
        if slot.period == 0 {
            slot.armed = false;
        } else {
            let next = Due {
                at: due.at.saturating_add(slot.period),
                seq,
                ..due
            };
            state.seq += 1;
            state.queue.push(Reverse(next));
        }
        Some(firing)
    }

    /// Dispatch everything due at `now`. Returns the number of firings.
    pub fn dispatch_due(&self, now: u64) -> usize {
        let mut fired = 0;
        while let Some(firing) = self.pop_due(now) {
            firing.dispatch();
            fired += 1;
        }
        fired
    }

    /// Block until the next deadline, a schedule change, or shutdown.
    /// Returns `false` once the service is shut down.
    pub fn wait_next(&self) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }
        state.prune();
        match state.queue.peek().map(|Reverse(d)| d.at) {
            Some(at) => {
                let now = self.clock.now_ms();
                if at > now {
                    let _ = self
                        .changed
                        .wait_for(&mut state, Duration::from_millis(at - now));
                }
            }
            None => self.changed.wait(&mut state),
        }
        !state.shutdown
    }

    /// Wake every waiter and make [`wait_next`](Self::wait_next) return `false`.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.changed.notify_all();
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TimerService")
            .field("timers", &state.slots.iter().flatten().count())
            .field("queued", &state.queue.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::ManualClock;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TimerAction>>);

    impl TimerTarget for Recorder {
        fn on_timer(&self, action: TimerAction) {
            self.0.lock().push(action);
        }
    }

    fn setup() -> (ManualClock, TimerService, Arc<Recorder>, TimerId) {
        let clock = ManualClock::new();
        let timers = TimerService::new(Arc::new(clock.clone()));
        let target = Arc::new(Recorder::default());
        let weak: Weak<dyn TimerTarget> = Arc::downgrade(&target) as Weak<dyn TimerTarget>;
        let id = timers.create(weak);
        (clock, timers, target, id)
    }

    #[test]
    fn periodic_fires_without_drift() {
        let (clock, timers, target, id) = setup();
        timers.sigh(id, TimerAction::Start);
        timers.trigger_periodic(id, 10, 100);
        assert_eq!(timers.next_deadline(), Some(10));
        assert_eq!(timers.dispatch_due(9), 0);

        clock.set(135);
        assert_eq!(timers.dispatch_due(135), 2);
        assert_eq!(timers.next_deadline(), Some(210));
        assert_eq!(target.0.lock().len(), 2);
    }

    #[test]
    fn rearm_supersedes_pending_schedule() {
        let (_clock, timers, target, id) = setup();
        timers.sigh(id, TimerAction::Critical);
        timers.trigger_once(id, 50);
        timers.trigger_once(id, 80);
        assert_eq!(timers.dispatch_due(60), 0);
        assert_eq!(timers.dispatch_due(80), 1);
        assert!(!timers.is_armed(id));
        assert_eq!(*target.0.lock(), [TimerAction::Critical]);
    }

    #[test]
    fn idle_binding_disarms_silently() {
        let (_clock, timers, target, id) = setup();
        timers.sigh(id, TimerAction::Start);
        timers.trigger_periodic(id, 0, 10);
        timers.sigh(id, TimerAction::Idle);
        timers.trigger_once(id, 0);
        assert_eq!(timers.dispatch_due(100), 1);
        assert_eq!(timers.armed_count(), 0);
        assert!(target.0.lock().is_empty());
    }

    #[test]
    fn released_slot_is_reused_and_stale_entries_dropped() {
        let (_clock, timers, _target, id) = setup();
        timers.sigh(id, TimerAction::Start);
        timers.trigger_once(id, 5);
        timers.release(id);
        assert_eq!(timers.next_deadline(), None);
        assert!(timers.is_empty());

        let other = Arc::new(Recorder::default());
        let weak: Weak<dyn TimerTarget> = Arc::downgrade(&other) as Weak<dyn TimerTarget>;
        let reused = timers.create(weak);
        assert_eq!(reused, id);
        assert_eq!(timers.dispatch_due(10), 0);
    }

    #[test]
    fn reused_slot_ignores_previous_periodic_entries() {
        let (_clock, timers, first, id) = setup();
        timers.sigh(id, TimerAction::Start);
        timers.trigger_periodic(id, 0, 10);
        timers.sigh(id, TimerAction::Idle);
        timers.trigger_once(id, 0);
        timers.release(id);

        let other = Arc::new(Recorder::default());
        let weak: Weak<dyn TimerTarget> = Arc::downgrade(&other) as Weak<dyn TimerTarget>;
        let reused = timers.create(weak);
        assert_eq!(reused, id);
        timers.sigh(reused, TimerAction::Start);
        timers.trigger_periodic(reused, 50, 100);

        assert_eq!(timers.next_deadline(), Some(50));
        assert_eq!(timers.dispatch_due(49), 0);
        assert_eq!(timers.dispatch_due(250), 3);
        assert_eq!(timers.next_deadline(), Some(350));
        assert_eq!(other.0.lock().len(), 3);
        assert!(first.0.lock().is_empty());
    }

    #[test]
    fn shutdown_unblocks_waiter() {
        let (_clock, timers, _target, _id) = setup();
        let timers = Arc::new(timers);
        let waiter = {
            let timers = Arc::clone(&timers);
            std::thread::spawn(move || timers.wait_next())
        };
        std::thread::sleep(Duration::from_millis(20));
        timers.shutdown();
        assert!(!waiter.join().unwrap());
    }
}
