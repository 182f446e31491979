//! Periodic task state machine.
//!
//! A task owns two timers. The start timer fires at `offset` and then
//! every `period`; each firing either starts a new instance, reuses a
//! soft-exited one, or kills an instance that overran its period. The
//! critical timer is armed once per start and kills the instance when its
//! critical time elapses.
//!
//! Lock order is task state, then instance policy. The exit path only
//! takes the policy lock, so a child exiting while the scheduling thread
//! holds the task lock cannot deadlock.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::child::{ChildInstance, InstanceState};
use crate::core::context::LoaderContext;
use crate::core::descriptor::TaskDescriptor;
use crate::core::event::EventType;
use crate::core::host::ExitReason;
use crate::core::profile::build_snapshot;
use crate::core::timer::{TimerAction, TimerId, TimerTarget};
use crate::util::serde::TaskId;

/// Observable lifecycle phase of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    /// Not armed and no instance.
    Idle,
    /// Start timer armed, no instance alive.
    Armed,
    /// An instance is executing.
    Running,
    /// An instance has exited and waits for reuse or destruction.
    ExitPendingReclaim,
}

struct TaskState {
    paused: bool,
    armed: bool,
    instance: Option<ChildInstance>,
    start_timer: TimerId,
    critical_timer: TimerId,
}

/// One periodic task.
pub struct Task {
    me: Weak<Task>,
    desc: TaskDescriptor,
    name: String,
    ctx: Arc<LoaderContext>,
    iteration: AtomicU32,
    schedulable: AtomicBool,
    state: Mutex<TaskState>,
}

impl Task {
    pub(crate) fn new(desc: TaskDescriptor, ctx: Arc<LoaderContext>) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let target: Weak<dyn TimerTarget> = me.clone();
            let start_timer = ctx.timers.create(target.clone());
            let critical_timer = ctx.timers.create(target);
            Self {
                me: me.clone(),
                name: desc.name(),
                desc,
                ctx,
                iteration: AtomicU32::new(0),
                schedulable: AtomicBool::new(true),
                state: Mutex::new(TaskState {
                    paused: true,
                    armed: false,
                    instance: None,
                    start_timer,
                    critical_timer,
                }),
            }
        })
    }

    /// Task id.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.desc.id()
    }

    /// Task name (`"01.binary"`).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Immutable description.
    #[must_use]
    pub const fn descriptor(&self) -> &TaskDescriptor {
        &self.desc
    }

    /// Number of instances started so far.
    pub fn iteration(&self) -> u32 {
        self.iteration.load(Ordering::Acquire)
    }

    /// Whether the job target has been reached.
    pub fn jobs_done(&self) -> bool {
        self.iteration() == self.desc.number_of_jobs()
    }

    /// Admission outcome.
    pub fn is_schedulable(&self) -> bool {
        self.schedulable.load(Ordering::Acquire)
    }

    pub(crate) fn set_schedulable(&self, schedulable: bool) {
        self.schedulable.store(schedulable, Ordering::Release);
    }

    /// Current phase.
    pub fn phase(&self) -> TaskPhase {
        let state = self.state.lock();
        match &state.instance {
            Some(instance) if instance.is_active() => TaskPhase::Running,
            Some(_) => TaskPhase::ExitPendingReclaim,
            None if state.armed => TaskPhase::Armed,
            None => TaskPhase::Idle,
        }
    }

    /// Whether an instance (running or exited) is still held.
    pub fn has_instance(&self) -> bool {
        self.state.lock().instance.is_some()
    }

    /// Arm the start timer. Non-schedulable tasks only log `NOT_SCHEDULED`.
    pub fn run(&self) {
        if !self.is_schedulable() {
            self.ctx.events.record(EventType::NotScheduled, self.id());
            return;
        }
        let mut state = self.state.lock();
        state.paused = false;
        state.armed = true;
        let timers = &self.ctx.timers;
        timers.sigh(state.start_timer, TimerAction::Start);
        timers.sigh(state.critical_timer, TimerAction::Critical);
        let offset = u64::from(self.desc.offset());
        let period = u64::from(self.desc.period());
        if period > 0 {
            timers.trigger_periodic(state.start_timer, offset, period);
        } else {
            timers.trigger_once(state.start_timer, offset);
        }
        info!(task = %self.name, offset, period, "task armed");
    }

    /// Pause the task, disarm its timers and terminate any instance.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.paused = true;
        self.disarm(&mut state);
        info!(task = %self.name, iteration = self.iteration(), "task stopped");
        self.release_instance(&mut state, ExitReason::External);
    }

    fn disarm(&self, state: &mut TaskState) {
        let timers = &self.ctx.timers;
        for timer in [state.start_timer, state.critical_timer] {
            timers.sigh(timer, TimerAction::Idle);
            timers.trigger_once(timer, 0);
        }
        state.armed = false;
    }

    /// Kill a running instance with `reason`, or hand a soft-exited one to
    /// the destruction worker. An instance that soft-exits while being
    /// killed is handed over as well.
    fn release_instance(&self, state: &mut TaskState, reason: ExitReason) {
        let Some(instance) = state.instance.as_mut() else {
            return;
        };
        if instance.force_exit(reason) {
            return;
        }
        if instance.mark_reclaiming() {
            self.submit_reclaim();
        }
    }

    fn submit_reclaim(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        if let Err(e) = self.ctx.reclaimer.submit(me) {
            warn!(task = %self.name, error = %e, "cannot queue instance for destruction");
        }
    }

    fn push_profile(&self) {
        self.ctx
            .profile
            .push(build_snapshot(self.name.clone(), self.ctx.events.snapshot()));
    }

    fn on_start_tick(&self) {
        let mut state = self.state.lock();
        if state.paused || !state.armed {
            debug!(task = %self.name, "stale start tick ignored");
            return;
        }

        if self.jobs_done() {
            info!(task = %self.name, jobs = self.desc.number_of_jobs(), "all jobs done");
            self.disarm(&mut state);
            self.release_instance(&mut state, ExitReason::Period);
            drop(state);
            self.push_profile();
            return;
        }

        if self.desc.is_deadline_scheduled() && !self.ctx.admission.scheduling_allowed(&self.desc) {
            debug!(task = %self.name, "tick not allowed by admission control");
            self.ctx.events.record(EventType::NotScheduled, self.id());
            return;
        }

        if let Some(instance) = state.instance.as_mut() {
            match instance.state() {
                InstanceState::Active => {
                    warn!(task = %self.name, iteration = self.iteration(), "period overrun, killing instance");
                    instance.force_exit(ExitReason::Period);
                    return;
                }
                InstanceState::Reclaiming => {
                    debug!(task = %self.name, "previous instance awaiting destruction, skipping tick");
                    return;
                }
                InstanceState::SoftExited(_) => {}
            }
        }

        let Some(image) = self.ctx.binaries.get(self.desc.binary_name()) else {
            warn!(task = %self.name, binary = %self.desc.binary_name(), "binary not available, skipping tick");
            return;
        };

        let spawned = if let Some(instance) = state.instance.as_mut() {
            match instance.recycle(&self.desc, &self.ctx, image) {
                Ok(()) => true,
                Err(e) => {
                    warn!(task = %self.name, error = %e, "reusing instance failed, destroying it");
                    if instance.mark_reclaiming() {
                        self.submit_reclaim();
                    }
                    false
                }
            }
        } else {
            let ram_quota = self.desc.ram_quota();
            if ram_quota < self.ctx.min_ram_quota {
                warn!(task = %self.name, ram_quota, minimum = self.ctx.min_ram_quota, "RAM quota is very small");
            }
            if !self.ctx.ram.quota_available(ram_quota) {
                warn!(
                    task = %self.name,
                    requested = ram_quota,
                    available = self.ctx.ram.available(),
                    "not enough RAM quota, skipping tick"
                );
                return;
            }
            match ChildInstance::spawn(self.me.clone(), &self.desc, &self.ctx, image) {
                Ok(instance) => {
                    state.instance = Some(instance);
                    true
                }
                Err(e) if e.is_retryable() => {
                    warn!(task = %self.name, error = %e, "spawn failed, retrying next period");
                    false
                }
                Err(e) => {
                    error!(task = %self.name, error = %e, "spawn failed");
                    false
                }
            }
        };
        if !spawned {
            return;
        }

        let iteration = self.iteration.fetch_add(1, Ordering::AcqRel) + 1;
        self.ctx.events.record(EventType::Start, self.id());
        let critical = self.desc.critical_time();
        if critical > 0 {
            self.ctx.timers.trigger_once(state.critical_timer, u64::from(critical));
        }
        if let Some(instance) = state.instance.as_mut() {
            let linkage = if instance.image().is_dynamically_linked() {
                "dynamic"
            } else {
                "static"
            };
            info!(task = %self.name, iteration, pid = instance.process_id(), linkage, "instance started");
            instance.activate();
        }
    }

    fn on_critical_tick(&self) {
        let mut state = self.state.lock();
        if state.paused {
            return;
        }
        if let Some(instance) = state.instance.as_mut() {
            if instance.is_active() {
                info!(task = %self.name, critical_ms = self.desc.critical_time(), "critical time reached, killing instance");
                instance.force_exit(ExitReason::Critical);
            }
        }
    }

    /// Called by [`ChildPolicy`](crate::core::child::ChildPolicy) with the
    /// policy lock held; must not take the task lock.
    pub(crate) fn on_child_exit(&self, reason: ExitReason) {
        let kind = reason.event_type();
        info!(task = %self.name, code = reason.code(), event = %kind, "instance exited");
        self.ctx.events.record(kind, self.id());
        if self.jobs_done() {
            self.ctx.events.record(EventType::JobsDone, self.id());
            self.push_profile();
        }
        if !reason.is_soft() {
            self.submit_reclaim();
        }
    }

    /// Detach an instance the destruction worker may drop.
    pub(crate) fn take_reclaimable(&self) -> Option<ChildInstance> {
        let mut state = self.state.lock();
        match state.instance.as_ref().map(ChildInstance::state) {
            Some(InstanceState::Reclaiming) => state.instance.take(),
            _ => None,
        }
    }

    pub(crate) fn release_timers(&self) {
        let state = self.state.lock();
        self.ctx.timers.release(state.start_timer);
        self.ctx.timers.release(state.critical_timer);
    }
}

impl TimerTarget for Task {
    fn on_timer(&self, action: TimerAction) {
        match action {
            TimerAction::Start => self.on_start_tick(),
            TimerAction::Critical => self.on_critical_tick(),
            TimerAction::Idle => {}
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("iteration", &self.iteration())
            .field("schedulable", &self.is_schedulable())
            .finish_non_exhaustive()
    }
}
