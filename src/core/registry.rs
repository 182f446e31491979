//! Task registry: the loader's public operations.
//!
//! The registry owns the tasks, the shared context, the two deferred
//! workers and the scheduling driver. With [`Driver::Thread`] a dedicated
//! thread sleeps until the next timer deadline and dispatches handlers;
//! with [`Driver::Manual`] the caller advances a [`ManualClock`] and
//! handlers run on the calling thread, one firing at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::admission::{Admission, AdmissionControl, AdmissionRequest};
use crate::core::binary::{BinaryCache, BinaryImage};
use crate::core::context::LoaderContext;
use crate::core::descriptor::{TaskDescriptor, TaskSpec};
use crate::core::error::ResourceKind;
use crate::core::event::{Event, EventLog, EventType};
use crate::core::host::ProcessHost;
use crate::core::profile::ProfileSink;
use crate::core::quota::{AffinitySpace, ResourceBudget};
use crate::core::service::ServiceRegistry;
use crate::core::task::{Task, TaskPhase};
use crate::core::timer::TimerService;
use crate::core::workers::DeferredQueue;
use crate::core::LoaderError;
use crate::util::clock::{Clock, ManualClock};
use crate::util::serde::TaskId;

/// Task id used for events attributed to the loader itself.
pub const LOADER_TASK_ID: TaskId = 0;

/// How the timer service is driven.
#[derive(Debug, Clone)]
pub enum Driver {
    /// Dedicated scheduling thread on a monotonic clock.
    Thread,
    /// Caller-driven time; see [`TaskRegistry::advance_to`].
    Manual(ManualClock),
}

/// Parameters a registry is assembled from.
pub struct RegistryParts {
    /// RAM budget in bytes.
    pub ram_budget: u64,
    /// Capability budget.
    pub cap_budget: u64,
    /// Cores in the affinity space.
    pub affinity_cores: u32,
    /// Quotas below this trigger a warning.
    pub min_ram_quota: u64,
    /// How long `clear_tasks` waits for instances to be reclaimed.
    pub drain_timeout: Duration,
    /// Stack size of worker threads.
    pub worker_stack_size: usize,
    /// Clock shared by the event log and timers.
    pub clock: Arc<dyn Clock>,
    /// Timer driver.
    pub driver: Driver,
    /// Process creation primitive.
    pub host: Arc<dyn ProcessHost>,
    /// Admission control.
    pub admission: Arc<dyn AdmissionControl>,
    /// Telemetry sink.
    pub profile: Arc<dyn ProfileSink>,
}

/// Outcome of one `add_tasks` batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddReport {
    /// Tasks added and admitted.
    pub accepted: Vec<TaskId>,
    /// Tasks added but refused by admission control.
    pub rejected: Vec<TaskId>,
    /// Descriptions that failed validation, with the reason.
    pub invalid: Vec<(TaskId, String)>,
}

/// Point-in-time registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Tasks in the registry.
    pub tasks: usize,
    /// Tasks that passed admission.
    pub schedulable: usize,
    /// Tasks with nothing armed and no instance.
    pub idle: usize,
    /// Tasks with an armed start timer and no instance.
    pub armed: usize,
    /// Tasks with a running instance.
    pub running: usize,
    /// Tasks holding an exited instance.
    pub pending_reclaim: usize,
    /// Timers with a pending firing.
    pub armed_timers: usize,
    /// Events in the log.
    pub events: usize,
    /// Registered binaries.
    pub binaries: usize,
    /// RAM not granted to any instance.
    pub ram_available: u64,
    /// Capabilities not granted to any instance.
    pub caps_available: u64,
    /// Instances waiting for destruction.
    pub pending_destruction: usize,
    /// Tasks waiting for a deferred start.
    pub pending_starts: usize,
}

enum Scheduling {
    Thread(Mutex<Option<JoinHandle<()>>>),
    Manual(ManualClock),
}

/// The task registry.
pub struct TaskRegistry {
    ctx: Arc<LoaderContext>,
    tasks: RwLock<Vec<Arc<Task>>>,
    destroyer: DeferredQueue<Arc<Task>>,
    starter: DeferredQueue<Arc<Task>>,
    scheduling: Scheduling,
    drain_timeout: Duration,
    shutdown: AtomicBool,
}

impl TaskRegistry {
    /// Assemble a registry and start its worker threads.
    ///
    /// # Errors
    ///
    /// [`LoaderError::Internal`] when a worker thread cannot be spawned.
    pub fn new(parts: RegistryParts) -> Result<Self, LoaderError> {
        let clock: Arc<dyn Clock> = match &parts.driver {
            Driver::Thread => parts.clock,
            Driver::Manual(clock) => Arc::new(clock.clone()),
        };
        let timers = Arc::new(TimerService::new(Arc::clone(&clock)));

        let destroyer = DeferredQueue::spawn("destroy", parts.worker_stack_size, |task: Arc<Task>| {
            let started = Instant::now();
            if let Some(instance) = task.take_reclaimable() {
                drop(instance);
                debug!(
                    task = %task.name(),
                    elapsed_us = started.elapsed().as_micros(),
                    "instance reclaimed"
                );
            }
        })?;
        let starter = DeferredQueue::spawn("start", parts.worker_stack_size, |task: Arc<Task>| {
            task.run();
        })?;

        let ctx = Arc::new(LoaderContext {
            events: Arc::new(EventLog::new(Arc::clone(&clock))),
            timers: Arc::clone(&timers),
            ram: ResourceBudget::new(ResourceKind::Ram, parts.ram_budget),
            caps: ResourceBudget::new(ResourceKind::Caps, parts.cap_budget),
            affinity: AffinitySpace {
                cores: parts.affinity_cores,
            },
            min_ram_quota: parts.min_ram_quota,
            host: parts.host,
            admission: parts.admission,
            profile: parts.profile,
            binaries: BinaryCache::new(),
            services: Arc::new(ServiceRegistry::new()),
            reclaimer: destroyer.submitter(),
        });

        let scheduling = match parts.driver {
            Driver::Thread => Scheduling::Thread(Mutex::new(Some(spawn_scheduler(
                timers,
                parts.worker_stack_size,
            )?))),
            Driver::Manual(clock) => Scheduling::Manual(clock),
        };

        info!(
            ram_budget = parts.ram_budget,
            cap_budget = parts.cap_budget,
            cores = parts.affinity_cores,
            "task registry initialized"
        );

        Ok(Self {
            ctx,
            tasks: RwLock::new(Vec::new()),
            destroyer,
            starter,
            scheduling,
            drain_timeout: parts.drain_timeout,
            shutdown: AtomicBool::new(false),
        })
    }

    fn ensure_running(&self) -> Result<(), LoaderError> {
        if self.shutdown.load(Ordering::Acquire) {
            Err(LoaderError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Add a batch of task descriptions.
    ///
    /// Each task is tested for admission exactly once; rejected tasks stay
    /// in the registry as non-schedulable and get a `NOT_SCHEDULED` event.
    /// Invalid descriptions are skipped without affecting the rest.
    ///
    /// # Errors
    ///
    /// [`LoaderError::Shutdown`] after [`shutdown`](Self::shutdown).
    pub fn add_tasks<I>(&self, specs: I) -> Result<AddReport, LoaderError>
    where
        I: IntoIterator<Item = TaskSpec>,
    {
        self.ensure_running()?;
        let mut report = AddReport::default();
        for spec in specs {
            let id = spec.id;
            let desc = match TaskDescriptor::new(spec) {
                Ok(desc) => desc,
                Err(e) => {
                    warn!(task_id = id, error = %e, "skipping invalid task description");
                    report.invalid.push((id, e.to_string()));
                    continue;
                }
            };
            if self.task(id).is_some() {
                warn!(task_id = id, "duplicate task id");
            }
            let request = AdmissionRequest::for_task(&desc);
            let task = Task::new(desc, Arc::clone(&self.ctx));
            match self.ctx.admission.admit(&request) {
                Admission::Accepted => {
                    info!(task = %task.name(), "task admitted");
                    report.accepted.push(id);
                }
                Admission::Rejected => {
                    info!(task = %task.name(), "task rejected by admission control");
                    task.set_schedulable(false);
                    self.ctx.events.record(EventType::NotScheduled, id);
                    report.rejected.push(id);
                }
            }
            self.tasks.write().push(task);
        }
        Ok(report)
    }

    /// Stop every task, wait for all instances to be destroyed and empty
    /// the registry. Returns the number of tasks removed.
    ///
    /// # Errors
    ///
    /// [`LoaderError::ReclaimTimeout`] if instances are still alive after
    /// the drain timeout; the tasks are kept in that case.
    pub fn clear_tasks(&self) -> Result<usize, LoaderError> {
        let tasks = self.tasks.read().clone();
        for task in &tasks {
            task.stop();
        }
        let deadline = Instant::now() + self.drain_timeout;
        let live = loop {
            self.destroyer
                .wait_idle(deadline.saturating_duration_since(Instant::now()));
            let live = tasks.iter().filter(|t| t.has_instance()).count();
            if live == 0 || Instant::now() >= deadline {
                break live;
            }
            // An exit may still be in flight on a host thread.
            thread::sleep(Duration::from_millis(1));
        };
        if live > 0 {
            warn!(live, "instances not reclaimed before timeout");
            return Err(LoaderError::ReclaimTimeout(live));
        }
        let removed: Vec<_> = std::mem::take(&mut *self.tasks.write());
        for task in &removed {
            task.release_timers();
        }
        info!(removed = removed.len(), "tasks cleared");
        Ok(removed.len())
    }

    /// Register or replace a binary image.
    ///
    /// # Errors
    ///
    /// [`LoaderError::Shutdown`] after [`shutdown`](Self::shutdown).
    pub fn register_binary(&self, name: &str, bytes: impl Into<Arc<[u8]>>) -> Result<(), LoaderError> {
        self.ensure_running()?;
        let image = BinaryImage::new(name, bytes);
        let linkage = if image.is_dynamically_linked() {
            "dynamic"
        } else {
            "static"
        };
        if self.ctx.binaries.insert(image).is_some() {
            info!(binary = name, linkage, "binary replaced");
        } else {
            info!(binary = name, linkage, "binary registered");
        }
        Ok(())
    }

    /// Arm every schedulable task on the calling thread. Non-schedulable
    /// tasks get a `NOT_SCHEDULED` event.
    ///
    /// # Errors
    ///
    /// [`LoaderError::Shutdown`] after [`shutdown`](Self::shutdown).
    pub fn start(&self) -> Result<(), LoaderError> {
        self.ensure_running()?;
        for task in self.tasks.read().iter() {
            task.run();
        }
        Ok(())
    }

    /// Like [`start`](Self::start), but arming happens on the start worker.
    ///
    /// # Errors
    ///
    /// [`LoaderError::Shutdown`] after [`shutdown`](Self::shutdown).
    pub fn request_start(&self) -> Result<(), LoaderError> {
        self.ensure_running()?;
        for task in self.tasks.read().iter() {
            if task.is_schedulable() {
                self.starter.submit(Arc::clone(task))?;
            } else {
                self.ctx.events.record(EventType::NotScheduled, task.id());
            }
        }
        Ok(())
    }

    /// Stop every task. Non-schedulable tasks get a `NOT_SCHEDULED` event.
    pub fn stop(&self) {
        for task in self.tasks.read().iter() {
            if task.is_schedulable() {
                task.stop();
            } else {
                self.ctx.events.record(EventType::NotScheduled, task.id());
            }
        }
    }

    /// Drain the event log and render it as JSON.
    ///
    /// # Errors
    ///
    /// [`LoaderError::Serialization`] if rendering fails.
    pub fn profile_data(&self) -> Result<String, LoaderError> {
        Ok(self.ctx.events.drain().to_json()?)
    }

    /// Events currently in the log, without draining.
    pub fn events(&self) -> Vec<Event> {
        self.ctx.events.snapshot()
    }

    /// Inject an operator marker into the log.
    pub fn record_external(&self, task_id: TaskId) {
        self.ctx.events.record(EventType::External, task_id);
    }

    /// Make a parent service available to pending session requests.
    pub fn announce_service(&self, service: &str) {
        self.ctx.services.announce(service);
    }

    /// Parent service registry.
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.ctx.services
    }

    /// Look up a task by id.
    pub fn task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.read().iter().find(|t| t.id() == id).cloned()
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.tasks.read().clone()
    }

    /// Budget RAM not granted to any instance.
    pub fn ram_available(&self) -> u64 {
        self.ctx.ram.available()
    }

    /// Budget capabilities not granted to any instance.
    pub fn caps_available(&self) -> u64 {
        self.ctx.caps.available()
    }

    /// Timers with a pending firing.
    pub fn armed_timers(&self) -> usize {
        self.ctx.timers.armed_count()
    }

    /// Current time on the registry clock.
    pub fn now_ms(&self) -> u64 {
        self.ctx.timers.clock().now_ms()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> RegistryStats {
        let tasks = self.tasks.read();
        let mut stats = RegistryStats {
            tasks: tasks.len(),
            armed_timers: self.ctx.timers.armed_count(),
            events: self.ctx.events.len(),
            binaries: self.ctx.binaries.len(),
            ram_available: self.ctx.ram.available(),
            caps_available: self.ctx.caps.available(),
            pending_destruction: self.destroyer.pending(),
            pending_starts: self.starter.pending(),
            ..RegistryStats::default()
        };
        for task in tasks.iter() {
            if task.is_schedulable() {
                stats.schedulable += 1;
            }
            match task.phase() {
                TaskPhase::Idle => stats.idle += 1,
                TaskPhase::Armed => stats.armed += 1,
                TaskPhase::Running => stats.running += 1,
                TaskPhase::ExitPendingReclaim => stats.pending_reclaim += 1,
            }
        }
        stats
    }

    /// Advance a manual clock to `target_ms`, dispatching every firing due
    /// on the way in time order. Returns the number of firings.
    ///
    /// # Errors
    ///
    /// [`LoaderError::InvalidConfig`] when the registry runs its own
    /// scheduling thread.
    pub fn advance_to(&self, target_ms: u64) -> Result<usize, LoaderError> {
        let Scheduling::Manual(clock) = &self.scheduling else {
            return Err(LoaderError::InvalidConfig(
                "advance_to requires the manual driver".into(),
            ));
        };
        let timers = &self.ctx.timers;
        let mut fired = 0;
        while let Some(at) = timers.next_deadline() {
            if at > target_ms {
                break;
            }
            clock.set(at);
            fired += timers.dispatch_due(clock.now_ms());
        }
        clock.set(target_ms);
        Ok(fired)
    }

    /// Advance a manual clock by `delta_ms`.
    ///
    /// # Errors
    ///
    /// See [`advance_to`](Self::advance_to).
    pub fn advance(&self, delta_ms: u64) -> Result<usize, LoaderError> {
        self.advance_to(self.now_ms().saturating_add(delta_ms))
    }

    /// Wait until no destruction or start work is queued.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.starter.wait_idle(timeout)
            && self
                .destroyer
                .wait_idle(deadline.saturating_duration_since(Instant::now()))
    }

    /// Stop all tasks, drain destruction and join every thread.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down task registry");
        self.stop();
        if !self.destroyer.wait_idle(self.drain_timeout) {
            warn!("destruction queue not drained before shutdown");
        }
        self.ctx.timers.shutdown();
        if let Scheduling::Thread(handle) = &self.scheduling {
            if let Some(handle) = handle.lock().take() {
                if handle.join().is_err() {
                    warn!("scheduling thread panicked");
                }
            }
        }
        self.starter.shutdown();
        self.destroyer.shutdown();
        info!("task registry shut down");
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.ctx.timers.shutdown();
            debug!("task registry dropped without explicit shutdown");
        }
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.read().len())
            .field("timers", &self.ctx.timers)
            .field("events", &self.ctx.events.len())
            .finish_non_exhaustive()
    }
}

fn spawn_scheduler(timers: Arc<TimerService>, stack_size: usize) -> Result<JoinHandle<()>, LoaderError> {
    thread::Builder::new()
        .name("tl-scheduler".into())
        .stack_size(stack_size)
        .spawn(move || {
            debug!("scheduling thread started");
            loop {
                let now = timers.clock().now_ms();
                timers.dispatch_due(now);
                if !timers.wait_next() {
                    break;
                }
            }
            debug!("scheduling thread exiting");
        })
        .map_err(|e| LoaderError::Internal(format!("failed to spawn scheduling thread: {e}")))
}
