//! Child instances and the per-instance exit policy.
//!
//! [`ChildPolicy`] is what the host calls back into: it is shared with the
//! host's notification thread and guards the instance's lifecycle state
//! with its own lock, so exit handling never touches the task lock. The
//! policy refers back to its task through a `Weak` handle.

use std::sync::{Arc, Weak};

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::binary::BinaryImage;
use crate::core::context::LoaderContext;
use crate::core::descriptor::TaskDescriptor;
use crate::core::host::{ChildProcess, ExitReason, ProcessId, SpawnRequest};
use crate::core::quota::{CpuBinding, QuotaAccount};
use crate::core::service::{Resolution, ServiceListener, ServiceRegistry, SessionRouter};
use crate::core::task::Task;
use crate::core::LoaderError;
use crate::util::serde::TaskId;

/// Lifecycle state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Running; the next exit notification is authoritative.
    Active,
    /// Exited with a soft code and may be reused on the next tick.
    SoftExited(ExitReason),
    /// Handed to the destruction worker.
    Reclaiming,
}

/// Exit hook and session policy of one child instance.
pub struct ChildPolicy {
    task: Weak<Task>,
    task_id: TaskId,
    name: String,
    state: Mutex<InstanceState>,
    router: SessionRouter,
}

impl ChildPolicy {
    pub(crate) fn new(
        task: Weak<Task>,
        desc: &TaskDescriptor,
        image: Arc<BinaryImage>,
        services: Arc<ServiceRegistry>,
    ) -> Arc<Self> {
        let name = desc.name();
        let policy = Arc::new(Self {
            task,
            task_id: desc.id(),
            router: SessionRouter::new(name.clone(), image, desc.config(), Arc::clone(&services)),
            name,
            state: Mutex::new(InstanceState::Active),
        });
        let listener: Weak<dyn ServiceListener> = Arc::downgrade(&policy) as Weak<dyn ServiceListener>;
        services.subscribe(listener);
        policy
    }

    /// Child name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning task id.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InstanceState {
        *self.state.lock()
    }

    /// Whether the instance is still running.
    pub fn is_active(&self) -> bool {
        self.state() == InstanceState::Active
    }

    /// Exit notification from the child or the loader.
    ///
    /// Only the first notification per activation has any effect; later
    /// ones (a natural exit racing a forced kill) are ignored. Returns
    /// whether this notification was the one that took effect.
    pub fn exit(&self, code: i32) -> bool {
        let reason = ExitReason::from_code(code);
        let mut state = self.state.lock();
        if *state != InstanceState::Active {
            debug!(child = %self.name, code, "exit notification ignored, instance not active");
            return false;
        }
        *state = if reason.is_soft() {
            InstanceState::SoftExited(reason)
        } else {
            InstanceState::Reclaiming
        };
        match self.task.upgrade() {
            Some(task) => task.on_child_exit(reason),
            None => debug!(child = %self.name, code, "exit after task removal"),
        }
        true
    }

    /// Route a session request issued by the child.
    pub fn resolve_session(&self, service: &str, args: &str) -> Resolution {
        self.router.resolve(service, args)
    }

    /// Number of session requests waiting for a service.
    pub fn pending_sessions(&self) -> usize {
        self.router.pending()
    }

    fn reactivate(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, InstanceState::SoftExited(_)) {
            *state = InstanceState::Active;
            true
        } else {
            false
        }
    }

    fn mark_reclaiming(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, InstanceState::SoftExited(_)) {
            *state = InstanceState::Reclaiming;
            true
        } else {
            false
        }
    }
}

impl ServiceListener for ChildPolicy {
    fn service_announced(&self, _service: &str) {
        self.router.retry_pending();
    }
}

impl std::fmt::Debug for ChildPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildPolicy")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

/// A spawned child together with the quota delegated to it.
///
/// Dropping the instance releases the process and returns its quota.
pub struct ChildInstance {
    policy: Arc<ChildPolicy>,
    process: Box<dyn ChildProcess>,
    ram: Arc<QuotaAccount>,
    caps: Arc<QuotaAccount>,
    cpu: CpuBinding,
    image: Arc<BinaryImage>,
}

impl ChildInstance {
    pub(crate) fn spawn(
        task: Weak<Task>,
        desc: &TaskDescriptor,
        ctx: &LoaderContext,
        image: Arc<BinaryImage>,
    ) -> Result<Self, LoaderError> {
        let ram = Arc::new(ctx.ram.grant(desc.ram_quota())?);
        let caps = Arc::new(ctx.caps.grant(u64::from(desc.cap_quota()))?);
        let cpu = CpuBinding::for_task(desc, ctx.affinity);
        let policy = ChildPolicy::new(task, desc, Arc::clone(&image), Arc::clone(&ctx.services));
        let process = launch(desc, ctx, &policy, &image, &ram, &caps, cpu)?;
        debug!(
            child = %policy.name,
            pid = process.id(),
            ram = ram.granted(),
            caps = caps.granted(),
            "instance created"
        );
        Ok(Self {
            policy,
            process,
            ram,
            caps,
            cpu,
            image,
        })
    }

    /// Reuse a soft-exited instance: refill its accounts and spawn a fresh
    /// process under the same policy. The instance stays soft-exited if
    /// the host refuses.
    pub(crate) fn recycle(
        &mut self,
        desc: &TaskDescriptor,
        ctx: &LoaderContext,
        image: Arc<BinaryImage>,
    ) -> Result<(), LoaderError> {
        let ram = self.ram.top_up();
        let caps = self.caps.top_up();
        debug!(child = %self.policy.name, ram, caps, "accounts topped up");
        let process = launch(desc, ctx, &self.policy, &image, &self.ram, &self.caps, self.cpu)?;
        self.process = process;
        self.image = image;
        if !self.policy.reactivate() {
            warn!(child = %self.policy.name, "recycled instance was not soft-exited");
        }
        Ok(())
    }

    /// Lifecycle state.
    pub fn state(&self) -> InstanceState {
        self.policy.state()
    }

    /// Whether the instance is running.
    pub fn is_active(&self) -> bool {
        self.policy.is_active()
    }

    /// Host process id of the current process.
    pub fn process_id(&self) -> ProcessId {
        self.process.id()
    }

    /// Shared exit policy.
    pub fn policy(&self) -> &Arc<ChildPolicy> {
        &self.policy
    }

    /// Image the current process runs.
    pub fn image(&self) -> &Arc<BinaryImage> {
        &self.image
    }

    pub(crate) fn activate(&mut self) {
        self.process.activate();
    }

    /// Kill a running instance and deliver the exit through the policy.
    /// Returns `false` if the instance was not running or its own exit
    /// arrived before the kill was delivered.
    pub(crate) fn force_exit(&mut self, reason: ExitReason) -> bool {
        if !self.is_active() {
            return false;
        }
        self.process.kill(reason);
        self.policy.exit(reason.code())
    }

    pub(crate) fn mark_reclaiming(&self) -> bool {
        self.policy.mark_reclaiming()
    }
}

impl Drop for ChildInstance {
    fn drop(&mut self) {
        debug!(
            child = %self.policy.name,
            ram = self.ram.granted(),
            caps = self.caps.granted(),
            "instance destroyed"
        );
    }
}

impl std::fmt::Debug for ChildInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildInstance")
            .field("policy", &self.policy)
            .field("pid", &self.process.id())
            .field("cpu", &self.cpu)
            .finish_non_exhaustive()
    }
}

fn launch(
    desc: &TaskDescriptor,
    ctx: &LoaderContext,
    policy: &Arc<ChildPolicy>,
    image: &Arc<BinaryImage>,
    ram: &Arc<QuotaAccount>,
    caps: &Arc<QuotaAccount>,
    cpu: CpuBinding,
) -> Result<Box<dyn ChildProcess>, LoaderError> {
    let (tx, rx) = unbounded();
    policy.router.connect(tx);
    ctx.host.spawn(SpawnRequest {
        task_id: desc.id(),
        name: policy.name.clone(),
        image: Arc::clone(image),
        ram: Arc::clone(ram),
        caps: Arc::clone(caps),
        cpu,
        policy: Arc::clone(policy),
        late_sessions: rx,
    })
}
