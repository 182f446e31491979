//! In-process [`ProcessHost`] that simulates children with threads.
//!
//! Each binary can be given a [`ChildScript`]: how long the child runs,
//! which exit code each iteration reports, how much RAM it charges and
//! which sessions it requests. Children start executing on `activate()`
//! and report their exit from their own thread, as a real host would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::core::child::ChildPolicy;
use crate::core::host::{ChildProcess, ExitReason, ProcessHost, ProcessId, SpawnRequest};
use crate::core::quota::QuotaAccount;
use crate::core::service::{Resolution, ResolvedSession, SessionRequest};
use crate::core::LoaderError;

/// Behaviour of a simulated child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildScript {
    /// Exit code per iteration; the last one repeats. Empty means 0.
    pub exit_codes: Vec<i32>,
    /// Run time before exiting; `None` runs until killed.
    pub run_for: Option<Duration>,
    /// RAM charged against the child's account on start.
    pub ram_usage: u64,
    /// Sessions requested on start.
    pub sessions: Vec<SessionRequest>,
}

impl Default for ChildScript {
    fn default() -> Self {
        Self::exits(0)
    }
}

impl ChildScript {
    /// Exit immediately with `code` every iteration.
    #[must_use]
    pub fn exits(code: i32) -> Self {
        Self {
            exit_codes: vec![code],
            run_for: Some(Duration::ZERO),
            ram_usage: 0,
            sessions: Vec::new(),
        }
    }

    /// Run until killed.
    #[must_use]
    pub const fn hangs() -> Self {
        Self {
            exit_codes: Vec::new(),
            run_for: None,
            ram_usage: 0,
            sessions: Vec::new(),
        }
    }

    /// Report `codes` on successive iterations.
    #[must_use]
    pub fn with_exit_codes(mut self, codes: impl Into<Vec<i32>>) -> Self {
        self.exit_codes = codes.into();
        self
    }

    /// Run for `duration` before exiting.
    #[must_use]
    pub const fn with_run_for(mut self, duration: Duration) -> Self {
        self.run_for = Some(duration);
        self
    }

    /// Charge `bytes` of RAM on start.
    #[must_use]
    pub const fn with_ram_usage(mut self, bytes: u64) -> Self {
        self.ram_usage = bytes;
        self
    }

    /// Request a session on start.
    #[must_use]
    pub fn with_session(mut self, service: &str, args: &str) -> Self {
        self.sessions.push(SessionRequest {
            service: service.to_owned(),
            args: args.to_owned(),
        });
        self
    }

    fn exit_code(&self, launch: usize) -> i32 {
        self.exit_codes
            .get(launch)
            .or_else(|| self.exit_codes.last())
            .copied()
            .unwrap_or(0)
    }
}

/// Session request as seen by the simulated host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Requesting child.
    pub child: String,
    /// Request.
    pub request: SessionRequest,
    /// Whether it resolved immediately.
    pub resolved: bool,
}

struct LiveChild {
    name: String,
    policy: Arc<ChildPolicy>,
    late: Receiver<ResolvedSession>,
}

#[derive(Default)]
struct Inner {
    scripts: Mutex<HashMap<String, ChildScript>>,
    launches: Mutex<HashMap<String, usize>>,
    live: Mutex<HashMap<ProcessId, LiveChild>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    busy: Mutex<usize>,
    quiet: Condvar,
    sessions: Mutex<Vec<SessionRecord>>,
    next_pid: AtomicU64,
    spawned: AtomicU64,
    failing_spawns: AtomicU32,
}

/// Thread-backed process host for tests and bring-up.
#[derive(Clone, Default)]
pub struct SimulatedHost {
    inner: Arc<Inner>,
}

impl SimulatedHost {
    /// Host whose children exit immediately with code 0 unless scripted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script every child running `binary`.
    pub fn script(&self, binary: &str, script: ChildScript) {
        self.inner.scripts.lock().insert(binary.to_owned(), script);
    }

    /// Make the next `count` spawns fail.
    pub fn fail_next_spawns(&self, count: u32) {
        self.inner.failing_spawns.store(count, Ordering::Release);
    }

    /// Processes created so far.
    pub fn spawned(&self) -> u64 {
        self.inner.spawned.load(Ordering::Acquire)
    }

    /// Processes not yet released by the loader.
    pub fn live_children(&self) -> usize {
        self.inner.live.lock().len()
    }

    /// Deliver an exit notification for the live child named `name` from
    /// the calling thread. Returns `false` if no such child is live.
    pub fn exit_child(&self, name: &str, code: i32) -> bool {
        let policy = self
            .inner
            .live
            .lock()
            .values()
            .find(|c| c.name == name)
            .map(|c| Arc::clone(&c.policy));
        policy.is_some_and(|policy| {
            policy.exit(code);
            true
        })
    }

    /// Sessions that resolved late for the live child named `name`.
    pub fn late_sessions(&self, name: &str) -> Vec<ResolvedSession> {
        self.inner
            .live
            .lock()
            .values()
            .filter(|c| c.name == name)
            .flat_map(|c| c.late.try_iter().collect::<Vec<_>>())
            .collect()
    }

    /// Every session request issued so far.
    pub fn session_log(&self) -> Vec<SessionRecord> {
        self.inner.sessions.lock().clone()
    }

    /// Wait until every activated child has either delivered its exit or
    /// is parked waiting to be killed, then join the finished threads.
    pub fn settle(&self) {
        let mut busy = self.inner.busy.lock();
        while *busy > 0 {
            self.inner.quiet.wait(&mut busy);
        }
        drop(busy);
        let finished: Vec<_> = {
            let mut threads = self.inner.threads.lock();
            let (finished, running) = threads.drain(..).partition(JoinHandle::is_finished);
            *threads = running;
            finished
        };
        for handle in finished {
            if handle.join().is_err() {
                error!("simulated child panicked");
            }
        }
    }
}

impl std::fmt::Debug for SimulatedHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedHost")
            .field("spawned", &self.spawned())
            .field("live", &self.live_children())
            .finish_non_exhaustive()
    }
}

impl ProcessHost for SimulatedHost {
    fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn ChildProcess>, LoaderError> {
        let failing = self.inner.failing_spawns.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            n.checked_sub(1)
        });
        if failing.is_ok() {
            return Err(LoaderError::SpawnFailed(format!("{}: scripted failure", request.name)));
        }

        let script = self
            .inner
            .scripts
            .lock()
            .get(request.image.name())
            .cloned()
            .unwrap_or_default();
        let launch = {
            let mut launches = self.inner.launches.lock();
            let n = launches.entry(request.name.clone()).or_insert(0);
            *n += 1;
            *n - 1
        };
        let pid = self.inner.next_pid.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.spawned.fetch_add(1, Ordering::AcqRel);
        self.inner.live.lock().insert(
            pid,
            LiveChild {
                name: request.name.clone(),
                policy: Arc::clone(&request.policy),
                late: request.late_sessions,
            },
        );
        debug!(child = %request.name, pid, launch, cpu = ?request.cpu, "simulated child created");

        Ok(Box::new(SimChild {
            pid,
            name: request.name,
            code: script.exit_code(launch),
            script,
            policy: request.policy,
            ram: request.ram,
            kill: None,
            inner: Arc::clone(&self.inner),
        }))
    }
}

/// Marks a child thread as still doing work for [`SimulatedHost::settle`].
struct Busy(Arc<Inner>);

impl Drop for Busy {
    fn drop(&mut self) {
        let mut busy = self.0.busy.lock();
        *busy = busy.saturating_sub(1);
        if *busy == 0 {
            self.0.quiet.notify_all();
        }
    }
}

struct SimChild {
    pid: ProcessId,
    name: String,
    code: i32,
    script: ChildScript,
    policy: Arc<ChildPolicy>,
    ram: Arc<QuotaAccount>,
    kill: Option<Sender<()>>,
    inner: Arc<Inner>,
}

impl ChildProcess for SimChild {
    fn id(&self) -> ProcessId {
        self.pid
    }

    fn activate(&mut self) {
        let (kill_tx, kill_rx) = bounded::<()>(1);
        self.kill = Some(kill_tx);
        let policy = Arc::clone(&self.policy);
        let ram = (self.script.ram_usage > 0).then(|| Arc::clone(&self.ram));
        let ram_usage = self.script.ram_usage;
        let sessions = self.script.sessions.clone();
        let run_for = self.script.run_for;
        let code = self.code;
        let name = self.name.clone();
        let inner = Arc::clone(&self.inner);
        *self.inner.busy.lock() += 1;
        let mut busy = Some(Busy(Arc::clone(&self.inner)));

        let spawned = thread::Builder::new().name(self.name.clone()).spawn(move || {
            for request in sessions {
                let resolved = matches!(
                    policy.resolve_session(&request.service, &request.args),
                    Resolution::Resolved(_)
                );
                inner.sessions.lock().push(SessionRecord {
                    child: name.clone(),
                    request,
                    resolved,
                });
            }
            if let Some(ram) = ram {
                if ram.charge(ram_usage).is_err() {
                    policy.exit(ExitReason::OutOfQuota.code());
                    return;
                }
            }
            let finished = match run_for {
                Some(duration) => matches!(kill_rx.recv_timeout(duration), Err(RecvTimeoutError::Timeout)),
                None => {
                    drop(busy.take());
                    let _ = kill_rx.recv();
                    false
                }
            };
            if finished {
                policy.exit(code);
            }
            drop(busy);
        });
        match spawned {
            Ok(handle) => self.inner.threads.lock().push(handle),
            Err(e) => {
                error!(child = %self.name, error = %e, "cannot start simulated child");
                self.policy.exit(-1);
            }
        }
    }

    fn kill(&mut self, reason: ExitReason) {
        debug!(child = %self.name, pid = self.pid, code = reason.code(), "simulated child killed");
        if let Some(kill) = self.kill.take() {
            let _ = kill.try_send(());
        }
    }
}

impl Drop for SimChild {
    fn drop(&mut self) {
        self.kill.take();
        self.inner.live.lock().remove(&self.pid);
    }
}
