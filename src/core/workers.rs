//! Deferred work queues serviced by dedicated OS threads.
//!
//! Two queues exist per registry: destruction (tearing down exited
//! instances) and start (running tasks on behalf of a foreign thread).
//! Producers never block: the channels are unbounded and submission only
//! bumps a pending counter. Idle waiting uses a Condvar, no polling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::core::LoaderError;

/// How long shutdown waits for a worker to join before detaching it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

enum Message<T> {
    Job(T),
    Stop,
}

/// Outstanding-work counter with an idle signal.
#[derive(Debug, Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn increment(&self) {
        *self.count.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn get(&self) -> usize {
        *self.count.lock()
    }

    fn wait_zero(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Cloneable producer side of a [`DeferredQueue`].
pub struct Submitter<T> {
    name: &'static str,
    tx: Sender<Message<T>>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
}

impl<T> Clone for Submitter<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            pending: Arc::clone(&self.pending),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<T> Submitter<T> {
    /// Enqueue `item` without blocking.
    ///
    /// # Errors
    ///
    /// [`LoaderError::Shutdown`] once the queue has been shut down.
    pub fn submit(&self, item: T) -> Result<(), LoaderError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LoaderError::Shutdown);
        }
        self.pending.increment();
        if self.tx.send(Message::Job(item)).is_err() {
            self.pending.decrement();
            return Err(LoaderError::Shutdown);
        }
        Ok(())
    }

    /// Jobs submitted but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.get()
    }
}

impl<T> std::fmt::Debug for Submitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submitter")
            .field("queue", &self.name)
            .field("pending", &self.pending.get())
            .finish()
    }
}

/// Single-threaded deferred work queue.
pub struct DeferredQueue<T: Send + 'static> {
    submitter: Submitter<T>,
    completed: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> DeferredQueue<T> {
    /// Start a worker thread named `name` that runs `job` for every item.
    ///
    /// # Errors
    ///
    /// [`LoaderError::Internal`] when the OS refuses the thread.
    pub fn spawn<F>(name: &'static str, stack_size: usize, job: F) -> Result<Self, LoaderError>
    where
        F: Fn(T) + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let pending = Arc::new(Pending::default());
        let completed = Arc::new(AtomicU64::new(0));
        let worker = spawn_worker(
            name,
            stack_size,
            rx,
            Arc::clone(&pending),
            Arc::clone(&completed),
            job,
        )?;
        debug!(queue = name, "deferred worker started");
        Ok(Self {
            submitter: Submitter {
                name,
                tx,
                pending,
                closed: Arc::new(AtomicBool::new(false)),
            },
            completed,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Producer handle that can be shared with other components.
    pub fn submitter(&self) -> Submitter<T> {
        self.submitter.clone()
    }

    /// Enqueue `item`.
    ///
    /// # Errors
    ///
    /// [`LoaderError::Shutdown`] once the queue has been shut down.
    pub fn submit(&self, item: T) -> Result<(), LoaderError> {
        self.submitter.submit(item)
    }

    /// Jobs submitted but not yet finished.
    pub fn pending(&self) -> usize {
        self.submitter.pending()
    }

    /// Jobs finished since start.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Block until the queue drains or `timeout` passes.
    /// Returns whether the queue is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.submitter.pending.wait_zero(timeout)
    }

    /// Stop accepting work, let queued jobs finish and join the worker.
    ///
    /// A worker that does not exit within two seconds is detached.
    pub fn shutdown(&self) {
        if self.submitter.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.submitter.tx.send(Message::Stop);
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let name = self.submitter.name;
        let (tx, rx) = crossbeam_channel::bounded(1);
        let joiner = thread::spawn(move || {
            let _ = tx.send(worker.join().is_ok());
        });
        match rx.recv_timeout(JOIN_TIMEOUT) {
            Ok(true) => debug!(queue = name, "deferred worker joined"),
            Ok(false) => warn!(queue = name, "deferred worker panicked"),
            Err(_) => {
                warn!(queue = name, "deferred worker did not exit within timeout - detaching");
                return;
            }
        }
        let _ = joiner.join();
        info!(queue = name, completed = self.completed(), "deferred worker shut down");
    }
}

impl<T: Send + 'static> Drop for DeferredQueue<T> {
    fn drop(&mut self) {
        // Signal only; explicit shutdown() joins.
        if !self.submitter.closed.swap(true, Ordering::AcqRel) {
            let _ = self.submitter.tx.send(Message::Stop);
            debug!(queue = self.submitter.name, "deferred queue dropped without shutdown");
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for DeferredQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredQueue")
            .field("queue", &self.submitter.name)
            .field("pending", &self.pending())
            .field("completed", &self.completed())
            .finish()
    }
}

fn spawn_worker<T, F>(
    name: &'static str,
    stack_size: usize,
    rx: Receiver<Message<T>>,
    pending: Arc<Pending>,
    completed: Arc<AtomicU64>,
    job: F,
) -> Result<JoinHandle<()>, LoaderError>
where
    T: Send + 'static,
    F: Fn(T) + Send + 'static,
{
    thread::Builder::new()
        .name(format!("tl-{name}"))
        .stack_size(stack_size)
        .spawn(move || {
            // Blocking recv; Stop or a closed channel ends the loop.
            while let Ok(Message::Job(item)) = rx.recv() {
                job(item);
                completed.fetch_add(1, Ordering::Relaxed);
                pending.decrement();
            }
            debug!(queue = name, "deferred worker exiting");
        })
        .map_err(|e| LoaderError::Internal(format!("failed to spawn {name} worker: {e}")))
}
