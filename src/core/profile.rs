//! Telemetry sinks receiving profile snapshots.
//!
//! A snapshot is pushed whenever a task reaches its job target, both from
//! the exit path and from the final start tick. Sinks must be cheap: the
//! exit path calls them from a child's notification thread.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::event::Event;
use crate::util::clock::now_ms;

/// Copy of the event log taken for one task at one moment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    /// Snapshot identifier.
    pub snapshot_id: Uuid,
    /// Name of the task that triggered the push.
    pub task: String,
    /// Wall-clock creation time (ms since epoch).
    pub created_at_ms: u128,
    /// Log contents at the time of the push.
    pub events: Vec<Event>,
}

/// Telemetry collaborator.
pub trait ProfileSink: Send + Sync {
    /// Accept a snapshot.
    fn push(&self, snapshot: ProfileSnapshot);
}

/// In-memory sink with a bounded history, for testing and dev.
#[derive(Debug)]
pub struct InMemoryProfileSink {
    snapshots: Mutex<VecDeque<ProfileSnapshot>>,
    max_snapshots: usize,
}

impl InMemoryProfileSink {
    /// Create a new in-memory sink keeping at most `max_snapshots`.
    #[must_use]
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            snapshots: Mutex::new(VecDeque::with_capacity(max_snapshots.min(1024))),
            max_snapshots,
        }
    }

    /// Retrieve the stored snapshots, oldest first.
    pub fn snapshots(&self) -> Vec<ProfileSnapshot> {
        self.snapshots.lock().iter().cloned().collect()
    }
}

impl ProfileSink for InMemoryProfileSink {
    fn push(&self, snapshot: ProfileSnapshot) {
        let mut snapshots = self.snapshots.lock();
        if self.max_snapshots == 0 {
            return;
        }
        if snapshots.len() >= self.max_snapshots {
            snapshots.pop_front();
        }
        snapshots.push_back(snapshot);
    }
}

/// Sink that only emits a tracing record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProfileSink;

impl ProfileSink for TracingProfileSink {
    fn push(&self, snapshot: ProfileSnapshot) {
        tracing::info!(
            task = %snapshot.task,
            events = snapshot.events.len(),
            id = %snapshot.snapshot_id,
            "profile snapshot"
        );
    }
}

/// Helper to build a snapshot.
pub fn build_snapshot(task: impl Into<String>, events: Vec<Event>) -> ProfileSnapshot {
    ProfileSnapshot {
        snapshot_id: Uuid::new_v4(),
        task: task.into(),
        created_at_ms: now_ms(),
        events,
    }
}
