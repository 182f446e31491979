//! Profiling event log shared by all tasks.
//!
//! Producers run on arbitrary threads (the scheduling thread, child exit
//! threads, the transport thread), so every append takes the single log
//! lock. Draining is single-consumer.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::util::clock::Clock;
use crate::util::serde::TaskId;

/// Kind of a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A new instance was started.
    Start,
    /// Instance exited normally (code 0).
    Exit,
    /// Instance was killed at its critical time (code 17).
    ExitCritical,
    /// Instance exited with an unclassified code.
    ExitError,
    /// Instance was stopped from outside (code 19).
    ExitExternal,
    /// Instance overran into its next period (code 20).
    ExitPeriod,
    /// Marker injected by an operator.
    External,
    /// Task was not admitted or not allowed this tick.
    NotScheduled,
    /// Task reached its job target.
    JobsDone,
    /// Instance ran out of RAM quota (code 22).
    OutOfQuota,
    /// Instance ran out of capabilities (code 21).
    OutOfCaps,
}

impl EventType {
    /// Stable export name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Exit => "EXIT",
            Self::ExitCritical => "EXIT_CRITICAL",
            Self::ExitError => "EXIT_ERROR",
            Self::ExitExternal => "EXIT_EXTERNAL",
            Self::ExitPeriod => "EXIT_PERIOD",
            Self::External => "EXTERNAL",
            Self::NotScheduled => "NOT_SCHEDULED",
            Self::JobsDone => "JOBS_DONE",
            Self::OutOfQuota => "OUT_OF_QUOTA",
            Self::OutOfCaps => "OUT_OF_CAPS",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Single profiling record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: EventType,
    /// Task that produced the event; 0 is the loader itself.
    #[serde(rename = "task-id")]
    pub task_id: TaskId,
    /// Milliseconds since the registry was created.
    #[serde(rename = "time-stamp")]
    pub time_stamp: u64,
}

/// Serialized form of a drained log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileExport {
    /// Events in insertion order.
    pub events: Vec<Event>,
}

impl ProfileExport {
    /// Render as JSON.
    ///
    /// # Errors
    ///
    /// Propagates serializer failures.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a previously exported profile.
    ///
    /// # Errors
    ///
    /// Returns the parse error if `input` is not a profile document.
    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }
}

/// Append-only, lock-guarded event log.
pub struct EventLog {
    clock: Arc<dyn Clock>,
    origin: u64,
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    /// Create a log whose time stamps start at the clock's current reading.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let origin = clock.now_ms();
        Self {
            clock,
            origin,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Append an event stamped with the current time.
    ///
    /// The stamp is taken under the lock so stamps are non-decreasing in
    /// insertion order.
    pub fn record(&self, kind: EventType, task_id: TaskId) {
        let mut events = self.events.lock();
        let time_stamp = self.clock.now_ms().saturating_sub(self.origin);
        events.push(Event {
            kind,
            task_id,
            time_stamp,
        });
        tracing::trace!(event = %kind, task_id, time_stamp, "event recorded");
    }

    /// Copy of the current contents without clearing.
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Take all events, leaving the log empty.
    pub fn drain(&self) -> ProfileExport {
        let events = std::mem::take(&mut *self.events.lock());
        ProfileExport { events }
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("origin", &self.origin)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::ManualClock;

    #[test]
    fn stamps_are_relative_to_creation() {
        let clock = ManualClock::new();
        clock.set(1_000);
        let log = EventLog::new(Arc::new(clock.clone()));
        clock.advance(25);
        log.record(EventType::Start, 7);
        assert_eq!(log.snapshot()[0].time_stamp, 25);
    }

    #[test]
    fn drain_clears_and_preserves_order() {
        let log = EventLog::new(Arc::new(ManualClock::new()));
        log.record(EventType::Start, 1);
        log.record(EventType::Exit, 1);
        log.record(EventType::JobsDone, 1);
        let export = log.drain();
        let kinds: Vec<_> = export.events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, [EventType::Start, EventType::Exit, EventType::JobsDone]);
        assert!(log.is_empty());
    }

    #[test]
    fn export_uses_wire_names() {
        let log = EventLog::new(Arc::new(ManualClock::new()));
        log.record(EventType::NotScheduled, 3);
        let json = log.drain().to_json().unwrap();
        assert_eq!(
            json,
            r#"{"events":[{"type":"NOT_SCHEDULED","task-id":3,"time-stamp":0}]}"#
        );
        let back = ProfileExport::from_json(&json).unwrap();
        assert_eq!(back.events[0].kind, EventType::NotScheduled);
    }

    #[test]
    fn type_names_match_serde() {
        for kind in [EventType::ExitPeriod, EventType::OutOfCaps, EventType::JobsDone] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.name()));
        }
    }
}
