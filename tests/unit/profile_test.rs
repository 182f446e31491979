//! Tests for profile snapshots and the event log export

use std::sync::Arc;

use prometheus_taskloader::core::{
    build_snapshot, Event, EventLog, EventType, InMemoryProfileSink, ProfileExport, ProfileSink,
};
use prometheus_taskloader::util::ManualClock;

#[test]
fn test_in_memory_sink_evicts_oldest() {
    let sink = InMemoryProfileSink::new(3);
    for i in 0..5 {
        sink.push(build_snapshot(format!("{i:02}.app"), Vec::new()));
    }
    let names: Vec<_> = sink.snapshots().into_iter().map(|s| s.task).collect();
    assert_eq!(names, ["02.app", "03.app", "04.app"]);
}

#[test]
fn test_zero_history_keeps_nothing() {
    let sink = InMemoryProfileSink::new(0);
    sink.push(build_snapshot("01.app", Vec::new()));
    assert!(sink.snapshots().is_empty());
}

#[test]
fn test_event_log_export_format() {
    let clock = ManualClock::new();
    let log = EventLog::new(Arc::new(clock.clone()));
    log.record(EventType::Start, 1);
    clock.advance(42);
    log.record(EventType::ExitCritical, 1);
    assert_eq!(
        log.drain().to_json().unwrap(),
        r#"{"events":[{"type":"START","task-id":1,"time-stamp":0},{"type":"EXIT_CRITICAL","task-id":1,"time-stamp":42}]}"#
    );
    assert_eq!(log.drain().to_json().unwrap(), r#"{"events":[]}"#);
}

#[test]
fn test_profile_export_parses() {
    let export = ProfileExport::from_json(
        r#"{"events":[{"type":"OUT_OF_QUOTA","task-id":7,"time-stamp":300}]}"#,
    )
    .unwrap();
    assert_eq!(
        export.events,
        [Event {
            kind: EventType::OutOfQuota,
            task_id: 7,
            time_stamp: 300
        }]
    );
}
