//! Tests for the scheduler facade and API models

use std::sync::Arc;

use prometheus_taskloader::core::EventType;
use prometheus_taskloader::infra::SimulatedHost;
use prometheus_taskloader::runtime::{health, Scheduler, TaskBatch};
use prometheus_taskloader::util::ManualClock;

fn scheduler(host: &SimulatedHost) -> Scheduler {
    Scheduler::builder()
        .host(Arc::new(host.clone()))
        .manual_clock(ManualClock::new())
        .build()
        .unwrap()
}

#[test]
fn test_add_tasks_json() {
    let s = scheduler(&SimulatedHost::new());
    let report = s
        .add_tasks_json(
            r#"[{"id": 1, "binary_name": "a", "period": 10},
                {"id": 2, "binary_name": "", "period": 10},
                {"id": 3, "binary_name": "c", "priority": 300, "deadline": 5}]"#,
        )
        .unwrap();
    assert_eq!(report.accepted, [1, 3]);
    assert_eq!(report.invalid.len(), 1);
    assert!(s.registry().task(3).unwrap().descriptor().is_deadline_scheduled());
}

#[test]
fn test_add_tasks_json_rejects_garbage() {
    let s = scheduler(&SimulatedHost::new());
    let err = s.add_tasks_json("not json").unwrap_err();
    assert!(err.to_string().contains("parsing task description"));
    assert!(s.registry().tasks().is_empty());
}

#[test]
fn test_task_batch_wire_forms() {
    let batch = TaskBatch::from_json(r#"{"tasks": []}"#).unwrap();
    assert!(batch.tasks.is_empty());
    let batch = TaskBatch::from_json(r#"[{"id": 5, "ram_quota": "2M"}]"#).unwrap();
    assert_eq!(batch.tasks[0].ram_quota.bytes(), 2 << 20);
}

#[test]
fn test_health_reflects_registry() {
    let host = SimulatedHost::new();
    let s = scheduler(&host);
    s.add_tasks_json(r#"[{"id": 1, "binary_name": "a"}]"#).unwrap();
    s.registry().record_external(0);
    let h = health(&s);
    assert!(h.ok);
    assert_eq!(h.tasks, 1);
    assert_eq!(h.running, 0);
    assert_eq!(h.events, 1);
}

#[test]
fn test_zero_jobs_never_starts() {
    let host = SimulatedHost::new();
    let s = scheduler(&host);
    s.register_binary("a", vec![0u8]).unwrap();
    s.add_tasks_json(r#"[{"id": 1, "binary_name": "a", "period": 10, "number_of_jobs": 0}]"#)
        .unwrap();
    s.start().unwrap();
    s.registry().advance_to(50).unwrap();
    host.settle();
    assert_eq!(host.spawned(), 0);
    assert!(!s.registry().events().iter().any(|e| e.kind == EventType::Start));
    assert_eq!(s.registry().armed_timers(), 0);
}

#[test]
fn test_shutdown_is_idempotent() {
    let s = scheduler(&SimulatedHost::new());
    s.shutdown();
    s.shutdown();
    assert!(s.add_tasks(Vec::new()).is_err());
}
