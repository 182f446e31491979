//! Tests for builders

use std::sync::Arc;

use prometheus_taskloader::builders::SchedulerBuilder;
use prometheus_taskloader::config::{DriverConfig, LoaderConfig};
use prometheus_taskloader::core::{InMemoryProfileSink, LoaderError, TaskSpec};
use prometheus_taskloader::infra::SimulatedHost;
use prometheus_taskloader::util::{ByteSize, ManualClock};

#[test]
fn test_builder_requires_host() {
    let err = SchedulerBuilder::new().build().unwrap_err();
    assert!(matches!(err, LoaderError::InvalidConfig(_)));
}

#[test]
fn test_builder_applies_budgets() {
    let scheduler = SchedulerBuilder::new()
        .config(LoaderConfig::new().with_ram_budget(3 << 20).with_cap_budget(42))
        .host(Arc::new(SimulatedHost::new()))
        .manual_clock(ManualClock::new())
        .build()
        .unwrap();
    assert_eq!(scheduler.registry().ram_available(), 3 << 20);
    assert_eq!(scheduler.registry().caps_available(), 42);
    assert_eq!(scheduler.config().driver, DriverConfig::Manual);
}

#[test]
fn test_custom_sink_receives_snapshots() {
    let sink = Arc::new(InMemoryProfileSink::new(8));
    let host = SimulatedHost::new();
    let scheduler = SchedulerBuilder::new()
        .host(Arc::new(host.clone()))
        .profile_sink(sink.clone())
        .manual_clock(ManualClock::new())
        .build()
        .unwrap();
    scheduler.register_binary("once", vec![0u8]).unwrap();
    scheduler
        .add_tasks(vec![TaskSpec {
            id: 1,
            period: 0,
            number_of_jobs: 1,
            ram_quota: ByteSize(1 << 20),
            binary_name: "once".into(),
            ..TaskSpec::default()
        }])
        .unwrap();
    scheduler.start().unwrap();
    scheduler.registry().advance_to(0).unwrap();
    host.settle();

    assert!(scheduler.snapshots().is_empty());
    assert_eq!(sink.snapshots().len(), 1);
    assert_eq!(sink.snapshots()[0].task, "01.once");
}

#[test]
fn test_advance_requires_manual_driver() {
    let scheduler = SchedulerBuilder::new()
        .host(Arc::new(SimulatedHost::new()))
        .build()
        .unwrap();
    assert!(matches!(
        scheduler.registry().advance_to(10),
        Err(LoaderError::InvalidConfig(_))
    ));
    scheduler.shutdown();
}
