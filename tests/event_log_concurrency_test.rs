//! Concurrency tests for exit delivery and the event log.
//!
//! Exit notifications race from many threads against critical-time kills
//! fired by the scheduling clock. Each instance must report exactly one
//! exit, after its start, and stamps must never go backwards.

use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rand::Rng;

use prometheus_taskloader::config::LoaderConfig;
use prometheus_taskloader::core::{EventType, TaskSpec};
use prometheus_taskloader::infra::{ChildScript, SimulatedHost};
use prometheus_taskloader::runtime::Scheduler;
use prometheus_taskloader::util::{ByteSize, ManualClock};

const TASKS: u32 = 50;
const EXIT_CODES: [i32; 8] = [0, 1, 17, 19, 20, 21, 22, -3];
const MARKERS: u32 = 500;
const WRITER_STRIDE: u32 = 10_000;

fn is_exit(kind: EventType) -> bool {
    matches!(
        kind,
        EventType::Exit
            | EventType::ExitCritical
            | EventType::ExitError
            | EventType::ExitExternal
            | EventType::ExitPeriod
            | EventType::OutOfCaps
            | EventType::OutOfQuota
    )
}

#[test]
fn test_concurrent_exits_are_reported_once() {
    let host = SimulatedHost::new();
    host.script("loop", ChildScript::hangs());
    let scheduler = Arc::new(
        Scheduler::builder()
            .config(
                LoaderConfig::new()
                    .with_ram_budget(u64::from(TASKS) << 20)
                    .with_cap_budget(u64::from(TASKS) * 10),
            )
            .host(Arc::new(host.clone()))
            .manual_clock(ManualClock::new())
            .build()
            .unwrap(),
    );
    scheduler.register_binary("loop", vec![0u8; 8]).unwrap();

    let mut rng = rand::rng();
    let specs: Vec<TaskSpec> = (1..=TASKS)
        .map(|id| TaskSpec {
            id,
            period: 1000,
            number_of_jobs: 1,
            critical_time: if rng.random_bool(0.5) {
                rng.random_range(1..=20)
            } else {
                0
            },
            ram_quota: ByteSize(1 << 20),
            cap_quota: 10,
            binary_name: "loop".into(),
            ..TaskSpec::default()
        })
        .collect();
    scheduler.add_tasks(specs).unwrap();
    scheduler.start().unwrap();
    scheduler.registry().advance_to(0).unwrap();
    host.settle();
    assert_eq!(host.live_children(), TASKS as usize);

    let barrier = Arc::new(Barrier::new(TASKS as usize + 1));
    let handles: Vec<_> = (1..=TASKS)
        .map(|id| {
            let host = host.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut rng = rand::rng();
                let name = format!("{id:02}.loop");
                barrier.wait();
                for _ in 0..2 {
                    let code = EXIT_CODES[rng.random_range(0..EXIT_CODES.len())];
                    host.exit_child(&name, code);
                    thread::sleep(Duration::from_micros(rng.random_range(0..200)));
                }
            })
        })
        .collect();

    barrier.wait();
    for t in 1..=30 {
        scheduler.registry().advance_to(t).unwrap();
    }
    for handle in handles {
        handle.join().unwrap();
    }
    host.settle();
    assert!(scheduler.registry().wait_idle(Duration::from_secs(5)));

    let events = scheduler.registry().events();
    assert!(
        events.windows(2).all(|w| w[0].time_stamp <= w[1].time_stamp),
        "time stamps must be non-decreasing in insertion order"
    );

    let mut per_task: HashMap<u32, Vec<EventType>> = HashMap::new();
    for event in &events {
        per_task.entry(event.task_id).or_default().push(event.kind);
    }
    assert_eq!(per_task.len(), TASKS as usize);
    for (id, kinds) in &per_task {
        let exits = kinds.iter().filter(|k| is_exit(**k)).count();
        assert_eq!(exits, 1, "task {id} reported {exits} exits: {kinds:?}");
        assert_eq!(kinds[0], EventType::Start, "task {id}: {kinds:?}");
        assert_eq!(kinds.last(), Some(&EventType::JobsDone), "task {id}: {kinds:?}");
    }

    scheduler.clear_tasks().unwrap();
    host.settle();
    assert_eq!(host.live_children(), 0);
    assert_eq!(scheduler.registry().ram_available(), u64::from(TASKS) << 20);
}

#[test]
fn test_concurrent_external_markers_keep_order() {
    let scheduler = Arc::new(
        Scheduler::builder()
            .host(Arc::new(SimulatedHost::new()))
            .manual_clock(ManualClock::new())
            .build()
            .unwrap(),
    );

    let writers: Vec<_> = (0..8u32)
        .map(|writer| {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || {
                for seq in 0..MARKERS {
                    scheduler.registry().record_external(writer * WRITER_STRIDE + seq);
                }
            })
        })
        .collect();
    for t in 0..100 {
        scheduler.registry().advance_to(t).unwrap();
    }
    for writer in writers {
        writer.join().unwrap();
    }

    let export = scheduler.profile_export().unwrap();
    assert_eq!(export.events.len(), (8 * MARKERS) as usize);
    assert!(export
        .events
        .windows(2)
        .all(|w| w[0].time_stamp <= w[1].time_stamp));
    assert!(export.events.iter().all(|e| e.kind == EventType::External));

    let mut per_writer: HashMap<u32, Vec<u32>> = HashMap::new();
    for event in &export.events {
        per_writer
            .entry(event.task_id / WRITER_STRIDE)
            .or_default()
            .push(event.task_id % WRITER_STRIDE);
    }
    assert_eq!(per_writer.len(), 8);
    for (writer, seqs) in &per_writer {
        assert_eq!(
            *seqs,
            (0..MARKERS).collect::<Vec<_>>(),
            "writer {writer} markers lost, duplicated or reordered"
        );
    }
    assert!(scheduler.registry().events().is_empty());
}
