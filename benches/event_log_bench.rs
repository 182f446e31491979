//! Benchmarks for the loader's hot paths.
//!
//! Benchmarks cover:
//! - Event log append and JSON export
//! - Quota grant/release against a shared budget
//! - Timer dispatch on a manual clock
//! - End-to-end periodic scheduling with the simulated host

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;

use prometheus_taskloader::config::LoaderConfig;
use prometheus_taskloader::core::{
    EventLog, EventType, ResourceBudget, ResourceKind, TaskSpec, TimerAction, TimerService,
    TimerTarget,
};
use prometheus_taskloader::infra::SimulatedHost;
use prometheus_taskloader::runtime::Scheduler;
use prometheus_taskloader::util::{ByteSize, ManualClock};

struct Sink;

impl TimerTarget for Sink {
    fn on_timer(&self, action: TimerAction) {
        black_box(action);
    }
}

// ============================================================================
// Event Log
// ============================================================================

fn bench_event_log_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_log_record");

    for size in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let log = EventLog::new(Arc::new(ManualClock::new()));
            b.iter(|| {
                for i in 0..size {
                    log.record(EventType::Start, (i % 64) as u32);
                }
                black_box(log.drain());
            });
        });
    }
    group.finish();
}

fn bench_event_log_export(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_log_export");

    for size in [100u64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let log = EventLog::new(Arc::new(ManualClock::new()));
            b.iter(|| {
                for i in 0..size {
                    log.record(EventType::ExitPeriod, (i % 64) as u32);
                }
                black_box(log.drain().to_json().unwrap());
            });
        });
    }
    group.finish();
}

// ============================================================================
// Quota
// ============================================================================

fn bench_quota_grant_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("quota_grant_release");
    let budget = ResourceBudget::new(ResourceKind::Ram, 1 << 30);

    group.bench_function("grant_drop", |b| {
        b.iter(|| {
            let account = budget.grant(black_box(1 << 20)).unwrap();
            black_box(account.granted());
        });
    });
    group.finish();
}

// ============================================================================
// Timers
// ============================================================================

fn bench_timer_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer_dispatch");

    for timers in [10u64, 100, 1_000] {
        group.throughput(Throughput::Elements(timers));
        group.bench_with_input(BenchmarkId::from_parameter(timers), &timers, |b, &timers| {
            let clock = ManualClock::new();
            let service = TimerService::new(Arc::new(clock.clone()));
            let sink: Arc<dyn TimerTarget> = Arc::new(Sink);
            let ids: Vec<_> = (0..timers)
                .map(|i| {
                    let id = service.create(Arc::downgrade(&sink));
                    service.sigh(id, TimerAction::Start);
                    service.trigger_periodic(id, i % 10, 10);
                    id
                })
                .collect();
            let mut now = 0;
            b.iter(|| {
                now += 10;
                clock.set(now);
                black_box(service.dispatch_due(now));
            });
            for id in ids {
                service.release(id);
            }
        });
    }
    group.finish();
}

// ============================================================================
// End-to-End
// ============================================================================

fn bench_periodic_scheduling(c: &mut Criterion) {
    let mut group = c.benchmark_group("periodic_scheduling");
    group.sample_size(20);

    for tasks in [4u32, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &tasks| {
            b.iter(|| {
                let host = SimulatedHost::new();
                let scheduler = Scheduler::builder()
                    .config(LoaderConfig::new().with_ram_budget(u64::from(tasks) << 20))
                    .host(Arc::new(host.clone()))
                    .manual_clock(ManualClock::new())
                    .build()
                    .unwrap();
                scheduler.register_binary("bench", vec![0u8; 64]).unwrap();
                scheduler
                    .add_tasks(
                        (1..=tasks)
                            .map(|id| TaskSpec {
                                id,
                                period: 10,
                                number_of_jobs: 5,
                                ram_quota: ByteSize(1 << 20),
                                binary_name: "bench".into(),
                                ..TaskSpec::default()
                            })
                            .collect(),
                    )
                    .unwrap();
                scheduler.start().unwrap();
                for t in 0..=5 {
                    scheduler.registry().advance_to(t * 10).unwrap();
                    host.settle();
                }
                black_box(scheduler.profile_data().unwrap());
                scheduler.shutdown();
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_event_log_record,
    bench_event_log_export,
    bench_quota_grant_release,
    bench_timer_dispatch,
    bench_periodic_scheduling,
);
criterion_main!(benches);
