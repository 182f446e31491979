//! Tests for utility functions

use std::sync::Arc;

use prometheus_taskloader::util::{now_ms, ByteSize, Clock, ManualClock, MonotonicClock};

#[test]
fn test_byte_size_parsing() {
    assert_eq!("512".parse::<ByteSize>().unwrap().bytes(), 512);
    assert_eq!("4K".parse::<ByteSize>().unwrap().bytes(), 4096);
    assert_eq!("2M".parse::<ByteSize>().unwrap().bytes(), 2 << 20);
    assert_eq!("1G".parse::<ByteSize>().unwrap().bytes(), 1 << 30);
    assert!("lots".parse::<ByteSize>().is_err());
}

#[test]
fn test_manual_clock_is_shared_and_monotonic() {
    let clock = ManualClock::new();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    clock.set(100);
    assert_eq!(shared.now_ms(), 100);
    clock.set(50);
    assert_eq!(shared.now_ms(), 100);
    clock.advance(5);
    assert_eq!(shared.now_ms(), 105);
}

#[test]
fn test_monotonic_clock_moves_forward() {
    let clock = MonotonicClock::new();
    let a = clock.now_ms();
    std::thread::sleep(std::time::Duration::from_millis(5));
    assert!(clock.now_ms() >= a);
}

#[test]
fn test_now_ms() {
    let a = now_ms();
    let b = now_ms();
    assert!(b >= a);
}

#[test]
fn test_init_tracing_is_idempotent() {
    prometheus_taskloader::util::init_tracing();
    prometheus_taskloader::util::init_tracing_with("debug");
    tracing::info!("tracing initialized twice without panicking");
}
