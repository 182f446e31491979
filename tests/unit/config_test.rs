//! Tests for configuration validation

use prometheus_taskloader::config::{DriverConfig, LoaderConfig};
use prometheus_taskloader::core::LoaderError;

#[test]
fn test_loader_config_defaults() {
    let cfg = LoaderConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.ram_budget.bytes(), 64 << 20);
    assert_eq!(cfg.driver, DriverConfig::Thread);
}

#[test]
fn test_loader_config_invalid_stack() {
    let cfg = LoaderConfig {
        worker_stack_size: 1024,
        ..LoaderConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_loader_config_invalid_cores() {
    let cfg = LoaderConfig::new().with_affinity_cores(0);
    assert!(cfg.validate().unwrap_err().contains("affinity_cores"));
}

#[test]
fn test_loader_config_from_json() {
    let cfg = LoaderConfig::from_json_str(
        r#"{"ram_budget": 4194304, "min_ram_quota": "256K", "drain_timeout_ms": 50}"#,
    )
    .unwrap();
    assert_eq!(cfg.ram_budget.bytes(), 4 << 20);
    assert_eq!(cfg.min_ram_quota.bytes(), 256 << 10);
    assert_eq!(cfg.drain_timeout_ms, 50);
}

#[test]
fn test_loader_config_rejects_bad_json() {
    let err = LoaderConfig::from_json_str("{").unwrap_err();
    assert!(matches!(err, LoaderError::InvalidConfig(_)));
}

#[test]
fn test_loader_config_unknown_driver() {
    let err = LoaderConfig::from_vars(|key| (key == "DRIVER").then(|| "fiber".into())).unwrap_err();
    assert!(err.to_string().contains("fiber"));
}

#[test]
fn test_loader_config_round_trips_through_serde() {
    let cfg = LoaderConfig::new()
        .with_ram_budget(8 << 20)
        .with_driver(DriverConfig::Manual);
    let json = serde_json::to_string(&cfg).unwrap();
    assert_eq!(LoaderConfig::from_json_str(&json).unwrap(), cfg);
}
