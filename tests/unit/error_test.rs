//! Tests for error handling

use prometheus_taskloader::core::{ExitReason, LoaderError, ResourceKind};

#[test]
fn test_loader_error_display() {
    let err = LoaderError::ResourceExhausted {
        kind: ResourceKind::Caps,
        requested: 10,
        available: 4,
    };
    assert_eq!(err.to_string(), "caps exhausted: requested 10, available 4");

    let err = LoaderError::BinaryUnavailable("sensor".into());
    assert_eq!(err.to_string(), "binary `sensor` not available");

    let err = LoaderError::ReclaimTimeout(2);
    assert!(err.to_string().contains("2 child instance(s)"));
}

#[test]
fn test_retryable_classification() {
    assert!(LoaderError::SpawnFailed("busy".into()).is_retryable());
    assert!(LoaderError::BinaryUnavailable("x".into()).is_retryable());
    assert!(!LoaderError::InvalidDescriptor("x".into()).is_retryable());
    assert!(!LoaderError::Shutdown.is_retryable());
}

#[test]
fn test_serialization_error_converts() {
    let parse = serde_json::from_str::<u32>("nope").unwrap_err();
    let err: LoaderError = parse.into();
    assert!(matches!(err, LoaderError::Serialization(_)));
}

#[test]
fn test_exit_code_classification() {
    let soft = [0, 21, 22];
    for code in soft {
        let reason = ExitReason::from_code(code);
        assert!(reason.is_soft(), "code {code} should keep the instance");
        assert_eq!(reason.code(), code);
    }
    for code in [1, 17, 19, 20, -1] {
        assert!(!ExitReason::from_code(code).is_soft(), "code {code}");
    }
    assert_eq!(ExitReason::from_code(5), ExitReason::Error(5));
}
