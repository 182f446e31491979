//! Error types for loader operations.
//!
//! None of these are fatal to the registry: the scheduling thread logs them
//! and records the outcome in the event log instead of propagating them.

use thiserror::Error;

use crate::util::serde::TaskId;

/// Resource kinds carved out of the parent budget for a child instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// RAM quota in bytes.
    Ram,
    /// Capability slots.
    Caps,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ram => f.write_str("ram"),
            Self::Caps => f.write_str("caps"),
        }
    }
}

/// Errors produced by loader components.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// Admission control refused the task; permanent for its lifetime.
    #[error("task {0} rejected by admission control")]
    AdmissionRejected(TaskId),
    /// The task's binary has not been registered yet.
    #[error("binary `{0}` not available")]
    BinaryUnavailable(String),
    /// Parent budget cannot cover the requested quota.
    #[error("{kind} exhausted: requested {requested}, available {available}")]
    ResourceExhausted {
        /// Which budget ran dry.
        kind: ResourceKind,
        /// Amount requested.
        requested: u64,
        /// Amount currently available.
        available: u64,
    },
    /// The process creation primitive failed.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
    /// A child terminated with an unclassified exit code.
    #[error("child exited with error code {0}")]
    ChildError(i32),
    /// A task description failed validation.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    /// Loader configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Child instances were still alive when the drain deadline passed.
    #[error("{0} child instance(s) not reclaimed before timeout")]
    ReclaimTimeout(usize),
    /// The registry or one of its workers has been shut down.
    #[error("loader has been shut down")]
    Shutdown,
    /// Profile export could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Unexpected internal failure (worker thread, blocking task).
    #[error("internal error: {0}")]
    Internal(String),
}

impl LoaderError {
    /// Whether the failure is expected to clear on a later period.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BinaryUnavailable(_)
                | Self::ResourceExhausted { .. }
                | Self::SpawnFailed(_)
                | Self::ChildError(_)
        )
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
