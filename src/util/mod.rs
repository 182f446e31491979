//! Shared utilities: clocks, serde helpers, tracing bootstrap.

pub mod clock;
pub mod serde;
pub mod telemetry;

pub use clock::{now_ms, Clock, ManualClock, MonotonicClock};
pub use self::serde::{ByteSize, TaskId};
pub use telemetry::{init_tracing, init_tracing_with};
