//! # Prometheus Taskloader
//!
//! A partition-style periodic task loader. Tasks are described once
//! (period, offset, priority or deadline, critical time, job count, RAM and
//! capability quota, core affinity, binary) and the loader starts one child
//! instance per period, kills instances that overrun their period or their
//! critical time, and reclaims their quota on a dedicated destruction
//! thread. Every lifecycle transition is appended to a profiling event log
//! that transports drain as JSON.
//!
//! ## Key Features
//!
//! - **Periodic release**: first start at `offset`, then every `period`,
//!   until `number_of_jobs` instances have been started
//! - **Overrun and critical-time enforcement**: a still-running instance is
//!   killed on the next tick or when its critical time elapses
//! - **Quota accounting**: RAM and capability grants carved from a parent
//!   budget with a lock-free CAS reservation, returned when an instance is
//!   destroyed
//! - **Admission control**: one-shot schedulability test per task, plus a
//!   per-tick gate for deadline-band tasks
//! - **Deferred destruction**: exit notifications never block; teardown
//!   happens on its own worker thread
//! - **Deterministic testing**: a manual clock drives every timer on the
//!   caller's thread
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_taskloader::core::TaskSpec;
//! use prometheus_taskloader::infra::SimulatedHost;
//! use prometheus_taskloader::runtime::Scheduler;
//! use prometheus_taskloader::util::ManualClock;
//!
//! let clock = ManualClock::new();
//! let scheduler = Scheduler::builder()
//!     .host(Arc::new(SimulatedHost::new()))
//!     .manual_clock(clock)
//!     .build()?;
//!
//! scheduler.register_binary("sensor", vec![0u8; 64])?;
//! scheduler.add_tasks(vec![TaskSpec {
//!     id: 1,
//!     period: 100,
//!     number_of_jobs: 3,
//!     ram_quota: "1M".parse()?,
//!     binary_name: "sensor".into(),
//!     ..TaskSpec::default()
//! }])?;
//! scheduler.start()?;
//! scheduler.registry().advance_to(350)?;
//! println!("{}", scheduler.profile_data()?);
//! ```
//!
//! For complete scenarios, see `tests/scheduler_scenarios_test.rs`.

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling model, state machine and quota accounting.
pub mod core;
/// Configuration models for the loader.
pub mod config;
/// Builders to construct a scheduler from configuration.
pub mod builders;
/// In-process collaborator implementations.
pub mod infra;
/// Scheduler facade and API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
