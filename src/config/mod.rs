//! Configuration models for the loader and its workers.

pub mod loader;

pub use loader::{DriverConfig, LoaderConfig, ENV_PREFIX};
