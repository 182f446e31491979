//! In-process implementations of the loader's collaborators.

pub mod host;

pub use host::{ChildScript, SessionRecord, SimulatedHost};
