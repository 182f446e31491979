//! Unit tests for individual components

mod binary_cache_test;
mod builders_test;
mod config_test;
mod error_test;
mod profile_test;
mod runtime_test;
mod util_test;
