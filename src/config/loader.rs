//! Loader configuration.

use serde::{Deserialize, Serialize};

use crate::core::LoaderError;
use crate::util::serde::ByteSize;

/// Prefix of environment variables read by [`LoaderConfig::from_env`].
pub const ENV_PREFIX: &str = "TASKLOADER_";

/// How the scheduling timers are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverConfig {
    /// Dedicated scheduling thread on the monotonic clock.
    #[default]
    Thread,
    /// Caller-driven virtual clock.
    Manual,
}

/// Root loader configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// RAM budget child quotas are carved from.
    pub ram_budget: ByteSize,
    /// Capability budget child quotas are carved from.
    pub cap_budget: u64,
    /// Cores in the affinity space.
    pub affinity_cores: u32,
    /// Quotas below this are accepted with a warning.
    pub min_ram_quota: ByteSize,
    /// How long `clear_tasks` waits for instances to be destroyed.
    pub drain_timeout_ms: u64,
    /// Stack size of the loader's worker threads.
    pub worker_stack_size: usize,
    /// Snapshots kept by the in-memory profile sink.
    pub profile_history: usize,
    /// Timer driver.
    pub driver: DriverConfig,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            ram_budget: ByteSize(64 << 20),
            cap_budget: 1000,
            affinity_cores: u32::try_from(num_cpus::get()).unwrap_or(1),
            min_ram_quota: ByteSize(512 << 10),
            drain_timeout_ms: 1000,
            worker_stack_size: 256 * 1024,
            profile_history: 64,
            driver: DriverConfig::Thread,
        }
    }
}

impl LoaderConfig {
    /// Create a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the RAM budget in bytes.
    #[must_use]
    pub const fn with_ram_budget(mut self, bytes: u64) -> Self {
        self.ram_budget = ByteSize(bytes);
        self
    }

    /// Set the capability budget.
    #[must_use]
    pub const fn with_cap_budget(mut self, caps: u64) -> Self {
        self.cap_budget = caps;
        self
    }

    /// Set the number of cores in the affinity space.
    #[must_use]
    pub const fn with_affinity_cores(mut self, cores: u32) -> Self {
        self.affinity_cores = cores;
        self
    }

    /// Set the drain timeout.
    #[must_use]
    pub const fn with_drain_timeout_ms(mut self, ms: u64) -> Self {
        self.drain_timeout_ms = ms;
        self
    }

    /// Select the timer driver.
    #[must_use]
    pub const fn with_driver(mut self, driver: DriverConfig) -> Self {
        self.driver = driver;
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.ram_budget.bytes() == 0 {
            return Err("ram_budget must be greater than 0".into());
        }
        if self.cap_budget == 0 {
            return Err("cap_budget must be greater than 0".into());
        }
        if self.affinity_cores == 0 {
            return Err("affinity_cores must be greater than 0".into());
        }
        if self.drain_timeout_ms == 0 {
            return Err("drain_timeout_ms must be greater than 0".into());
        }
        if self.worker_stack_size < 16 * 1024 {
            return Err("worker_stack_size must be at least 16K".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// [`LoaderError::InvalidConfig`] on parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, LoaderError> {
        let cfg: Self = serde_json::from_str(input)
            .map_err(|e| LoaderError::InvalidConfig(format!("parse error: {e}")))?;
        cfg.validate().map_err(LoaderError::InvalidConfig)?;
        Ok(cfg)
    }

    /// Build from `TASKLOADER_*` environment variables, loading `.env`
    /// first when present. Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// [`LoaderError::InvalidConfig`] on unparsable values or failed validation.
    pub fn from_env() -> Result<Self, LoaderError> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Build from an arbitrary key lookup; keys are given without prefix.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_vars<F>(lookup: F) -> Result<Self, LoaderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, LoaderError>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse()
                .map_err(|e| LoaderError::InvalidConfig(format!("{ENV_PREFIX}{key}: {e}")))
        }

        let mut cfg = Self::default();
        if let Some(v) = lookup("RAM_BUDGET") {
            cfg.ram_budget = parse("RAM_BUDGET", &v)?;
        }
        if let Some(v) = lookup("CAP_BUDGET") {
            cfg.cap_budget = parse("CAP_BUDGET", &v)?;
        }
        if let Some(v) = lookup("AFFINITY_CORES") {
            cfg.affinity_cores = parse("AFFINITY_CORES", &v)?;
        }
        if let Some(v) = lookup("MIN_RAM_QUOTA") {
            cfg.min_ram_quota = parse("MIN_RAM_QUOTA", &v)?;
        }
        if let Some(v) = lookup("DRAIN_TIMEOUT_MS") {
            cfg.drain_timeout_ms = parse("DRAIN_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("WORKER_STACK_SIZE") {
            cfg.worker_stack_size = parse::<ByteSize>("WORKER_STACK_SIZE", &v)
                .and_then(|b| {
                    usize::try_from(b.bytes()).map_err(|e| {
                        LoaderError::InvalidConfig(format!("{ENV_PREFIX}WORKER_STACK_SIZE: {e}"))
                    })
                })?;
        }
        if let Some(v) = lookup("PROFILE_HISTORY") {
            cfg.profile_history = parse("PROFILE_HISTORY", &v)?;
        }
        if let Some(v) = lookup("DRIVER") {
            cfg.driver = match v.trim() {
                "thread" => DriverConfig::Thread,
                "manual" => DriverConfig::Manual,
                other => {
                    return Err(LoaderError::InvalidConfig(format!(
                        "{ENV_PREFIX}DRIVER: unknown driver `{other}`"
                    )))
                }
            };
        }
        cfg.validate().map_err(LoaderError::InvalidConfig)?;
        Ok(cfg)
    }
}
