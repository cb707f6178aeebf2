//! Runtime configuration for the CPU emulator.
//!
//! ```rust
//! use cudify_runtime::RuntimeConfig;
//!
//! let config = RuntimeConfig::default().with_workers(2).with_prespawn_fibers(64);
//! config.validate().unwrap();
//! ```

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, Result};
use crate::launch::MAX_THREADS_PER_BLOCK;

/// Worker count override.
pub const ENV_WORKERS: &str = "CUDIFY_WORKERS";
/// Fiber stack size override, in bytes.
pub const ENV_FIBER_STACK_SIZE: &str = "CUDIFY_FIBER_STACK_SIZE";
/// Fibers to spawn per worker before the first launch.
pub const ENV_PRESPAWN_FIBERS: &str = "CUDIFY_PRESPAWN_FIBERS";
/// Cap on fibers alive at once across all workers.
pub const ENV_MAX_FIBERS: &str = "CUDIFY_MAX_FIBERS";

pub const DEFAULT_FIBER_STACK_SIZE: usize = 256 * 1024;
pub const MIN_FIBER_STACK_SIZE: usize = 32 * 1024;
pub const DEFAULT_MAX_FIBERS: usize = 8192;
/// Enough for one full-size block running plus the same again kept idle.
pub const MIN_MAX_FIBERS: usize = 2 * MAX_THREADS_PER_BLOCK as usize;

/// Settings fixed when an [`Emulator`](crate::Emulator) is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// OS worker threads blocks are spread across.
    pub workers: usize,
    /// Stack size of every fiber, in bytes.
    pub fiber_stack_size: usize,
    /// Fibers each worker spawns up front.
    pub prespawn_fibers: usize,
    /// Fibers (each an OS thread) alive at once across all workers.
    pub max_fibers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            fiber_stack_size: DEFAULT_FIBER_STACK_SIZE,
            prespawn_fibers: 0,
            max_fibers: DEFAULT_MAX_FIBERS,
        }
    }
}

#[cfg(feature = "cpu-sequential")]
fn default_workers() -> usize {
    1
}

#[cfg(not(feature = "cpu-sequential"))]
fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

impl RuntimeConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_fiber_stack_size(mut self, bytes: usize) -> Self {
        self.fiber_stack_size = bytes;
        self
    }

    pub fn with_prespawn_fibers(mut self, count: usize) -> Self {
        self.prespawn_fibers = count;
        self
    }

    pub fn with_max_fibers(mut self, count: usize) -> Self {
        self.max_fibers = count;
        self
    }

    /// Idle fibers each worker may keep between launches.
    pub fn idle_fibers_per_worker(&self) -> usize {
        self.max_fibers / 2 / self.workers.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(BackendError::invalid_config("workers must be at least 1"));
        }
        if self.fiber_stack_size < MIN_FIBER_STACK_SIZE {
            return Err(BackendError::invalid_config(format!(
                "fiber stack size {} is below the minimum of {} bytes",
                self.fiber_stack_size, MIN_FIBER_STACK_SIZE
            )));
        }
        if self.max_fibers < MIN_MAX_FIBERS {
            return Err(BackendError::invalid_config(format!(
                "max fibers {} is below the minimum of {}",
                self.max_fibers, MIN_MAX_FIBERS
            )));
        }
        if self.prespawn_fibers > self.idle_fibers_per_worker() {
            return Err(BackendError::invalid_config(format!(
                "{} prespawned fibers per worker exceed the idle share of {} for {} workers and {} max fibers",
                self.prespawn_fibers,
                self.idle_fibers_per_worker(),
                self.workers,
                self.max_fibers
            )));
        }
        Ok(())
    }

    /// Defaults overridden by `CUDIFY_*` variables.
    ///
    /// Values that do not parse, or that would fail [`validate`](Self::validate),
    /// are logged and ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut config = defaults.clone();

        if let Some(workers) = read_env::<usize>(ENV_WORKERS) {
            config.workers = workers;
        }
        if let Some(bytes) = read_env::<usize>(ENV_FIBER_STACK_SIZE) {
            config.fiber_stack_size = bytes;
        }
        if let Some(count) = read_env::<usize>(ENV_PRESPAWN_FIBERS) {
            config.prespawn_fibers = count;
        }
        if let Some(count) = read_env::<usize>(ENV_MAX_FIBERS) {
            config.max_fibers = count;
        }

        if config.workers == 0 {
            tracing::warn!(var = ENV_WORKERS, "ignoring zero worker count");
            config.workers = defaults.workers;
        }
        if config.fiber_stack_size < MIN_FIBER_STACK_SIZE {
            tracing::warn!(
                var = ENV_FIBER_STACK_SIZE,
                value = config.fiber_stack_size,
                minimum = MIN_FIBER_STACK_SIZE,
                "ignoring fiber stack size below minimum"
            );
            config.fiber_stack_size = defaults.fiber_stack_size;
        }
        if config.max_fibers < MIN_MAX_FIBERS {
            tracing::warn!(
                var = ENV_MAX_FIBERS,
                value = config.max_fibers,
                minimum = MIN_MAX_FIBERS,
                "ignoring fiber cap below minimum"
            );
            config.max_fibers = defaults.max_fibers;
        }
        if config.prespawn_fibers > config.idle_fibers_per_worker() {
            tracing::warn!(
                var = ENV_PRESPAWN_FIBERS,
                value = config.prespawn_fibers,
                share = config.idle_fibers_per_worker(),
                "ignoring prespawn count above the idle share"
            );
            config.prespawn_fibers = 0;
        }

        config
    }
}

fn read_env<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = key, value = %raw, "ignoring malformed environment value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [ENV_WORKERS, ENV_FIBER_STACK_SIZE, ENV_PRESPAWN_FIBERS, ENV_MAX_FIBERS] {
            env::remove_var(key);
        }
    }

    #[test]
    fn default_is_valid() {
        let config = RuntimeConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.fiber_stack_size, DEFAULT_FIBER_STACK_SIZE);
        assert_eq!(config.prespawn_fibers, 0);
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_workers_and_tiny_stacks() {
        assert!(matches!(
            RuntimeConfig::default().with_workers(0).validate(),
            Err(BackendError::InvalidConfig(_))
        ));
        assert!(matches!(
            RuntimeConfig::default().with_fiber_stack_size(1024).validate(),
            Err(BackendError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_bounds_the_fiber_budget() {
        assert!(matches!(
            RuntimeConfig::default().with_max_fibers(MIN_MAX_FIBERS - 1).validate(),
            Err(BackendError::InvalidConfig(_))
        ));

        let config = RuntimeConfig::default().with_workers(4).with_max_fibers(4096);
        assert_eq!(config.idle_fibers_per_worker(), 512);
        config.clone().with_prespawn_fibers(512).validate().unwrap();
        assert!(matches!(
            config.with_prespawn_fibers(513).validate(),
            Err(BackendError::InvalidConfig(_))
        ));
    }

    #[test]
    #[serial]
    fn from_env_applies_overrides() {
        clear_env();
        env::set_var(ENV_WORKERS, "3");
        env::set_var(ENV_FIBER_STACK_SIZE, "65536");
        env::set_var(ENV_PRESPAWN_FIBERS, "16");
        env::set_var(ENV_MAX_FIBERS, "4096");

        let config = RuntimeConfig::from_env();
        assert_eq!(config.workers, 3);
        assert_eq!(config.fiber_stack_size, 65536);
        assert_eq!(config.prespawn_fibers, 16);
        assert_eq!(config.max_fibers, 4096);
        clear_env();
    }

    #[test]
    #[serial]
    fn from_env_ignores_bad_values() {
        clear_env();
        env::set_var(ENV_WORKERS, "many");
        env::set_var(ENV_FIBER_STACK_SIZE, "12");
        env::set_var(ENV_MAX_FIBERS, "100");

        let config = RuntimeConfig::from_env();
        let defaults = RuntimeConfig::default();
        assert_eq!(config.workers, defaults.workers);
        assert_eq!(config.fiber_stack_size, DEFAULT_FIBER_STACK_SIZE);
        assert_eq!(config.max_fibers, DEFAULT_MAX_FIBERS);
        clear_env();
    }

    #[test]
    fn deserialises_with_missing_fields() {
        let config: RuntimeConfig = serde_json::from_str(r#"{ "workers": 2 }"#).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.fiber_stack_size, DEFAULT_FIBER_STACK_SIZE);
    }
}
