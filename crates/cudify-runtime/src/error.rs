//! Error types for device contexts and the emulator

use std::io;

use crate::device::MemorySpace;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors surfaced by device contexts and kernel launches
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// A driver allocation failed
    #[error("failed to allocate {size} bytes of {space} memory (driver error {code})")]
    AllocationFailure { size: usize, space: MemorySpace, code: i32 },

    /// Any other driver call failed
    #[error("{operation} failed (driver error {code})")]
    Driver { operation: &'static str, code: i32 },

    /// Introspection on a backend without hardware. Only ever logged.
    #[error("{operation} is not implemented on the {backend} backend")]
    QueryUnavailable { backend: &'static str, operation: &'static str },

    /// Invalid launch configuration
    #[error("invalid launch configuration: {0}")]
    InvalidLaunchConfig(String),

    /// A kernel body panicked on one simulated thread
    #[error("kernel panicked in block {block}, thread {thread}: {message}")]
    KernelPanicked { block: u64, thread: u64, message: String },

    /// The OS refused to create a fiber
    #[error("failed to spawn fiber: {0}")]
    FiberSpawn(#[source] io::Error),

    /// Spawning another fiber would exceed the emulator's fiber budget
    #[error("fiber budget of {limit} exhausted")]
    FiberLimit { limit: usize },

    /// The worker pool could not be built
    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),

    /// The process-wide runtime was already initialised with other settings
    #[error("runtime already initialised with a different configuration")]
    AlreadyInitialized,

    /// Malformed configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BackendError {
    pub fn invalid_launch(msg: impl Into<String>) -> Self {
        Self::InvalidLaunchConfig(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Native driver code, when the error came from the driver.
    pub fn driver_code(&self) -> Option<i32> {
        match self {
            Self::AllocationFailure { code, .. } | Self::Driver { code, .. } => Some(*code),
            _ => None,
        }
    }
}
