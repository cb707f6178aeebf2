//! Device contexts: one capability set, three build-time backends.
//!
//! Calling code holds a [`DefaultContext`] (or a `Box<dyn DeviceContext>`)
//! and never branches on which accelerator is present:
//!
//! ```text
//! DeviceContext
//! ├── CudaContext      - driver-backed (feature `cuda`)
//! ├── CpuContext       - CPU stub, diagnostics instead of failures
//! └── DisabledContext  - silent no-op (feature `disabled`)
//! ```
//!
//! ```rust
//! use cudify_runtime::device::{create_context, ContextOpt, DeviceContext, MemorySpace};
//!
//! let mut ctx = create_context(ContextOpt::Dummy, 0);
//! let ptr = ctx.alloc(0, MemorySpace::Device).unwrap();
//! assert!(ptr.is_null());
//! ctx.free(ptr, MemorySpace::Device).unwrap();
//! ```

pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod disabled;
pub mod scratch;

use std::fmt;

use crate::error::Result;

pub use cpu::CpuContext;
#[cfg(feature = "cuda")]
pub use cuda::CudaContext;
pub use disabled::DisabledContext;
pub use scratch::{ScratchAllocator, ScratchBuffer};

#[cfg(all(feature = "cuda", feature = "disabled"))]
compile_error!("features `cuda` and `disabled` are mutually exclusive");

/// Context selected by the enabled cargo features.
#[cfg(feature = "cuda")]
pub type DefaultContext = CudaContext;
/// Context selected by the enabled cargo features.
#[cfg(all(feature = "disabled", not(feature = "cuda")))]
pub type DefaultContext = DisabledContext;
/// Context selected by the enabled cargo features.
#[cfg(not(any(feature = "cuda", feature = "disabled")))]
pub type DefaultContext = CpuContext;

/// Build the context selected at compile time.
pub fn create_context(opt: ContextOpt, dev_num: i32) -> DefaultContext {
    DefaultContext::new(opt, dev_num)
}

/// Construction option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContextOpt {
    /// Bind a device quietly.
    #[default]
    NoPrintProps,
    /// Bind a device and log its properties.
    PrintProps,
    /// Do not bind a device; only memory and timer bookkeeping.
    Dummy,
}

/// Where an allocation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    Device,
    HostPinned,
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => f.write_str("device"),
            Self::HostPinned => f.write_str("host-pinned"),
        }
    }
}

/// Which backend implements a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Cuda,
    Cpu,
    Disabled,
}

impl BackendKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Cpu => "cpu",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of a context. Transitions are linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    Uninitialized,
    /// `degraded` is set when no device is bound.
    Initialized { degraded: bool },
    Destroyed,
}

/// Opaque device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const fn null() -> Self {
        Self(0)
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn addr(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque event handle; `0` means none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventHandle(pub u64);

/// Opaque stream handle; `0` is the default stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamHandle(pub u64);

impl StreamHandle {
    pub const DEFAULT: StreamHandle = StreamHandle(0);
}

/// Properties of the bound device. All zero when no device is bound.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceProps {
    pub name: String,
    pub ordinal: i32,
    pub compute_major: i32,
    pub compute_minor: i32,
    pub multiprocessor_count: i32,
    pub total_memory: usize,
}

impl DeviceProps {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.total_memory == 0
    }
}

impl fmt::Display for DeviceProps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(
            f,
            "{} : {} SMs, {:.0} MB, compute {}.{} (device {})",
            self.name,
            self.multiprocessor_count,
            self.total_memory as f64 / (1024.0 * 1024.0),
            self.compute_major,
            self.compute_minor,
            self.ordinal
        )
    }
}

/// One of the three context-owned workspaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScratchSlot {
    Primary,
    Secondary,
    Tertiary,
}

impl ScratchSlot {
    pub const ALL: [ScratchSlot; 3] = [Self::Primary, Self::Secondary, Self::Tertiary];

    pub const fn index(self) -> usize {
        match self {
            Self::Primary => 0,
            Self::Secondary => 1,
            Self::Tertiary => 2,
        }
    }
}

/// Allocation, synchronisation, timing and query surface shared by all backends.
///
/// Scratch buffers are shared between every routine that uses them; callers
/// on different workers must serialise access themselves.
pub trait DeviceContext: Send {
    fn backend(&self) -> BackendKind;

    fn state(&self) -> ContextState;

    /// Allocate `size` bytes. `size == 0` returns a null pointer.
    fn alloc(&self, size: usize, space: MemorySpace) -> Result<DevicePtr>;

    /// Release `ptr`. Null is ignored.
    fn free(&self, ptr: DevicePtr, space: MemorySpace) -> Result<()>;

    /// Wait for outstanding work on the context stream.
    fn synchronize(&self) -> Result<()>;

    fn event(&self) -> EventHandle;

    fn timer_begin(&mut self) -> Result<()>;

    /// Seconds since the matching [`timer_begin`](Self::timer_begin); `0.0` without one.
    fn timer_end(&mut self) -> Result<f64>;

    /// Ordinal of the current device.
    fn device(&self) -> i32;

    /// Number of visible devices.
    fn device_count(&self) -> i32;

    fn props(&self) -> &DeviceProps;

    fn ptx_version(&self) -> i32;

    fn stream(&self) -> StreamHandle;

    fn scratch(&mut self, slot: ScratchSlot) -> &mut ScratchBuffer;

    /// Release backend handles. Later calls are no-ops.
    fn destroy(&mut self);
}

impl fmt::Debug for dyn DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("backend", &self.backend())
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) fn log_created(backend: BackendKind, opt: ContextOpt, state: ContextState, props: &DeviceProps) {
    let degraded = matches!(state, ContextState::Initialized { degraded: true });
    tracing::info!(
        target: "cudify::device",
        backend = backend.name(),
        ordinal = props.ordinal,
        degraded,
        "device context created"
    );
    if opt == ContextOpt::PrintProps {
        tracing::info!(target: "cudify::device", props = %props, "device properties");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ptr_null() {
        assert!(DevicePtr::null().is_null());
        assert!(!DevicePtr(0x1000).is_null());
        assert_eq!(DevicePtr(0x1000).to_string(), "0x1000");
    }

    #[test]
    fn empty_props_render_empty() {
        assert_eq!(DeviceProps::default().to_string(), "");
        let props = DeviceProps {
            name: "Test GPU".into(),
            ordinal: 1,
            compute_major: 8,
            compute_minor: 6,
            multiprocessor_count: 82,
            total_memory: 1024 * 1024 * 1024,
        };
        assert_eq!(props.to_string(), "Test GPU : 82 SMs, 1024 MB, compute 8.6 (device 1)");
    }

    #[test]
    fn scratch_slot_indices_are_distinct() {
        let indices: Vec<_> = ScratchSlot::ALL.iter().map(|s| s.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn default_context_matches_features() {
        let ctx = create_context(ContextOpt::Dummy, 0);
        #[cfg(not(any(feature = "cuda", feature = "disabled")))]
        assert_eq!(ctx.backend(), BackendKind::Cpu);
        #[cfg(all(feature = "disabled", not(feature = "cuda")))]
        assert_eq!(ctx.backend(), BackendKind::Disabled);
        #[cfg(feature = "cuda")]
        assert_eq!(ctx.backend(), BackendKind::Cuda);
    }
}
