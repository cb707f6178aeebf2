//! Portable execution layer for GPU-style kernels.
//!
//! This crate provides:
//! - **Device contexts**: one [`DeviceContext`] capability set (allocation,
//!   synchronisation, timing, events, device queries, three scratch buffers)
//!   with a driver-backed, a CPU stub and a disabled implementation, chosen
//!   at build time.
//! - **CPU emulation**: grid launches executed on CPU cores, with every
//!   simulated thread running on its own fiber so block-wide barriers and
//!   emulated atomics behave as they do on hardware.
//!
//! # Architecture
//!
//! ```text
//!                 calling code
//!          ┌───────────┴────────────┐
//!          ▼                        ▼
//!   DeviceContext             Emulator::launch
//!   (Cuda | Cpu | Disabled)    ├── workers ─ contiguous block ranges
//!                              └── per block ─ fibers + barrier scheduler
//!                                     └── ThreadCtx / kernel::* accessors
//! ```
//!
//! # Usage
//!
//! ```rust
//! use cudify_runtime::{create_context, ContextOpt, DeviceBuffer, DeviceContext, Emulator, LaunchConfig, RuntimeConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut ctx = create_context(ContextOpt::NoPrintProps, 0);
//! ctx.timer_begin()?;
//!
//! let emulator = Emulator::new(RuntimeConfig::default().with_workers(2))?;
//! let counter = DeviceBuffer::<i32>::zeroed(1);
//! let out = DeviceBuffer::<u32>::zeroed(4);
//!
//! emulator.launch(&LaunchConfig::linear(4, 4), |t| {
//!     t.atomic_add(&counter, 0, 1);
//!     t.sync_threads();
//!     out.set(t.thread_idx().x as usize, t.thread_idx().x);
//! })?;
//!
//! ctx.synchronize()?;
//! let _seconds = ctx.timer_end()?;
//! assert_eq!(counter.get(0), 4);
//! assert_eq!(out.to_vec(), vec![0, 1, 2, 3]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod emulation;
pub mod error;
pub mod kernel;
pub mod launch;

pub use config::RuntimeConfig;
pub use device::{
    create_context, BackendKind, ContextOpt, ContextState, DefaultContext, DeviceContext, DeviceProps, DevicePtr,
    EventHandle, MemorySpace, ScratchBuffer, ScratchSlot, StreamHandle,
};
pub use emulation::{AtomicScratch, DeviceBuffer, Element, Emulator, EmulatorStats, ThreadCtx};
pub use error::{BackendError, Result};
pub use launch::{Dim3, ExecutionContext, LaunchConfig};
