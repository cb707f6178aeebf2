//! CPU emulation of the grid/block/thread execution model.
//!
//! ```text
//! Emulator ── partitions blocks across workers (rayon pool)
//!   └── per worker: FiberPool + scheduler::run_block
//!         └── per thread: Fiber running the kernel with its ThreadCtx
//! ```
//!
//! Fibers and their pools belong to the emulator and cannot be named from
//! outside the crate:
//!
//! ```compile_fail
//! use cudify_runtime::emulation::fiber::FiberPool;
//! ```

pub mod atomics;
pub mod coords;
pub mod emulator;
pub(crate) mod fiber;
pub mod memory;
pub(crate) mod scheduler;

pub use atomics::AtomicScratch;
pub use coords::ThreadCtx;
pub use emulator::{global, init, is_initialized, launch, partition_blocks, Emulator, EmulatorStats};
pub use memory::{DeviceBuffer, Element};
