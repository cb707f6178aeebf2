//! Per-simulated-thread state.
//!
//! The scheduler builds one [`ThreadCtx`] per simulated thread, on the fiber
//! that runs it, and passes it to the kernel body explicitly. While the body
//! runs, the same context is also installed in a thread-local slot so the
//! free functions in [`crate::kernel`] can reach it.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use crate::emulation::atomics::{self, AtomicScratch};
use crate::emulation::fiber::FiberLink;
use crate::emulation::memory::DeviceBuffer;
use crate::launch::{Dim3, ExecutionContext};

/// Coordinates, barrier generation and atomic scratch of one simulated thread.
#[derive(Debug)]
pub struct ThreadCtx {
    exec: ExecutionContext,
    barrier_generation: Cell<u64>,
    scratch: AtomicScratch,
    fiber: Option<Arc<FiberLink>>,
}

impl ThreadCtx {
    /// Context not attached to any scheduler; [`sync_threads`](Self::sync_threads)
    /// only counts generations.
    pub fn detached(exec: ExecutionContext) -> Self {
        Self {
            exec,
            barrier_generation: Cell::new(0),
            scratch: AtomicScratch::new(),
            fiber: None,
        }
    }

    pub(crate) fn on_fiber(exec: ExecutionContext, fiber: Arc<FiberLink>) -> Self {
        Self {
            fiber: Some(fiber),
            ..Self::detached(exec)
        }
    }

    pub fn thread_idx(&self) -> Dim3 {
        self.exec.thread_idx
    }

    pub fn block_idx(&self) -> Dim3 {
        self.exec.block_idx
    }

    pub fn block_dim(&self) -> Dim3 {
        self.exec.block_dim
    }

    pub fn grid_dim(&self) -> Dim3 {
        self.exec.grid_dim
    }

    pub fn execution(&self) -> &ExecutionContext {
        &self.exec
    }

    /// Unique index of this thread across the whole grid.
    pub fn global_index(&self) -> u64 {
        self.exec.global_thread_index()
    }

    /// Number of barriers this thread has passed or is waiting at.
    pub fn barrier_generation(&self) -> u64 {
        self.barrier_generation.get()
    }

    /// Block-wide barrier.
    ///
    /// Returns once every thread of the block has reached this barrier or
    /// finished. Every thread of a block must call it the same number of
    /// times: divergent barriers are undefined behaviour, as on hardware.
    /// The emulator logs a warning and releases the waiting threads once the
    /// others have finished.
    pub fn sync_threads(&self) {
        self.barrier_generation.set(self.barrier_generation.get() + 1);
        if let Some(fiber) = &self.fiber {
            fiber.suspend();
        }
    }

    pub fn scratch(&self) -> &AtomicScratch {
        &self.scratch
    }

    /// Emulated `atomicAdd`: returns the previous value.
    pub fn atomic_add(&self, buffer: &DeviceBuffer<i32>, index: usize, value: i32) -> i32 {
        atomics::atomic_add(&self.scratch, buffer, index, value)
    }

    /// Emulated `atomicSub`: returns the previous value.
    pub fn atomic_sub(&self, buffer: &DeviceBuffer<i32>, index: usize, value: i32) -> i32 {
        atomics::atomic_sub(&self.scratch, buffer, index, value)
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<ThreadCtx>>> = const { RefCell::new(None) };
}

/// Restores the previous current context on drop.
pub(crate) struct CurrentGuard {
    previous: Option<Rc<ThreadCtx>>,
}

/// Make `ctx` the current context of this OS thread.
pub(crate) fn install(ctx: Rc<ThreadCtx>) -> CurrentGuard {
    let previous = CURRENT.with(|slot| slot.borrow_mut().replace(ctx));
    CurrentGuard { previous }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|slot| *slot.borrow_mut() = previous);
    }
}

/// The context of the simulated thread running on this OS thread, if any.
pub fn current() -> Option<Rc<ThreadCtx>> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Whether this OS thread is running a kernel body.
pub fn in_kernel() -> bool {
    CURRENT.with(|slot| slot.borrow().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec() -> ExecutionContext {
        ExecutionContext::new(Dim3::new(1, 0, 0), Dim3::new(2, 1, 0), Dim3::new(4, 1, 1), Dim3::new(4, 2, 1))
    }

    #[test]
    fn detached_context_counts_barriers() {
        let ctx = ThreadCtx::detached(exec());
        assert_eq!(ctx.thread_idx(), Dim3::new(2, 1, 0));
        assert_eq!(ctx.block_idx(), Dim3::new(1, 0, 0));
        assert_eq!(ctx.global_index(), 8 + 6);
        ctx.sync_threads();
        ctx.sync_threads();
        assert_eq!(ctx.barrier_generation(), 2);
    }

    #[test]
    fn install_nests_and_restores() {
        assert!(!in_kernel());
        let outer = Rc::new(ThreadCtx::detached(exec()));
        let guard = install(Rc::clone(&outer));
        {
            let inner_exec = ExecutionContext::new(Dim3::ZERO, Dim3::ZERO, Dim3::ONE, Dim3::ONE);
            let _inner = install(Rc::new(ThreadCtx::detached(inner_exec)));
            assert_eq!(current().map(|c| c.thread_idx()), Some(Dim3::ZERO));
        }
        assert_eq!(current().map(|c| c.thread_idx()), Some(Dim3::new(2, 1, 0)));
        drop(guard);
        assert!(current().is_none());
    }

    #[test]
    fn atomics_record_in_thread_scratch() {
        let ctx = ThreadCtx::detached(exec());
        let buf = DeviceBuffer::from_slice(&[1, 2]);
        assert_eq!(ctx.atomic_add(&buf, 1, 4), 2);
        assert_eq!(ctx.atomic_sub(&buf, 0, 1), 1);
        assert_eq!((ctx.scratch().add(), ctx.scratch().rem()), (2, 1));
        assert_eq!(buf.to_vec(), vec![0, 6]);
    }
}
