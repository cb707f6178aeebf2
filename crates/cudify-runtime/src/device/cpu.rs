//! CPU stand-in for a device context.
//!
//! Operations that need real hardware log a diagnostic and return a default
//! value. Nothing here returns an error, so CPU-only builds of calling code
//! keep running.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

use crate::device::{
    log_created, BackendKind, ContextOpt, ContextState, DeviceContext, DeviceProps, DevicePtr, EventHandle,
    MemorySpace, ScratchBuffer, ScratchSlot, StreamHandle,
};
use crate::error::{BackendError, Result};

/// Operations the CPU stub cannot perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubOperation {
    Alloc,
    Free,
    Event,
    TimerBegin,
    TimerEnd,
    Device,
    DeviceCount,
    Stream,
}

impl StubOperation {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Alloc => "alloc",
            Self::Free => "free",
            Self::Event => "event",
            Self::TimerBegin => "timer_begin",
            Self::TimerEnd => "timer_end",
            Self::Device => "device",
            Self::DeviceCount => "device_count",
            Self::Stream => "stream",
        }
    }

    const fn bit(self) -> u32 {
        1 << self as u32
    }
}

/// Device context used when no accelerator API is compiled in.
#[derive(Debug)]
pub struct CpuContext {
    opt: ContextOpt,
    state: ContextState,
    props: DeviceProps,
    scratch: [ScratchBuffer; 3],
    reported: AtomicU32,
}

impl CpuContext {
    pub fn new(opt: ContextOpt, dev_num: i32) -> Self {
        let ctx = Self {
            opt,
            state: ContextState::Initialized { degraded: true },
            props: DeviceProps::default(),
            scratch: [ScratchBuffer::host(), ScratchBuffer::host(), ScratchBuffer::host()],
            reported: AtomicU32::new(0),
        };
        debug!(target: "cudify::device", dev_num, "cpu context ignores the requested ordinal");
        log_created(BackendKind::Cpu, opt, ctx.state, &ctx.props);
        ctx
    }

    pub fn opt(&self) -> ContextOpt {
        self.opt
    }

    /// Whether `op` has already produced its first diagnostic.
    pub fn has_reported(&self, op: StubOperation) -> bool {
        self.reported.load(Ordering::Relaxed) & op.bit() != 0
    }

    fn unavailable(&self, op: StubOperation) {
        let diagnostic = BackendError::QueryUnavailable {
            backend: BackendKind::Cpu.name(),
            operation: op.name(),
        };
        let previous = self.reported.fetch_or(op.bit(), Ordering::Relaxed);
        if previous & op.bit() == 0 {
            warn!(target: "cudify::device", "{diagnostic}");
        } else {
            debug!(target: "cudify::device", "{diagnostic}");
        }
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::new(ContextOpt::default(), 0)
    }
}

impl DeviceContext for CpuContext {
    fn backend(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn state(&self) -> ContextState {
        self.state
    }

    fn alloc(&self, size: usize, space: MemorySpace) -> Result<DevicePtr> {
        if size > 0 {
            debug!(target: "cudify::device", size, %space, "cpu alloc returns null");
            self.unavailable(StubOperation::Alloc);
        }
        Ok(DevicePtr::null())
    }

    fn free(&self, ptr: DevicePtr, _space: MemorySpace) -> Result<()> {
        if !ptr.is_null() {
            self.unavailable(StubOperation::Free);
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        // Emulated launches complete before they return.
        Ok(())
    }

    fn event(&self) -> EventHandle {
        self.unavailable(StubOperation::Event);
        EventHandle::default()
    }

    fn timer_begin(&mut self) -> Result<()> {
        self.unavailable(StubOperation::TimerBegin);
        Ok(())
    }

    fn timer_end(&mut self) -> Result<f64> {
        self.unavailable(StubOperation::TimerEnd);
        Ok(0.0)
    }

    fn device(&self) -> i32 {
        self.unavailable(StubOperation::Device);
        0
    }

    fn device_count(&self) -> i32 {
        self.unavailable(StubOperation::DeviceCount);
        0
    }

    fn props(&self) -> &DeviceProps {
        &self.props
    }

    fn ptx_version(&self) -> i32 {
        0
    }

    fn stream(&self) -> StreamHandle {
        self.unavailable(StubOperation::Stream);
        StreamHandle::DEFAULT
    }

    fn scratch(&mut self, slot: ScratchSlot) -> &mut ScratchBuffer {
        &mut self.scratch[slot.index()]
    }

    fn destroy(&mut self) {
        if self.state == ContextState::Destroyed {
            return;
        }
        for buffer in &mut self.scratch {
            buffer.release();
        }
        self.state = ContextState::Destroyed;
        debug!(target: "cudify::device", backend = "cpu", "device context destroyed");
    }
}

impl Drop for CpuContext {
    fn drop(&mut self) {
        self.destroy();
    }
}
