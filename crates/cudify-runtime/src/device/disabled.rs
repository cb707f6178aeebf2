//! Context for builds with GPU support switched off. Every call is a silent no-op.

use tracing::{debug, trace};

use crate::device::{
    log_created, BackendKind, ContextOpt, ContextState, DeviceContext, DeviceProps, DevicePtr, EventHandle,
    MemorySpace, ScratchBuffer, ScratchSlot, StreamHandle,
};
use crate::error::Result;

#[derive(Debug)]
pub struct DisabledContext {
    state: ContextState,
    props: DeviceProps,
    scratch: [ScratchBuffer; 3],
}

impl DisabledContext {
    pub fn new(opt: ContextOpt, _dev_num: i32) -> Self {
        let ctx = Self {
            state: ContextState::Initialized { degraded: true },
            props: DeviceProps::default(),
            scratch: [ScratchBuffer::host(), ScratchBuffer::host(), ScratchBuffer::host()],
        };
        log_created(BackendKind::Disabled, opt, ctx.state, &ctx.props);
        ctx
    }
}

impl Default for DisabledContext {
    fn default() -> Self {
        Self::new(ContextOpt::default(), 0)
    }
}

impl DeviceContext for DisabledContext {
    fn backend(&self) -> BackendKind {
        BackendKind::Disabled
    }

    fn state(&self) -> ContextState {
        self.state
    }

    fn alloc(&self, size: usize, space: MemorySpace) -> Result<DevicePtr> {
        trace!(target: "cudify::device", size, %space, "disabled alloc");
        Ok(DevicePtr::null())
    }

    fn free(&self, _ptr: DevicePtr, _space: MemorySpace) -> Result<()> {
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn event(&self) -> EventHandle {
        EventHandle::default()
    }

    fn timer_begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn timer_end(&mut self) -> Result<f64> {
        Ok(0.0)
    }

    fn device(&self) -> i32 {
        0
    }

    fn device_count(&self) -> i32 {
        0
    }

    fn props(&self) -> &DeviceProps {
        &self.props
    }

    fn ptx_version(&self) -> i32 {
        0
    }

    fn stream(&self) -> StreamHandle {
        StreamHandle::DEFAULT
    }

    fn scratch(&mut self, slot: ScratchSlot) -> &mut ScratchBuffer {
        &mut self.scratch[slot.index()]
    }

    fn destroy(&mut self) {
        if self.state != ContextState::Destroyed {
            for buffer in &mut self.scratch {
                buffer.release();
            }
            self.state = ContextState::Destroyed;
            debug!(target: "cudify::device", backend = "disabled", "device context destroyed");
        }
    }
}

impl Drop for DisabledContext {
    fn drop(&mut self) {
        self.destroy();
    }
}
