//! Driver-backed device context (feature `cuda`).
//!
//! ```text
//! CudaContext
//! ├── CudaDevice       - primary context of the selected ordinal
//! ├── stream           - the device's default stream
//! ├── timer[2], event  - created at construction, destroyed once
//! └── scratch[3]       - driver allocations, grown on demand
//! ```
//!
//! With zero visible devices the context is built in a degraded state and
//! every query returns its default.
//!
//! `ContextOpt::Dummy` never changes which context is current on the calling
//! thread: it adopts the device of the current context (ordinal 0 when there
//! is none) and runs every later call on whatever context is current.

use std::ffi::c_void;
use std::sync::Arc;

use cudarc::driver::{result, sys, CudaDevice, DriverError};
use tracing::{debug, warn};

use crate::device::{
    log_created, BackendKind, ContextOpt, ContextState, DeviceContext, DeviceProps, DevicePtr, EventHandle,
    MemorySpace, ScratchAllocator, ScratchBuffer, ScratchSlot, StreamHandle,
};
use crate::error::{BackendError, Result};

/// PTX version assumed when the compute capability cannot be read.
pub const FALLBACK_PTX_VERSION: i32 = 60;

fn driver_error(operation: &'static str) -> impl FnOnce(DriverError) -> BackendError {
    move |err| BackendError::Driver {
        operation,
        code: err.0 as i32,
    }
}

struct Bound {
    device: Arc<CudaDevice>,
    /// Make the device's primary context current before each driver call.
    binds: bool,
    timer: [sys::CUevent; 2],
    event: sys::CUevent,
}

impl Bound {
    fn activate(&self) -> Result<()> {
        activate(&self.device, self.binds)
    }
}

fn activate(device: &CudaDevice, binds: bool) -> Result<()> {
    if binds {
        device.bind_to_thread().map_err(driver_error("cuCtxSetCurrent"))?;
    }
    Ok(())
}

/// Context current on the calling thread, if any.
fn current_context() -> Result<Option<sys::CUcontext>> {
    let mut ctx: sys::CUcontext = std::ptr::null_mut();
    // SAFETY: the out-pointer refers to a live local.
    unsafe { sys::lib().cuCtxGetCurrent(&mut ctx) }
        .result()
        .map_err(driver_error("cuCtxGetCurrent"))?;
    Ok((!ctx.is_null()).then_some(ctx))
}

/// Device ordinal of the current context.
fn current_ordinal() -> Result<i32> {
    let mut device: sys::CUdevice = 0;
    // SAFETY: the out-pointer refers to a live local.
    unsafe { sys::lib().cuCtxGetDevice(&mut device) }
        .result()
        .map_err(driver_error("cuCtxGetDevice"))?;
    Ok(device)
}

pub struct CudaContext {
    state: ContextState,
    bound: Option<Bound>,
    props: DeviceProps,
    ptx_version: i32,
    device_count: i32,
    timer_started: bool,
    scratch: [ScratchBuffer; 3],
}

// SAFETY: the raw event handles are only used through `&mut self` or after
// binding the device's primary context to the calling thread.
unsafe impl Send for CudaContext {}

impl CudaContext {
    pub fn new(opt: ContextOpt, dev_num: i32) -> Self {
        let mut ctx = Self {
            state: ContextState::Uninitialized,
            bound: None,
            props: DeviceProps::default(),
            ptx_version: FALLBACK_PTX_VERSION,
            device_count: 0,
            timer_started: false,
            scratch: [ScratchBuffer::host(), ScratchBuffer::host(), ScratchBuffer::host()],
        };

        match Self::bind(opt, dev_num) {
            Ok(Some((bound, props, count))) => {
                ctx.ptx_version = props.compute_major * 10 + props.compute_minor;
                if ctx.ptx_version == 0 {
                    ctx.ptx_version = FALLBACK_PTX_VERSION;
                }
                let allocator: Arc<dyn ScratchAllocator> = Arc::new(DriverAllocator {
                    device: Arc::clone(&bound.device),
                    binds: bound.binds,
                });
                ctx.scratch = [
                    ScratchBuffer::device(Arc::clone(&allocator)),
                    ScratchBuffer::device(Arc::clone(&allocator)),
                    ScratchBuffer::device(allocator),
                ];
                ctx.props = props;
                ctx.device_count = count;
                ctx.bound = Some(bound);
                ctx.state = ContextState::Initialized { degraded: false };
            }
            Ok(None) => {
                ctx.state = ContextState::Initialized { degraded: true };
            }
            Err(err) => {
                warn!(target: "cudify::device", error = %err, "no usable device, continuing degraded");
                ctx.state = ContextState::Initialized { degraded: true };
            }
        }

        log_created(BackendKind::Cuda, opt, ctx.state, &ctx.props);
        ctx
    }

    fn bind(opt: ContextOpt, dev_num: i32) -> Result<Option<(Bound, DeviceProps, i32)>> {
        result::init().map_err(driver_error("cuInit"))?;
        let count = result::device::get_count().map_err(driver_error("cuDeviceGetCount"))?;
        if count <= 0 {
            return Ok(None);
        }

        let binds = opt != ContextOpt::Dummy;
        let previous = if binds { None } else { current_context()? };
        let ordinal = match (opt, previous) {
            (ContextOpt::Dummy, Some(_)) => current_ordinal()?,
            (ContextOpt::Dummy, None) => 0,
            _ => dev_num.rem_euclid(count),
        };

        // Retaining the primary context makes it current.
        let device = CudaDevice::new(ordinal as usize).map_err(driver_error("cuDevicePrimaryCtxRetain"))?;
        match previous {
            // SAFETY: `ctx` was current on this thread a moment ago and is still alive.
            Some(ctx) => unsafe { sys::lib().cuCtxSetCurrent(ctx) }
                .result()
                .map_err(driver_error("cuCtxSetCurrent"))?,
            None => activate(&device, binds)?,
        }

        let props = query_props(&device, ordinal)?;

        let flags = sys::CUevent_flags::CU_EVENT_DEFAULT;
        let timer = [
            result::event::create(flags).map_err(driver_error("cuEventCreate"))?,
            result::event::create(flags).map_err(driver_error("cuEventCreate"))?,
        ];
        let event = result::event::create(flags).map_err(driver_error("cuEventCreate"))?;

        Ok(Some((
            Bound {
                device,
                binds,
                timer,
                event,
            },
            props,
            count,
        )))
    }

    fn bound(&self) -> Option<&Bound> {
        self.bound.as_ref()
    }

    fn raw_stream(bound: &Bound) -> sys::CUstream {
        *bound.device.cu_stream()
    }
}

fn query_props(device: &Arc<CudaDevice>, ordinal: i32) -> Result<DeviceProps> {
    use sys::CUdevice_attribute::*;

    let attribute = |attr| device.attribute(attr).map_err(driver_error("cuDeviceGetAttribute"));
    // SAFETY: the device handle comes from a live primary context.
    let total_memory =
        unsafe { result::device::total_mem(*device.cu_device()) }.map_err(driver_error("cuDeviceTotalMem"))?;

    Ok(DeviceProps {
        name: device.name().map_err(driver_error("cuDeviceGetName"))?,
        ordinal,
        compute_major: attribute(CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?,
        compute_minor: attribute(CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?,
        multiprocessor_count: attribute(CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)?,
        total_memory,
    })
}

struct DriverAllocator {
    device: Arc<CudaDevice>,
    binds: bool,
}

impl ScratchAllocator for DriverAllocator {
    fn allocate(&self, size: usize) -> Result<DevicePtr> {
        activate(&self.device, self.binds)?;
        // SAFETY: a context of this device is current on this thread.
        let ptr = unsafe { result::malloc_sync(size) }.map_err(|err| BackendError::AllocationFailure {
            size,
            space: MemorySpace::Device,
            code: err.0 as i32,
        })?;
        Ok(DevicePtr(ptr))
    }

    fn release(&self, ptr: DevicePtr) {
        let freed = activate(&self.device, self.binds).and_then(|()| {
            // SAFETY: `ptr` came from `malloc_sync` on this device.
            unsafe { result::free_sync(ptr.addr()) }.map_err(driver_error("cuMemFree"))
        });
        if let Err(err) = freed {
            warn!(target: "cudify::device", error = %err, "failed to release scratch memory");
        }
    }
}

impl DeviceContext for CudaContext {
    fn backend(&self) -> BackendKind {
        BackendKind::Cuda
    }

    fn state(&self) -> ContextState {
        self.state
    }

    fn alloc(&self, size: usize, space: MemorySpace) -> Result<DevicePtr> {
        if size == 0 {
            return Ok(DevicePtr::null());
        }
        let Some(bound) = self.bound() else {
            return Ok(DevicePtr::null());
        };
        bound.activate()?;

        let failure = |err: DriverError| BackendError::AllocationFailure {
            size,
            space,
            code: err.0 as i32,
        };
        let (ptr, duration_us) = cudify_tracing::timed_block!("cuda_alloc", {
            // SAFETY: a context of the bound device is current on this thread.
            match space {
                MemorySpace::Device => unsafe { result::malloc_sync(size) }.map_err(failure),
                MemorySpace::HostPinned => {
                    unsafe { result::malloc_host(size, 0) }.map(|p| p as u64).map_err(failure)
                }
            }
        });
        let ptr = ptr?;
        cudify_tracing::performance::record_allocation(size, &space.to_string(), duration_us);
        Ok(DevicePtr(ptr))
    }

    fn free(&self, ptr: DevicePtr, space: MemorySpace) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let Some(bound) = self.bound() else {
            return Ok(());
        };
        bound.activate()?;
        // SAFETY: `ptr` was returned by `alloc` for the same space.
        match space {
            MemorySpace::Device => unsafe { result::free_sync(ptr.addr()) }.map_err(driver_error("cuMemFree")),
            MemorySpace::HostPinned => {
                unsafe { result::free_host(ptr.addr() as *mut c_void) }.map_err(driver_error("cuMemFreeHost"))
            }
        }
    }

    fn synchronize(&self) -> Result<()> {
        let Some(bound) = self.bound() else {
            return Ok(());
        };
        bound.activate()?;
        // SAFETY: the stream belongs to the bound device.
        unsafe { result::stream::synchronize(Self::raw_stream(bound)) }.map_err(driver_error("cuStreamSynchronize"))
    }

    fn event(&self) -> EventHandle {
        self.bound()
            .map(|bound| EventHandle(bound.event as u64))
            .unwrap_or_default()
    }

    fn timer_begin(&mut self) -> Result<()> {
        let Some(bound) = self.bound() else {
            return Ok(());
        };
        bound.activate()?;
        // SAFETY: event and stream belong to the bound device.
        unsafe { result::event::record(bound.timer[0], Self::raw_stream(bound)) }
            .map_err(driver_error("cuEventRecord"))?;
        self.timer_started = true;
        Ok(())
    }

    fn timer_end(&mut self) -> Result<f64> {
        if !self.timer_started {
            debug!(target: "cudify::device", "timer_end without timer_begin");
            return Ok(0.0);
        }
        self.timer_started = false;
        let Some(bound) = self.bound() else {
            return Ok(0.0);
        };
        bound.activate()?;
        let stream = Self::raw_stream(bound);
        // SAFETY: events and stream belong to the bound device.
        let ms = unsafe {
            result::event::record(bound.timer[1], stream).map_err(driver_error("cuEventRecord"))?;
            result::stream::synchronize(stream).map_err(driver_error("cuStreamSynchronize"))?;
            result::event::elapsed(bound.timer[0], bound.timer[1]).map_err(driver_error("cuEventElapsedTime"))?
        };
        Ok(f64::from(ms) / 1.0e3)
    }

    fn device(&self) -> i32 {
        self.bound().map(|_| self.props.ordinal).unwrap_or(0)
    }

    fn device_count(&self) -> i32 {
        self.device_count
    }

    fn props(&self) -> &DeviceProps {
        &self.props
    }

    fn ptx_version(&self) -> i32 {
        self.ptx_version
    }

    fn stream(&self) -> StreamHandle {
        self.bound()
            .map(|bound| StreamHandle(Self::raw_stream(bound) as u64))
            .unwrap_or_default()
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
        if let Some(bound) = self.bound.take() {
            if bound.activate().is_ok() {
                for event in [bound.timer[0], bound.timer[1], bound.event] {
                    // SAFETY: each event was created once in `bind` and is destroyed once here.
                    if let Err(err) = unsafe { result::event::destroy(event) } {
                        warn!(target: "cudify::device", error = %err, "failed to destroy event");
                    }
                }
            }
        }
        self.state = ContextState::Destroyed;
        debug!(target: "cudify::device", backend = "cuda", "device context destroyed");
    }
}

impl Drop for CudaContext {
    fn drop(&mut self) {
        self.destroy();
    }
}
