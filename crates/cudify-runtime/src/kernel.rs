//! Register-style accessors for kernel bodies.
//!
//! These resolve the simulated thread running on the current OS thread, so a
//! kernel can be written without threading its [`ThreadCtx`] through every
//! helper:
//!
//! ```rust
//! use cudify_runtime::kernel::{block_dim, block_idx, sync_threads, thread_idx};
//! use cudify_runtime::{DeviceBuffer, Emulator, LaunchConfig, RuntimeConfig};
//!
//! fn body(out: &DeviceBuffer<u32>) {
//!     let i = (block_idx().x * block_dim().x + thread_idx().x) as usize;
//!     sync_threads();
//!     out.set(i, i as u32);
//! }
//!
//! let emulator = Emulator::new(RuntimeConfig::default().with_workers(1)).unwrap();
//! let out = DeviceBuffer::zeroed(8);
//! emulator.launch(&LaunchConfig::linear(8, 4), |_| body(&out)).unwrap();
//! assert_eq!(out.to_vec(), (0..8).collect::<Vec<u32>>());
//! ```
//!
//! Outside a kernel body the coordinate getters return [`Dim3::ZERO`],
//! [`sync_threads`] does nothing and the atomics are plain read-modify-writes.
//!
//! [`ThreadCtx`]: crate::ThreadCtx

use crate::emulation::coords;
use crate::emulation::memory::DeviceBuffer;
use crate::launch::Dim3;

fn coordinate(read: impl FnOnce(&crate::ThreadCtx) -> Dim3) -> Dim3 {
    coords::current().map(|ctx| read(&ctx)).unwrap_or(Dim3::ZERO)
}

/// `threadIdx`
pub fn thread_idx() -> Dim3 {
    coordinate(|ctx| ctx.thread_idx())
}

/// `blockIdx`
pub fn block_idx() -> Dim3 {
    coordinate(|ctx| ctx.block_idx())
}

/// `blockDim`
pub fn block_dim() -> Dim3 {
    coordinate(|ctx| ctx.block_dim())
}

/// `gridDim`
pub fn grid_dim() -> Dim3 {
    coordinate(|ctx| ctx.grid_dim())
}

/// `__syncthreads()`. See [`ThreadCtx::sync_threads`](crate::ThreadCtx::sync_threads).
pub fn sync_threads() {
    if let Some(ctx) = coords::current() {
        ctx.sync_threads();
    }
}

/// `atomicAdd` on emulated memory; returns the previous value.
pub fn atomic_add(buffer: &DeviceBuffer<i32>, index: usize, value: i32) -> i32 {
    match coords::current() {
        Some(ctx) => ctx.atomic_add(buffer, index, value),
        None => buffer.update(index, |v| v.wrapping_add(value)),
    }
}

/// `atomicSub` on emulated memory; returns the previous value.
pub fn atomic_sub(buffer: &DeviceBuffer<i32>, index: usize, value: i32) -> i32 {
    match coords::current() {
        Some(ctx) => ctx.atomic_sub(buffer, index, value),
        None => buffer.update(index, |v| v.wrapping_sub(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_side_defaults() {
        assert_eq!(thread_idx(), Dim3::ZERO);
        assert_eq!(grid_dim(), Dim3::ZERO);
        sync_threads();

        let buf = DeviceBuffer::from_slice(&[5]);
        assert_eq!(atomic_add(&buf, 0, 2), 5);
        assert_eq!(atomic_sub(&buf, 0, 1), 7);
        assert_eq!(buf.get(0), 6);
    }
}
