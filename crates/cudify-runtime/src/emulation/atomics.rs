//! Emulated atomic read-modify-write.
//!
//! Inside one block only one simulated thread runs at a time, so a plain
//! read-modify-write on [`DeviceBuffer`] cannot lose updates there. Blocks on
//! different workers must not target the same element through these
//! operations; nothing checks this.

use std::cell::Cell;

use crate::emulation::memory::DeviceBuffer;

/// Per-thread record of the last emulated atomic results.
#[derive(Debug, Default)]
pub struct AtomicScratch {
    add: Cell<i32>,
    rem: Cell<i32>,
}

impl AtomicScratch {
    pub const fn new() -> Self {
        Self {
            add: Cell::new(0),
            rem: Cell::new(0),
        }
    }

    /// Previous value returned by the last [`atomic_add`].
    pub fn add(&self) -> i32 {
        self.add.get()
    }

    /// Previous value returned by the last [`atomic_sub`].
    pub fn rem(&self) -> i32 {
        self.rem.get()
    }
}

/// Add `value` to `buffer[index]` and return the previous value.
pub fn atomic_add(scratch: &AtomicScratch, buffer: &DeviceBuffer<i32>, index: usize, value: i32) -> i32 {
    let old = buffer.update(index, |v| v.wrapping_add(value));
    scratch.add.set(old);
    old
}

/// Subtract `value` from `buffer[index]` and return the previous value.
pub fn atomic_sub(scratch: &AtomicScratch, buffer: &DeviceBuffer<i32>, index: usize, value: i32) -> i32 {
    let old = buffer.update(index, |v| v.wrapping_sub(value));
    scratch.rem.set(old);
    old
}
