//! Grow-only workspaces owned by a device context

use std::fmt;
use std::sync::Arc;

use crate::device::DevicePtr;
use crate::error::Result;

/// Backend hook used by device-resident scratch buffers.
pub trait ScratchAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Result<DevicePtr>;

    fn release(&self, ptr: DevicePtr);
}

enum Backing {
    Host(Vec<u8>),
    Device {
        allocator: Arc<dyn ScratchAllocator>,
        ptr: DevicePtr,
        capacity: usize,
    },
}

/// Transient byte workspace. Contents do not survive unrelated users.
pub struct ScratchBuffer {
    backing: Backing,
    len: usize,
}

impl ScratchBuffer {
    /// Host-memory workspace.
    pub fn host() -> Self {
        Self {
            backing: Backing::Host(Vec::new()),
            len: 0,
        }
    }

    /// Workspace allocated through `allocator`.
    pub fn device(allocator: Arc<dyn ScratchAllocator>) -> Self {
        Self {
            backing: Backing::Device {
                allocator,
                ptr: DevicePtr::null(),
                capacity: 0,
            },
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        match &self.backing {
            Backing::Host(bytes) => bytes.len(),
            Backing::Device { capacity, .. } => *capacity,
        }
    }

    /// Set the logical length, growing storage when needed. Storage never shrinks.
    ///
    /// Growing a device workspace discards its previous contents.
    pub fn resize(&mut self, len: usize) -> Result<()> {
        match &mut self.backing {
            Backing::Host(bytes) => {
                if len > bytes.len() {
                    bytes.resize(len, 0);
                }
            }
            Backing::Device {
                allocator,
                ptr,
                capacity,
            } => {
                if len > *capacity {
                    let fresh = allocator.allocate(len)?;
                    if !ptr.is_null() {
                        allocator.release(*ptr);
                    }
                    *ptr = fresh;
                    *capacity = len;
                }
            }
        }
        self.len = len;
        Ok(())
    }

    /// Host view of the first `len()` bytes; `None` for device workspaces.
    pub fn as_host_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.backing {
            Backing::Host(bytes) => Some(&mut bytes[..self.len]),
            Backing::Device { .. } => None,
        }
    }

    /// Base address, null while nothing has been allocated.
    pub fn device_ptr(&self) -> DevicePtr {
        match &self.backing {
            Backing::Host(bytes) if bytes.is_empty() => DevicePtr::null(),
            Backing::Host(bytes) => DevicePtr(bytes.as_ptr() as u64),
            Backing::Device { ptr, .. } => *ptr,
        }
    }

    /// Drop storage, returning to the empty state.
    pub(crate) fn release(&mut self) {
        match &mut self.backing {
            Backing::Host(bytes) => *bytes = Vec::new(),
            Backing::Device {
                allocator,
                ptr,
                capacity,
            } => {
                if !ptr.is_null() {
                    allocator.release(*ptr);
                }
                *ptr = DevicePtr::null();
                *capacity = 0;
            }
        }
        self.len = 0;
    }
}

impl Default for ScratchBuffer {
    fn default() -> Self {
        Self::host()
    }
}

impl Drop for ScratchBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ScratchBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.backing {
            Backing::Host(_) => "host",
            Backing::Device { .. } => "device",
        };
        f.debug_struct("ScratchBuffer")
            .field("backing", &kind)
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}
