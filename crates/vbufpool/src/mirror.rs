//! Page-aligned host memory shadowing a device buffer.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::error::{PoolError, Result};

pub const PAGE_SIZE: usize = 4096;

/// A zero-filled, page-aligned host region owned by one buffer.
///
/// It stages transfers whose caller memory the backend can't take directly,
/// and doubles as a host-visible view of the buffer.
pub struct HostMirror {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The region is plain bytes owned exclusively by this value.
unsafe impl Send for HostMirror {}
unsafe impl Sync for HostMirror {}

impl HostMirror {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(PoolError::HostAllocation { size });
        }
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|_| PoolError::HostAllocation { size })?;

        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(PoolError::HostAllocation { size })?;

        Ok(Self { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialized bytes for self's lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }

    /// Whether `len` bytes at `ptr` share any byte with this region.
    pub fn overlaps(&self, ptr: *const u8, len: usize) -> bool {
        let start = self.ptr.as_ptr() as usize;
        let addr = ptr as usize;
        len > 0 && addr < start + self.len() && start < addr.saturating_add(len)
    }
}

impl Drop for HostMirror {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for HostMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMirror")
            .field("ptr", &self.ptr)
            .field("len", &self.len())
            .finish()
    }
}
