use std::fmt;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::backend::{is_aligned, BackendError, BoHandle, DeviceBackend};
use crate::error::{PoolError, Result};
use crate::mirror::HostMirror;
use crate::pool::{BufferPool, PoolShared, Release};

/// Dense per-pool buffer identity, assigned in creation order.
pub type BufferId = u32;

/// One device block plus its host mirror.
///
/// `refcnt` is only ever changed under the owning pool's lock. `mirror` is
/// the per-buffer transfer lock: it serializes reads against allocation-time
/// refcount changes, and guards the mirror as a staging area. It says nothing
/// about the consistency of buffer contents between concurrent holders.
pub(crate) struct Buffer {
    id: BufferId,
    size: usize,
    bo: BoHandle,
    paddr: u64,
    host_addr: usize,
    refcnt: AtomicU32,
    /// `None` once the pool has been torn down.
    mirror: Mutex<Option<HostMirror>>,
}

impl Buffer {
    pub(crate) fn new(id: BufferId, bo: BoHandle, paddr: u64, mirror: HostMirror) -> Self {
        Self {
            id,
            size: mirror.len(),
            bo,
            paddr,
            host_addr: mirror.as_ptr() as usize,
            refcnt: AtomicU32::new(0),
            mirror: Mutex::new(Some(mirror)),
        }
    }

    pub(crate) fn id(&self) -> BufferId {
        self.id
    }

    pub(crate) fn paddr(&self) -> u64 {
        self.paddr
    }

    pub(crate) fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Caller holds the pool lock.
    pub(crate) fn set_refcnt(&self, value: u32) {
        self.refcnt.store(value, Ordering::Release);
    }

    /// First allocation of a free buffer: refcount 0 -> 1, ordered against
    /// any read in flight on this buffer. Caller holds the pool lock.
    pub(crate) fn activate(&self) {
        let _transfer = self.mirror.lock();
        self.set_refcnt(1);
    }

    fn check_bounds(&self, size: usize, offset: usize) -> Result<()> {
        match size.checked_add(offset) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(PoolError::TransferBounds {
                size,
                offset,
                capacity: self.size,
            }),
        }
    }

    /// Start of the mirror range a transfer at `offset` maps to.
    fn window(mirror: &HostMirror, offset: usize) -> *mut u8 {
        // SAFETY: callers bounds-check first, so `offset <= mirror.len()`.
        unsafe { mirror.as_ptr().add(offset) }
    }

    pub(crate) fn write(&self, backend: &dyn DeviceBackend, src: &[u8], offset: usize) -> Result<()> {
        self.check_bounds(src.len(), offset)?;
        let guard = self.mirror.lock();
        let mirror = guard.as_ref().ok_or(PoolError::PoolRetired)?;
        let window = Self::window(mirror, offset);

        let result = if ptr::eq(src.as_ptr(), window)
            || is_aligned(src.as_ptr(), backend.transfer_alignment())
        {
            // Either the mirror range itself or memory the backend takes as is.
            backend.write(self.bo, src, offset)
        } else if mirror.overlaps(src.as_ptr(), src.len()) {
            let mut scratch = HostMirror::new(src.len())?;
            scratch.as_mut_slice().copy_from_slice(src);
            backend.write(self.bo, scratch.as_slice(), offset)
        } else {
            // SAFETY: the range is inside the mirror, the transfer lock is
            // held, and `src` lies outside the mirror.
            let staged = unsafe {
                ptr::copy_nonoverlapping(src.as_ptr(), window, src.len());
                slice::from_raw_parts(window, src.len())
            };
            backend.write(self.bo, staged, offset)
        };
        result.map_err(|e| self.transfer_failed("write", e))
    }

    /// Write `size` bytes of the mirror, starting at `offset`, to the same
    /// range on the device.
    pub(crate) fn flush_mirror(
        &self,
        backend: &dyn DeviceBackend,
        size: usize,
        offset: usize,
    ) -> Result<()> {
        self.check_bounds(size, offset)?;
        let guard = self.mirror.lock();
        let mirror = guard.as_ref().ok_or(PoolError::PoolRetired)?;
        backend
            .write(self.bo, &mirror.as_slice()[offset..offset + size], offset)
            .map_err(|e| self.transfer_failed("write", e))
    }

    pub(crate) fn read(&self, backend: &dyn DeviceBackend, dst: &mut [u8], offset: usize) -> Result<()> {
        self.check_bounds(dst.len(), offset)?;
        let guard = self.mirror.lock();
        let mirror = guard.as_ref().ok_or(PoolError::PoolRetired)?;
        if self.refcnt() == 0 {
            return Err(PoolError::ReadUnallocated(self.id));
        }
        let len = dst.len();
        let window = Self::window(mirror, offset);

        let result = if ptr::eq(dst.as_ptr(), window)
            || is_aligned(dst.as_ptr(), backend.transfer_alignment())
        {
            backend.read(self.bo, dst, offset)
        } else if mirror.overlaps(dst.as_ptr(), len) {
            let mut scratch = HostMirror::new(len)?;
            backend
                .read(self.bo, scratch.as_mut_slice(), offset)
                .map(|()| dst.copy_from_slice(scratch.as_slice()))
        } else {
            // SAFETY: as in `write`; `dst` lies outside the mirror.
            let staged = unsafe { slice::from_raw_parts_mut(window, len) };
            backend
                .read(self.bo, staged, offset)
                .map(|()| dst.copy_from_slice(staged))
        };
        result.map_err(|e| self.transfer_failed("read", e))
    }

    /// Read `size` bytes at `offset` from the device into the same range of
    /// the mirror.
    pub(crate) fn fetch_mirror(
        &self,
        backend: &dyn DeviceBackend,
        size: usize,
        offset: usize,
    ) -> Result<()> {
        self.check_bounds(size, offset)?;
        let mut guard = self.mirror.lock();
        let mirror = guard.as_mut().ok_or(PoolError::PoolRetired)?;
        if self.refcnt() == 0 {
            return Err(PoolError::ReadUnallocated(self.id));
        }
        backend
            .read(self.bo, &mut mirror.as_mut_slice()[offset..offset + size], offset)
            .map_err(|e| self.transfer_failed("read", e))
    }

    pub(crate) fn with_mirror<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut guard = self.mirror.lock();
        let mirror = guard.as_mut().ok_or(PoolError::PoolRetired)?;
        Ok(f(mirror.as_mut_slice()))
    }

    /// Drop the mirror and hand the block back to the backend. Runs once, at
    /// teardown.
    pub(crate) fn release_resources(&self, backend: &dyn DeviceBackend) -> std::result::Result<(), BackendError> {
        let mut guard = self.mirror.lock();
        guard.take();
        backend.free(self.bo)
    }

    fn transfer_failed(&self, op: &str, err: BackendError) -> PoolError {
        warn!(buffer = self.id, bo = %self.bo, "{op} transfer failed: {err}");
        PoolError::Transfer(err)
    }
}

/// A reference to one buffer of a pool.
///
/// Cloning a handle does not touch the buffer's refcount; refcounting is
/// explicit through [`refcnt_inc`](Self::refcnt_inc) and
/// [`release`](Self::release). Handles outlive teardown safely: metadata stays
/// readable and everything else reports [`PoolError::PoolRetired`].
#[derive(Clone)]
pub struct BufferHandle {
    pool: Arc<PoolShared>,
    buffer: Arc<Buffer>,
}

impl BufferHandle {
    pub(crate) fn new(pool: Arc<PoolShared>, buffer: Arc<Buffer>) -> Self {
        Self { pool, buffer }
    }

    pub fn id(&self) -> BufferId {
        self.buffer.id
    }

    pub fn size(&self) -> usize {
        self.buffer.size
    }

    pub fn bo_handle(&self) -> BoHandle {
        self.buffer.bo
    }

    pub fn paddr(&self) -> u64 {
        self.buffer.paddr()
    }

    /// Start of the host mirror. Valid until the pool is torn down; prefer
    /// [`with_host_mirror`](Self::with_host_mirror) from Rust.
    pub fn host_ptr(&self) -> *mut u8 {
        self.buffer.host_addr as *mut u8
    }

    pub fn refcnt(&self) -> u32 {
        self.buffer.refcnt()
    }

    /// Add a reference to a buffer that is already allocated.
    ///
    /// Incrementing a free buffer is a logic error
    /// ([`PoolError::RefcountOnFreeBuffer`]); the refcount is left at 0.
    pub fn refcnt_inc(&self) -> Result<u32> {
        self.pool.refcnt_inc(&self.buffer)
    }

    /// Drop one reference. See [`Release`] for the outcomes.
    pub fn release(&self) -> Result<Release> {
        self.pool.release(&self.buffer)
    }

    /// Drop one reference, finishing any teardown it triggers.
    ///
    /// True only when this call returned the buffer to the free set.
    pub fn free(&self) -> Result<bool> {
        let release = self.release()?;
        let returned = release.returned();
        if let Release::Retired(teardown) = release {
            teardown.finish();
        }
        Ok(returned)
    }

    /// Copy `src` to the device at `offset`.
    ///
    /// Caller memory the backend can't take directly is staged through the
    /// host mirror.
    pub fn write(&self, src: &[u8], offset: usize) -> Result<()> {
        self.buffer.write(self.pool.backend(), src, offset)?;
        trace!(buffer = self.id(), len = src.len(), offset, "buffer written");
        Ok(())
    }

    /// Copy `dst.len()` bytes at `offset` from the device.
    ///
    /// The buffer must be allocated ([`PoolError::ReadUnallocated`]
    /// otherwise).
    pub fn read(&self, dst: &mut [u8], offset: usize) -> Result<()> {
        self.buffer.read(self.pool.backend(), dst, offset)?;
        trace!(buffer = self.id(), len = dst.len(), offset, "buffer read");
        Ok(())
    }

    /// Write a range of the host mirror to the same range on the device.
    pub fn flush_mirror(&self, size: usize, offset: usize) -> Result<()> {
        self.buffer.flush_mirror(self.pool.backend(), size, offset)
    }

    /// Read a range of the device buffer into the same range of the mirror.
    pub fn fetch_mirror(&self, size: usize, offset: usize) -> Result<()> {
        self.buffer.fetch_mirror(self.pool.backend(), size, offset)
    }

    /// Run `f` on the host mirror under the buffer's transfer lock.
    ///
    /// The lock is not reentrant. Inside `f`, any transfer on this buffer
    /// (`write`, `read`, `flush_mirror`, `fetch_mirror`, or another
    /// `with_host_mirror`) deadlocks, and so does any call into this buffer's
    /// pool, including a `free()` that would tear the pool down.
    pub fn with_host_mirror<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.buffer.with_mirror(f)
    }

    /// The pool this buffer belongs to.
    pub fn pool(&self) -> BufferPool {
        BufferPool::from_shared(Arc::clone(&self.pool))
    }

    /// Entry `index` of the pool's offset table.
    pub fn offset(&self, index: u32) -> Result<u32> {
        self.pool().offset(index)
    }

    /// Grow this buffer's pool; see [`BufferPool::extend`].
    pub fn extend_pool(&self, additional: u32) -> Result<u32> {
        self.pool().extend(additional)
    }

    pub fn pool_num_buffers(&self) -> u32 {
        self.pool().num_buffers()
    }
}

impl PartialEq for BufferHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.pool, &other.pool) && self.buffer.id == other.buffer.id
    }
}

impl Eq for BufferHandle {}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("id", &self.buffer.id)
            .field("bo", &self.buffer.bo)
            .field("paddr", &format_args!("{:#x}", self.buffer.paddr))
            .field("size", &self.buffer.size)
            .field("refcnt", &self.refcnt())
            .finish()
    }
}
