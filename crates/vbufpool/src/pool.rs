//! Pools of fixed-size device buffers with explicit reference counting.
//!
//! A pool keeps itself alive through an outstanding-reference counter: one
//! reference for its creator plus one per buffer currently in use. When the
//! counter drops to zero the pool retires. Retirement is a state transition
//! that yields a [`Teardown`] token, and finishing the token is what
//! actually gives memory back to the device backend.
//!
//! Lock order is pool lock, then a buffer's transfer lock. Transfers take
//! only the buffer lock.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::backend::{AllocFlags, BackendError, BoHandle, DeviceBackend, WgpuBackend};
use crate::buffer::{Buffer, BufferHandle, BufferId};
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::index::AddressIndex;
use crate::lists::BufferLists;
use crate::mirror::HostMirror;
use crate::offsets::OffsetTable;

struct PoolState {
    /// Buffers the pool is supposed to hold; grows with `extend`.
    requested: u32,
    /// Creation reference (if held) plus one per in-use buffer.
    outstanding: u32,
    creation_held: bool,
    retired: bool,
    offsets: OffsetTable,
    /// Allocation sequence, indexed by `BufferId`.
    buffers: Vec<Arc<Buffer>>,
    index: AddressIndex,
    lists: BufferLists,
}

impl PoolState {
    fn new(requested: u32) -> Self {
        Self {
            requested,
            outstanding: 1,
            creation_held: true,
            retired: false,
            offsets: OffsetTable::default(),
            buffers: Vec::new(),
            index: AddressIndex::default(),
            lists: BufferLists::default(),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.retired {
            return Err(PoolError::PoolRetired);
        }
        Ok(())
    }
}

pub(crate) struct PoolShared {
    backend: Arc<dyn DeviceBackend>,
    buffer_size: usize,
    flags: u32,
    state: Mutex<PoolState>,
}

impl PoolShared {
    pub(crate) fn backend(&self) -> &dyn DeviceBackend {
        &*self.backend
    }

    /// Create the next buffer in sequence and seed it at the free tail.
    ///
    /// Nothing becomes visible in the pool unless every step succeeds, and
    /// whatever was acquired before a failing step is released.
    fn create_buffer(&self, state: &mut PoolState) -> Result<()> {
        let index = state.buffers.len() as BufferId;
        let size = self.buffer_size;

        let mirror = HostMirror::new(size)?;

        let bo = self
            .backend
            .allocate(size, AllocFlags::device_only(self.flags))
            .map_err(|source| PoolError::Allocation { index, source })?;

        let paddr = match self.backend.device_addr(bo) {
            Ok(paddr) => paddr,
            Err(source) => {
                self.free_block(bo);
                return Err(PoolError::Allocation { index, source });
            }
        };

        let buffer = Buffer::new(index, bo, paddr, mirror);

        // Establish a known device-side state through the regular write path.
        if let Err(err) = buffer.flush_mirror(&*self.backend, size, 0) {
            self.free_block(bo);
            return Err(match err {
                PoolError::Transfer(source) => PoolError::Allocation { index, source },
                other => other,
            });
        }

        if !state.index.insert(paddr, index) {
            self.free_block(bo);
            return Err(PoolError::Allocation {
                index,
                source: BackendError::Device(format!("duplicate device address {paddr:#x}")),
            });
        }

        state.buffers.push(Arc::new(buffer));
        state.lists.push_new(index);
        trace!(buffer = index, %bo, paddr, size, "buffer created");
        Ok(())
    }

    fn free_block(&self, bo: BoHandle) {
        if let Err(err) = self.backend.free(bo) {
            warn!(%bo, "failed to release block: {err}");
        }
    }

    pub(crate) fn refcnt_inc(&self, buffer: &Buffer) -> Result<u32> {
        let state = self.state.lock();
        state.ensure_live()?;

        let current = buffer.refcnt();
        if current == 0 {
            error!(buffer = buffer.id(), "refcount increment on a free buffer");
            return Err(PoolError::RefcountOnFreeBuffer(buffer.id()));
        }
        let Some(next) = current.checked_add(1) else {
            error!(buffer = buffer.id(), "refcount increment overflows");
            return Err(PoolError::RefcountOverflow(buffer.id()));
        };
        buffer.set_refcnt(next);
        trace!(buffer = buffer.id(), refcnt = next, "buffer referenced");
        Ok(next)
    }

    pub(crate) fn release(&self, buffer: &Buffer) -> Result<Release> {
        let mut state = self.state.lock();

        let current = buffer.refcnt();
        if current == 0 {
            trace!(buffer = buffer.id(), "release of a free buffer ignored");
            return Ok(Release::AlreadyFree);
        }

        let remaining = current - 1;
        buffer.set_refcnt(remaining);
        if remaining > 0 {
            trace!(buffer = buffer.id(), refcnt = remaining, "buffer still held");
            return Ok(Release::Held { refcnt: remaining });
        }

        if !state.lists.give_back(buffer.id()) {
            error!(buffer = buffer.id(), "referenced buffer missing from the in-use set");
            return Ok(Release::AlreadyFree);
        }
        state.outstanding -= 1;
        trace!(buffer = buffer.id(), outstanding = state.outstanding, "buffer returned");

        if state.outstanding > 0 {
            return Ok(Release::Returned);
        }
        self.retire(&mut state).map(Release::Retired)
    }

    /// Leak guard, then retirement. On a failed check nothing is released and
    /// the pool stays as it is.
    fn retire(&self, state: &mut PoolState) -> Result<Teardown> {
        let allocated = state.buffers.len();
        if !state.lists.is_quiescent(allocated) {
            let (free, in_use) = (state.lists.free_len(), state.lists.in_use_len());
            error!(free, in_use, allocated, "pool teardown aborted, pool may leak");
            return Err(PoolError::LeakGuard {
                free,
                in_use,
                allocated,
            });
        }

        state.retired = true;
        state.index.clear();
        state.lists.clear();
        let buffers = std::mem::take(&mut state.buffers);
        debug!(buffers = buffers.len(), "pool retired");
        Ok(Teardown::new(Arc::clone(&self.backend), buffers))
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.retired || state.buffers.is_empty() {
            return;
        }
        warn!(
            buffers = state.buffers.len(),
            "pool dropped without teardown, releasing its blocks"
        );
        let buffers = std::mem::take(&mut state.buffers);
        Teardown::new(Arc::clone(&self.backend), buffers).finish();
    }
}

/// Outcome of dropping one buffer reference.
#[must_use]
#[derive(Debug)]
pub enum Release {
    /// Other references remain.
    Held { refcnt: u32 },
    /// The buffer was already free; nothing changed.
    AlreadyFree,
    /// The buffer went back to the free set.
    Returned,
    /// The buffer went back to the free set and that was the pool's last
    /// outstanding reference.
    Retired(Teardown),
}

impl Release {
    /// Whether this call moved the buffer to the free set.
    pub fn returned(&self) -> bool {
        matches!(self, Release::Returned | Release::Retired(_))
    }

    pub fn into_teardown(self) -> Option<Teardown> {
        match self {
            Release::Retired(teardown) => Some(teardown),
            _ => None,
        }
    }
}

/// Backend resources of a retired pool, waiting to be released.
///
/// Dropping an unfinished token releases them too.
#[must_use = "a teardown releases device memory only when finished or dropped"]
pub struct Teardown {
    backend: Arc<dyn DeviceBackend>,
    buffers: Vec<Arc<Buffer>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Buffers whose mirror and block were released.
    pub buffers: usize,
    /// Blocks the backend refused to free.
    pub backend_failures: usize,
}

impl Teardown {
    fn new(backend: Arc<dyn DeviceBackend>, buffers: Vec<Arc<Buffer>>) -> Self {
        Self { backend, buffers }
    }

    /// Buffers this teardown will release.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn finish(mut self) -> TeardownReport {
        self.release()
    }

    fn release(&mut self) -> TeardownReport {
        let buffers = std::mem::take(&mut self.buffers);
        let mut report = TeardownReport {
            buffers: buffers.len(),
            backend_failures: 0,
        };
        for buffer in buffers {
            if let Err(err) = buffer.release_resources(&*self.backend) {
                warn!(buffer = buffer.id(), "failed to release block: {err}");
                report.backend_failures += 1;
            }
        }
        debug!(
            buffers = report.buffers,
            failures = report.backend_failures,
            "pool resources released"
        );
        report
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            self.release();
        }
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown")
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

/// Point-in-time counters, read under the pool lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers in the allocation sequence.
    pub total: usize,
    pub free: usize,
    pub in_use: usize,
    /// Creation reference plus in-use buffers.
    pub outstanding: u32,
    /// Recorded buffer count.
    pub requested: u32,
    pub retired: bool,
}

/// A pool of equally sized device buffers.
///
/// Cloning yields another handle to the same pool. The pool carries a single
/// creation reference, released by [`destroy`](Self::destroy); it retires once
/// that reference and every buffer reference are gone.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Allocate `config.buffer_count` buffers from `backend`, all free.
    ///
    /// All or nothing: if any buffer fails, those already created are
    /// released and the error is returned.
    pub fn create(backend: Arc<dyn DeviceBackend>, config: &PoolConfig) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(PoolShared {
            backend,
            buffer_size: config.buffer_size,
            flags: config.flags,
            state: Mutex::new(PoolState::new(config.buffer_count)),
        });

        {
            let mut state = shared.state.lock();
            for _ in 0..config.buffer_count {
                if let Err(err) = shared.create_buffer(&mut state) {
                    error!(
                        created = state.buffers.len(),
                        requested = config.buffer_count,
                        "failed to create pool: {err}"
                    );
                    state.retired = true;
                    let buffers = std::mem::take(&mut state.buffers);
                    drop(state);
                    Teardown::new(Arc::clone(&shared.backend), buffers).finish();
                    return Err(err);
                }
            }
        }

        debug!(
            buffers = config.buffer_count,
            size = config.buffer_size,
            flags = config.flags,
            "pool created"
        );
        Ok(Self { shared })
    }

    /// Open the `device_id`-th GPU adapter and create a pool on it.
    pub fn create_by_device_id(device_id: u32, config: &PoolConfig) -> Result<Self> {
        let backend = WgpuBackend::open(device_id)?;
        Self::create(Arc::new(backend), config)
    }

    pub(crate) fn from_shared(shared: Arc<PoolShared>) -> Self {
        Self { shared }
    }

    /// Append entries to the pool's offset table.
    pub fn set_offsets(&self, offsets: &[u32]) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.ensure_live()?;
        state.offsets.extend_from_slice(offsets);
        Ok(())
    }

    pub fn offset(&self, index: u32) -> Result<u32> {
        self.shared.state.lock().offsets.get(index)
    }

    /// Create `additional` more buffers and return the new total.
    ///
    /// Not all or nothing: if creation fails partway, the buffers made so far
    /// stay in the pool and the error ([`PoolError::PartialExtend`]) carries
    /// the resulting total.
    pub fn extend(&self, additional: u32) -> Result<u32> {
        let mut state = self.shared.state.lock();
        state.ensure_live()?;

        let mut added = 0;
        let mut failure = None;
        for _ in 0..additional {
            if let Err(err) = self.shared.create_buffer(&mut state) {
                failure = Some(err);
                break;
            }
            added += 1;
        }

        state.requested += added;
        let total = state.requested;
        match failure {
            None => {
                debug!(added, total, "pool extended");
                Ok(total)
            }
            Some(source) => {
                warn!(added, total, requested = additional, "pool extension incomplete: {source}");
                Err(PoolError::PartialExtend {
                    added,
                    total,
                    source: Box::new(source),
                })
            }
        }
    }

    pub fn num_buffers(&self) -> u32 {
        self.shared.state.lock().requested
    }

    /// Take the longest-free buffer, or `None` if every buffer is in use.
    pub fn alloc(&self) -> Result<Option<BufferHandle>> {
        let mut state = self.shared.state.lock();
        state.ensure_live()?;

        let Some(id) = state.lists.take_free() else {
            trace!("pool exhausted");
            return Ok(None);
        };
        let buffer = Arc::clone(&state.buffers[id as usize]);
        buffer.activate();
        state.outstanding += 1;
        trace!(buffer = id, outstanding = state.outstanding, "buffer allocated");

        Ok(Some(BufferHandle::new(Arc::clone(&self.shared), buffer)))
    }

    /// Release the creation reference.
    ///
    /// Returns the teardown when no buffer is still in use; otherwise the pool
    /// retires when its last buffer is released. Releasing twice is a logic
    /// error.
    pub fn destroy(&self) -> Result<Option<Teardown>> {
        let mut state = self.shared.state.lock();
        if !state.creation_held {
            error!("pool creation reference released twice");
            return Err(PoolError::CreationReleased);
        }
        state.creation_held = false;
        state.outstanding -= 1;

        if state.outstanding > 0 {
            debug!(
                in_use = state.lists.in_use_len(),
                "pool teardown deferred until buffers are released"
            );
            return Ok(None);
        }
        self.shared.retire(&mut state).map(Some)
    }

    /// Buffer `index` of the allocation sequence, free or not.
    pub fn buffer(&self, index: u32) -> Result<BufferHandle> {
        let state = self.shared.state.lock();
        state.ensure_live()?;
        let buffer = state
            .buffers
            .get(index as usize)
            .ok_or(PoolError::BufferOutOfRange {
                index,
                len: state.buffers.len(),
            })?;
        Ok(BufferHandle::new(Arc::clone(&self.shared), Arc::clone(buffer)))
    }

    /// Buffer whose device address is `paddr`, free or not.
    pub fn buffer_by_paddr(&self, paddr: u64) -> Option<BufferHandle> {
        let state = self.shared.state.lock();
        let id = state.index.get(paddr)?;
        let buffer = Arc::clone(&state.buffers[id as usize]);
        Some(BufferHandle::new(Arc::clone(&self.shared), buffer))
    }

    pub fn free_count(&self) -> usize {
        self.shared.state.lock().lists.free_len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            total: state.buffers.len(),
            free: state.lists.free_len(),
            in_use: state.lists.in_use_len(),
            outstanding: state.outstanding,
            requested: state.requested,
            retired: state.retired,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    pub fn flags(&self) -> u32 {
        self.shared.flags
    }

    pub fn is_retired(&self) -> bool {
        self.shared.state.lock().retired
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.shared.backend
    }

    /// Whether both handles refer to the same pool.
    pub fn same_pool(&self, other: &BufferPool) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.shared.buffer_size)
            .field("flags", &self.shared.flags)
            .field("stats", &self.stats())
            .finish()
    }
}
