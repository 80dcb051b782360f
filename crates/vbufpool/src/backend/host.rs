//! In-process device simulation.
//!
//! Blocks live in ordinary heap memory and are handed synthetic,
//! page-aligned device addresses. Faults can be injected at every step a
//! pool depends on (allocation, address resolution, transfers), which is what
//! the pool's failure-path tests run against.

use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::trace;

use super::{AllocFlags, BackendError, BoHandle, DeviceBackend};

const ADDRESS_ALIGN: u64 = 4096;

#[derive(Debug, Clone)]
pub struct HostBackendOptions {
    /// Host pointer alignment required for direct transfers.
    pub transfer_alignment: usize,
    /// Device address handed to the first block.
    pub base_address: u64,
    /// Total bytes the simulated device can hold.
    pub capacity: Option<usize>,
}

impl Default for HostBackendOptions {
    fn default() -> Self {
        Self {
            transfer_alignment: 4096,
            base_address: 0x1_0000_0000,
            capacity: None,
        }
    }
}

struct HostBlock {
    addr: u64,
    data: Vec<u8>,
    flags: AllocFlags,
}

struct HostState {
    blocks: AHashMap<u32, HostBlock>,
    next_handle: u32,
    next_addr: u64,
    bytes_in_use: usize,
    alloc_budget: Option<usize>,
    fail_addr: bool,
    fail_transfers: bool,
}

/// A [`DeviceBackend`] backed by process memory.
pub struct HostBackend {
    options: HostBackendOptions,
    state: Mutex<HostState>,
    transfers: AtomicU64,
}

impl HostBackend {
    pub fn new(options: HostBackendOptions) -> Self {
        let next_addr = options.base_address;
        Self {
            options,
            state: Mutex::new(HostState {
                blocks: AHashMap::new(),
                // 0 is never handed out so it can't be confused with a null handle.
                next_handle: 1,
                next_addr,
                bytes_in_use: 0,
                alloc_budget: None,
                fail_addr: false,
                fail_transfers: false,
            }),
            transfers: AtomicU64::new(0),
        }
    }

    /// Let `count` more allocations succeed, then fail every one after.
    /// `None` lifts the limit.
    pub fn fail_allocations_after(&self, count: Option<usize>) {
        self.state.lock().alloc_budget = count;
    }

    pub fn fail_address_resolution(&self, fail: bool) {
        self.state.lock().fail_addr = fail;
    }

    pub fn fail_transfers(&self, fail: bool) {
        self.state.lock().fail_transfers = fail;
    }

    /// Blocks allocated and not yet freed.
    pub fn live_blocks(&self) -> usize {
        self.state.lock().blocks.len()
    }

    pub fn bytes_in_use(&self) -> usize {
        self.state.lock().bytes_in_use
    }

    /// Successful read and write transfers so far.
    pub fn transfers(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }

    /// Copy of a block's device-side contents.
    pub fn contents(&self, handle: BoHandle) -> Option<Vec<u8>> {
        self.state
            .lock()
            .blocks
            .get(&handle.0)
            .map(|block| block.data.clone())
    }

    /// Flags a block was allocated with.
    pub fn flags(&self, handle: BoHandle) -> Option<AllocFlags> {
        self.state.lock().blocks.get(&handle.0).map(|block| block.flags)
    }

    fn check_range(
        handle: BoHandle,
        block: &HostBlock,
        offset: usize,
        len: usize,
    ) -> Result<std::ops::Range<usize>, BackendError> {
        let end = offset.checked_add(len).unwrap_or(usize::MAX);
        if end > block.data.len() {
            return Err(BackendError::OutOfBounds {
                handle,
                offset,
                end,
                size: block.data.len(),
            });
        }
        Ok(offset..end)
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new(HostBackendOptions::default())
    }
}

impl DeviceBackend for HostBackend {
    fn allocate(&self, size: usize, flags: AllocFlags) -> Result<BoHandle, BackendError> {
        let mut state = self.state.lock();

        if let Some(budget) = state.alloc_budget.as_mut() {
            if *budget == 0 {
                return Err(BackendError::OutOfMemory { size });
            }
            *budget -= 1;
        }
        if let Some(capacity) = self.options.capacity {
            if state.bytes_in_use + size > capacity {
                return Err(BackendError::OutOfMemory { size });
            }
        }

        let handle = BoHandle(state.next_handle);
        state.next_handle += 1;

        let addr = state.next_addr;
        let span = (size as u64).max(1).div_ceil(ADDRESS_ALIGN) * ADDRESS_ALIGN;
        state.next_addr += span;
        state.bytes_in_use += size;

        state.blocks.insert(
            handle.0,
            HostBlock {
                addr,
                data: vec![0; size],
                flags,
            },
        );
        trace!(%handle, addr, size, "host block allocated");
        Ok(handle)
    }

    fn device_addr(&self, handle: BoHandle) -> Result<u64, BackendError> {
        let state = self.state.lock();
        if state.fail_addr {
            return Err(BackendError::NoAddress(handle));
        }
        state
            .blocks
            .get(&handle.0)
            .map(|block| block.addr)
            .ok_or(BackendError::UnknownBlock(handle))
    }

    fn free(&self, handle: BoHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let block = state
            .blocks
            .remove(&handle.0)
            .ok_or(BackendError::UnknownBlock(handle))?;
        state.bytes_in_use -= block.data.len();
        trace!(%handle, "host block freed");
        Ok(())
    }

    fn write(&self, handle: BoHandle, src: &[u8], offset: usize) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.fail_transfers {
            return Err(BackendError::Transfer {
                handle,
                reason: "injected write failure".into(),
            });
        }
        let block = state
            .blocks
            .get_mut(&handle.0)
            .ok_or(BackendError::UnknownBlock(handle))?;
        let range = Self::check_range(handle, block, offset, src.len())?;
        block.data[range].copy_from_slice(src);
        self.transfers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read(&self, handle: BoHandle, dst: &mut [u8], offset: usize) -> Result<(), BackendError> {
        let state = self.state.lock();
        if state.fail_transfers {
            return Err(BackendError::Transfer {
                handle,
                reason: "injected read failure".into(),
            });
        }
        let block = state
            .blocks
            .get(&handle.0)
            .ok_or(BackendError::UnknownBlock(handle))?;
        let range = Self::check_range(handle, block, offset, dst.len())?;
        dst.copy_from_slice(&block.data[range]);
        self.transfers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn transfer_alignment(&self) -> usize {
        self.options.transfer_alignment
    }
}
