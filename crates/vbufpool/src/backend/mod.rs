//! Device backends: the collaborator that owns real device memory.
//!
//! A pool never touches device memory directly. It asks a [`DeviceBackend`]
//! for fixed-size blocks, resolves their device addresses, and moves bytes
//! with synchronous read/write transfers. Two backends ship with the crate:
//!
//! - [`WgpuBackend`] allocates GPU buffers through wgpu.
//! - [`HostBackend`] simulates a device in process memory, with fault
//!   injection for exercising failure paths.

pub mod gpu;
pub mod host;

pub use self::gpu::{DeviceOptions, WgpuBackend};
pub use self::host::{HostBackend, HostBackendOptions};

use std::fmt;

use thiserror::Error;

/// Backend-side identifier for an allocated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoHandle(pub u32);

impl fmt::Display for BoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bo#{}", self.0)
    }
}

/// Placement flags forwarded to [`DeviceBackend::allocate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocFlags {
    /// Memory bank selector, passed through from the pool's `flags`.
    pub bank: u32,
    /// The block is only ever accessed through explicit transfers.
    pub device_only: bool,
}

impl AllocFlags {
    pub fn device_only(bank: u32) -> Self {
        Self {
            bank,
            device_only: true,
        }
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("device out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },

    #[error("unknown block {0}")]
    UnknownBlock(BoHandle),

    #[error("range {offset}..{end} outside block {handle} of {size} bytes")]
    OutOfBounds {
        handle: BoHandle,
        offset: usize,
        end: usize,
        size: usize,
    },

    #[error("device address unavailable for {0}")]
    NoAddress(BoHandle),

    #[error("transfer on {handle} failed: {reason}")]
    Transfer { handle: BoHandle, reason: String },

    #[error("device error: {0}")]
    Device(String),
}

/// Synchronous device memory primitives.
///
/// Every call blocks until the device has finished with the host memory it
/// was given; nothing is left in flight when a method returns.
pub trait DeviceBackend: Send + Sync {
    /// Allocate a block of exactly `size` bytes.
    fn allocate(&self, size: usize, flags: AllocFlags) -> Result<BoHandle, BackendError>;

    /// Device address of a live block.
    fn device_addr(&self, handle: BoHandle) -> Result<u64, BackendError>;

    /// Release a block. The handle is invalid afterwards.
    fn free(&self, handle: BoHandle) -> Result<(), BackendError>;

    /// Copy `src` into the block starting at `offset`.
    fn write(&self, handle: BoHandle, src: &[u8], offset: usize) -> Result<(), BackendError>;

    /// Copy `dst.len()` bytes starting at `offset` out of the block.
    fn read(&self, handle: BoHandle, dst: &mut [u8], offset: usize) -> Result<(), BackendError>;

    /// Host pointer alignment the transfer primitives accept directly.
    fn transfer_alignment(&self) -> usize {
        1
    }
}

/// Whether `ptr` satisfies `align` (a power of two; 0 and 1 accept anything).
pub(crate) fn is_aligned(ptr: *const u8, align: usize) -> bool {
    align <= 1 || (ptr as usize) & (align - 1) == 0
}
