use thiserror::Error;

use crate::backend::BackendError;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("buffer #{index} allocation failed: {source}")]
    Allocation {
        index: u32,
        #[source]
        source: BackendError,
    },

    #[error("host mirror allocation of {size} bytes failed")]
    HostAllocation { size: usize },

    #[error("pool extension stopped after {added} buffers (total {total}): {source}")]
    PartialExtend {
        added: u32,
        total: u32,
        #[source]
        source: Box<PoolError>,
    },

    #[error("offset index {index} out of range (table holds {len})")]
    OffsetOutOfRange { index: u32, len: usize },

    #[error("buffer index {index} out of range (pool holds {len})")]
    BufferOutOfRange { index: u32, len: usize },

    #[error("transfer of {size} bytes at offset {offset} exceeds buffer size {capacity}")]
    TransferBounds {
        size: usize,
        offset: usize,
        capacity: usize,
    },

    #[error("transfer failed: {0}")]
    Transfer(#[source] BackendError),

    #[error("read from unallocated buffer #{0}")]
    ReadUnallocated(u32),

    #[error("cannot increment refcount of free buffer #{0}")]
    RefcountOnFreeBuffer(u32),

    #[error("refcount of buffer #{0} is saturated")]
    RefcountOverflow(u32),

    #[error("pool creation reference already released")]
    CreationReleased,

    #[error("teardown aborted, pool may leak: {free} free / {in_use} in use / {allocated} allocated")]
    LeakGuard {
        free: usize,
        in_use: usize,
        allocated: usize,
    },

    #[error("pool has been torn down")]
    PoolRetired,

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("No GPU adapter at index {0}")]
    NoDevice(u32),

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("Failed to request GPU device: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),
}

impl PoolError {
    /// Programmer errors: the caller broke the refcount discipline, or the
    /// pool's own bookkeeping no longer adds up.
    pub fn is_logic_error(&self) -> bool {
        matches!(
            self,
            PoolError::RefcountOnFreeBuffer(_)
                | PoolError::RefcountOverflow(_)
                | PoolError::CreationReleased
                | PoolError::LeakGuard { .. }
        )
    }

    /// Pool size after a partially successful extension.
    pub fn extended_total(&self) -> Option<u32> {
        match self {
            PoolError::PartialExtend { total, .. } => Some(*total),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logic_errors_are_classified() {
        assert!(PoolError::RefcountOnFreeBuffer(3).is_logic_error());
        assert!(PoolError::RefcountOverflow(3).is_logic_error());
        assert!(PoolError::CreationReleased.is_logic_error());
        assert!(PoolError::LeakGuard {
            free: 1,
            in_use: 1,
            allocated: 2
        }
        .is_logic_error());
        assert!(!PoolError::PoolRetired.is_logic_error());
        assert!(!PoolError::ReadUnallocated(0).is_logic_error());
    }

    #[test]
    fn partial_extend_reports_total() {
        let err = PoolError::PartialExtend {
            added: 2,
            total: 7,
            source: Box::new(PoolError::HostAllocation { size: 64 }),
        };
        assert_eq!(err.extended_total(), Some(7));
        assert_eq!(PoolError::PoolRetired.extended_total(), None);
        assert!(err.to_string().contains("after 2 buffers"));
    }
}
