use crate::error::{PoolError, Result};

/// Shape of a pool: how many buffers, how large, and where on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Buffers allocated up front.
    pub buffer_count: u32,
    /// Bytes per buffer. Identical for every buffer in the pool.
    pub buffer_size: usize,
    /// Backend placement flags (memory bank).
    pub flags: u32,
}

impl PoolConfig {
    pub fn new(buffer_count: u32, buffer_size: usize) -> Self {
        Self {
            buffer_count,
            buffer_size,
            ..Default::default()
        }
    }

    pub fn with_count(mut self, buffer_count: u32) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    pub fn with_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(PoolError::InvalidConfig(
                "buffer_size must be greater than zero".into(),
            ));
        }
        if self.buffer_size > isize::MAX as usize {
            return Err(PoolError::InvalidConfig(format!(
                "buffer_size {} exceeds the host address space",
                self.buffer_size
            )));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    /// Four 1080p NV12 frames.
    fn default() -> Self {
        Self {
            buffer_count: 4,
            buffer_size: 1920 * 1080 * 3 / 2,
            flags: 0,
        }
    }
}
