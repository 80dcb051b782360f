//! # vbufpool
//!
//! Pools of fixed-size device buffers shared between host code and an
//! accelerator, with explicit per-buffer reference counting.
//!
//! ```no_run
//! use std::sync::Arc;
//! use vbufpool::{BufferPool, HostBackend, PoolConfig};
//!
//! # fn example() -> vbufpool::Result<()> {
//! let backend = Arc::new(HostBackend::default());
//! let pool = BufferPool::create(backend, &PoolConfig::new(4, 1 << 20))?;
//!
//! if let Some(frame) = pool.alloc()? {
//!     frame.write(&[0x80; 4096], 0)?;
//!     frame.refcnt_inc()?; // shared with a second consumer
//!
//!     frame.free()?;
//!     frame.free()?; // back in the free set
//! }
//!
//! // The pool's memory goes back to the device once the creation
//! // reference and every buffer reference are released.
//! if let Some(teardown) = pool.destroy()? {
//!     teardown.finish();
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod buffer;
pub mod config;
pub mod error;
mod index;
mod lists;
pub mod mirror;
pub mod offsets;
pub mod pool;

pub use backend::{
    AllocFlags, BackendError, BoHandle, DeviceBackend, DeviceOptions, HostBackend,
    HostBackendOptions, WgpuBackend,
};
pub use buffer::{BufferHandle, BufferId};
pub use config::PoolConfig;
pub use error::{PoolError, Result};
pub use pool::{BufferPool, PoolStats, Release, Teardown, TeardownReport};
