use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};
use wgpu::BufferUsages;

use super::{AllocFlags, BackendError, BoHandle, DeviceBackend};
use crate::error::{PoolError, Result};

/// wgpu copies move whole 4-byte words.
const COPY_ALIGN: usize = wgpu::COPY_BUFFER_ALIGNMENT as usize;
/// Start of the synthetic device address space handed to blocks.
const ADDRESS_BASE: u64 = 0x10_0000_0000;
const ADDRESS_ALIGN: u64 = 4096;

/// Adapter selection for [`WgpuBackend::new`].
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub power_preference: wgpu::PowerPreference,
    pub backends: wgpu::Backends,
    pub label: Option<String>,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            backends: wgpu::Backends::all(),
            label: Some("vbufpool".into()),
        }
    }
}

struct GpuBlock {
    buffer: wgpu::Buffer,
    addr: u64,
    size: usize,
}

struct BlockTable {
    blocks: AHashMap<u32, Arc<GpuBlock>>,
    next_handle: u32,
    next_addr: u64,
}

/// A [`DeviceBackend`] over a wgpu device.
///
/// wgpu exposes no physical addresses, so every block gets a synthetic,
/// page-aligned address from a bump allocator; it is unique for the
/// backend's lifetime and never reused.
///
/// Transfers block on `Device::poll`, and reads wait on the map callback
/// with a blocking receive. Don't call them from inside an async runtime.
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter: Option<wgpu::AdapterInfo>,
    table: Mutex<BlockTable>,
}

impl WgpuBackend {
    /// Open the preferred adapter with maximum buffer limits.
    pub async fn new(options: DeviceOptions) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: options.backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference,
                ..Default::default()
            })
            .await
            .map_err(|e| PoolError::Gpu(format!("Failed to get adapter: {e}")))?;

        Self::from_adapter(adapter, &options).await
    }

    /// Open the `index`-th adapter the system reports, blocking until the
    /// device is ready.
    pub fn open(index: u32) -> Result<Self> {
        let options = DeviceOptions::default();
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: options.backends,
            ..Default::default()
        });

        let adapter = instance
            .enumerate_adapters(options.backends)
            .into_iter()
            .nth(index as usize)
            .ok_or(PoolError::NoDevice(index))?;

        futures::executor::block_on(Self::from_adapter(adapter, &options))
    }

    /// Wrap a device the caller already owns.
    pub fn from_device(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            device,
            queue,
            adapter: None,
            table: Mutex::new(BlockTable::new()),
        }
    }

    async fn from_adapter(adapter: wgpu::Adapter, options: &DeviceOptions) -> Result<Self> {
        let info = adapter.get_info();

        let mut required_limits = wgpu::Limits::default();
        let adapter_limits = adapter.limits();
        required_limits.max_buffer_size = adapter_limits.max_buffer_size;
        required_limits.max_storage_buffer_binding_size =
            adapter_limits.max_storage_buffer_binding_size;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: options.label.as_deref(),
                required_features: wgpu::Features::empty(),
                required_limits,
                ..Default::default()
            })
            .await?;

        debug!(adapter = %info.name, backend = ?info.backend, "wgpu device opened");

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter: Some(info),
            table: Mutex::new(BlockTable::new()),
        })
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    pub fn adapter_info(&self) -> Option<&wgpu::AdapterInfo> {
        self.adapter.as_ref()
    }

    fn block(&self, handle: BoHandle) -> std::result::Result<Arc<GpuBlock>, BackendError> {
        self.table
            .lock()
            .blocks
            .get(&handle.0)
            .cloned()
            .ok_or(BackendError::UnknownBlock(handle))
    }

    fn wait(&self) -> std::result::Result<(), BackendError> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| BackendError::Device(format!("poll failed: {e}")))
    }

    /// Read a word-aligned window `[start, start + dst.len())` of a block.
    fn read_words(
        &self,
        handle: BoHandle,
        block: &GpuBlock,
        start: usize,
        dst: &mut [u8],
    ) -> std::result::Result<(), BackendError> {
        let size = dst.len() as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vbufpool_read_staging"),
            size,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&block.buffer, start as u64, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = tokio::sync::oneshot::channel();
        staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.wait()?;
        rx.blocking_recv()
            .map_err(|_| transfer_error(handle, "map callback dropped"))?
            .map_err(|e| transfer_error(handle, &format!("buffer map failed: {e}")))?;

        let view = staging.slice(..).get_mapped_range();
        dst.copy_from_slice(&view);
        drop(view);
        staging.unmap();
        Ok(())
    }
}

impl BlockTable {
    fn new() -> Self {
        Self {
            blocks: AHashMap::new(),
            next_handle: 1,
            next_addr: ADDRESS_BASE,
        }
    }
}

fn transfer_error(handle: BoHandle, reason: &str) -> BackendError {
    BackendError::Transfer {
        handle,
        reason: reason.to_string(),
    }
}

/// Widen `[offset, offset + len)` to word boundaries.
fn word_window(offset: usize, len: usize) -> (usize, usize) {
    let start = offset & !(COPY_ALIGN - 1);
    let end = (offset + len).next_multiple_of(COPY_ALIGN);
    (start, end)
}

fn check_range(
    handle: BoHandle,
    block: &GpuBlock,
    offset: usize,
    len: usize,
) -> std::result::Result<(), BackendError> {
    let end = offset.checked_add(len).unwrap_or(usize::MAX);
    if end > block.size {
        return Err(BackendError::OutOfBounds {
            handle,
            offset,
            end,
            size: block.size,
        });
    }
    Ok(())
}

impl DeviceBackend for WgpuBackend {
    fn allocate(&self, size: usize, flags: AllocFlags) -> std::result::Result<BoHandle, BackendError> {
        // Buffer sizes must be word multiples; the tail is never exposed.
        let padded = size.max(COPY_ALIGN).next_multiple_of(COPY_ALIGN) as u64;
        if padded > self.device.limits().max_buffer_size {
            return Err(BackendError::OutOfMemory { size });
        }

        // Blocks are only reached through transfers, so `device_only` needs no
        // extra usage; memory banks have no wgpu equivalent.
        let usage = BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vbufpool_block"),
            size: padded,
            usage,
            mapped_at_creation: false,
        });
        if let Some(err) = futures::executor::block_on(self.device.pop_error_scope()) {
            debug!(size, "wgpu allocation failed: {err}");
            return Err(BackendError::OutOfMemory { size });
        }

        let mut table = self.table.lock();
        let handle = BoHandle(table.next_handle);
        table.next_handle += 1;
        let addr = table.next_addr;
        table.next_addr += padded.div_ceil(ADDRESS_ALIGN) * ADDRESS_ALIGN;
        table
            .blocks
            .insert(handle.0, Arc::new(GpuBlock { buffer, addr, size }));

        trace!(%handle, addr, size, bank = flags.bank, "wgpu block allocated");
        Ok(handle)
    }

    fn device_addr(&self, handle: BoHandle) -> std::result::Result<u64, BackendError> {
        Ok(self.block(handle)?.addr)
    }

    fn free(&self, handle: BoHandle) -> std::result::Result<(), BackendError> {
        let block = self
            .table
            .lock()
            .blocks
            .remove(&handle.0)
            .ok_or(BackendError::UnknownBlock(handle))?;
        block.buffer.destroy();
        trace!(%handle, "wgpu block freed");
        Ok(())
    }

    fn write(&self, handle: BoHandle, src: &[u8], offset: usize) -> std::result::Result<(), BackendError> {
        let block = self.block(handle)?;
        check_range(handle, &block, offset, src.len())?;
        if src.is_empty() {
            return Ok(());
        }

        if offset % COPY_ALIGN == 0 && src.len() % COPY_ALIGN == 0 {
            self.queue.write_buffer(&block.buffer, offset as u64, src);
        } else {
            // Read-modify-write the surrounding words.
            let (start, end) = word_window(offset, src.len());
            let mut window = vec![0u8; end - start];
            self.read_words(handle, &block, start, &mut window)?;
            window[offset - start..offset - start + src.len()].copy_from_slice(src);
            self.queue.write_buffer(&block.buffer, start as u64, &window);
        }

        self.queue.submit(std::iter::empty());
        self.wait()
    }

    fn read(&self, handle: BoHandle, dst: &mut [u8], offset: usize) -> std::result::Result<(), BackendError> {
        let block = self.block(handle)?;
        check_range(handle, &block, offset, dst.len())?;
        if dst.is_empty() {
            return Ok(());
        }

        if offset % COPY_ALIGN == 0 && dst.len() % COPY_ALIGN == 0 {
            return self.read_words(handle, &block, offset, dst);
        }

        let (start, end) = word_window(offset, dst.len());
        let mut window = vec![0u8; end - start];
        self.read_words(handle, &block, start, &mut window)?;
        let len = dst.len();
        dst.copy_from_slice(&window[offset - start..offset - start + len]);
        Ok(())
    }
}
