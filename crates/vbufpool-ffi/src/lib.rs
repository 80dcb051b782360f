//! C FFI bindings for vbufpool.
//!
//! Exposes device buffer pools through opaque, heap-allocated handles. Every
//! handle returned by this library is owned by the caller and is released
//! with the matching `*_close` / `*_release_handle` / `*_destroy` call.

use std::cell::RefCell;
use std::ffi::{c_void, CString};
use std::os::raw::c_char;
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::warn;
use vbufpool::{
    BufferHandle, BufferPool, DeviceBackend, HostBackend, PoolConfig, PoolError, WgpuBackend,
};

// ---------------------------------------------------------------------------
// Opaque handles
// ---------------------------------------------------------------------------

/// Opaque handle to an opened device.
pub struct VbufDevice {
    backend: Arc<dyn DeviceBackend>,
}

/// Opaque handle to a buffer pool.
pub struct VbufPool {
    pool: BufferPool,
}

/// Opaque handle to one buffer of a pool.
pub struct VbufBuffer {
    buffer: BufferHandle,
}

// ---------------------------------------------------------------------------
// Thread-local error
// ---------------------------------------------------------------------------

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_error(e: impl std::fmt::Display) {
    let msg = CString::new(e.to_string()).unwrap_or_default();
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = Some(msg);
    });
}

fn clear_error() {
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = None;
    });
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

/// Log level for the logger callback.
#[repr(C)]
pub enum VbufLogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

/// Logger callback type.
pub type VbufLogFn = unsafe extern "C" fn(
    level: VbufLogLevel,
    message: *const c_char,
    len: usize,
    userdata: *mut c_void,
);

struct LoggerState {
    callback: VbufLogFn,
    userdata: usize, // stored as usize for Send+Sync
}

// Safety: the caller guarantees the userdata pointer (and callback) are safe
// to call from any thread.
unsafe impl Send for LoggerState {}
unsafe impl Sync for LoggerState {}

static LOGGER: OnceLock<LoggerState> = OnceLock::new();
static MIN_LOG_LEVEL: AtomicU8 = AtomicU8::new(3); // default: Warn

/// A tracing layer that forwards events to the C logger callback.
struct FfiLayer;

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for FfiLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let Some(state) = LOGGER.get() else {
            return;
        };

        let (level, c_level) = match *event.metadata().level() {
            tracing::Level::TRACE => (0u8, VbufLogLevel::Trace),
            tracing::Level::DEBUG => (1, VbufLogLevel::Debug),
            tracing::Level::INFO => (2, VbufLogLevel::Info),
            tracing::Level::WARN => (3, VbufLogLevel::Warn),
            tracing::Level::ERROR => (4, VbufLogLevel::Error),
        };

        if level < MIN_LOG_LEVEL.load(Ordering::Relaxed) {
            return;
        }

        let mut buf = String::new();
        event.record(&mut MessageVisitor(&mut buf));

        if let Ok(c_str) = CString::new(buf) {
            let len = c_str.as_bytes().len();
            unsafe {
                (state.callback)(c_level, c_str.as_ptr(), len, state.userdata as *mut c_void);
            }
        }
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        use std::fmt::Write;
        if field.name() == "message" {
            let _ = write!(self.0, "{:?}", value);
        } else {
            if !self.0.is_empty() {
                self.0.push(' ');
            }
            let _ = write!(self.0, "{}={:?}", field.name(), value);
        }
    }
}

/// Install a logger callback that receives the library's log messages.
///
/// Only the first call installs a callback; later calls just update
/// `min_level` (0=Trace, 1=Debug, 2=Info, 3=Warn, 4=Error).
///
/// # Safety
///
/// - `callback` must be a valid function pointer safe to call from any thread.
/// - `userdata` must remain valid for as long as messages may be emitted.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_set_logger(
    callback: VbufLogFn,
    userdata: *mut c_void,
    min_level: u8,
) {
    MIN_LOG_LEVEL.store(min_level.min(4), Ordering::Relaxed);

    if LOGGER
        .set(LoggerState {
            callback,
            userdata: userdata as usize,
        })
        .is_ok()
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let _ = tracing_subscriber::registry().with(FfiLayer).try_init();
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Open the `device_id`-th GPU adapter.
///
/// Returns NULL on error; see `vbufpool_error_message()`.
#[unsafe(no_mangle)]
pub extern "C" fn vbufpool_device_open(device_id: u32) -> *mut VbufDevice {
    clear_error();
    match WgpuBackend::open(device_id) {
        Ok(backend) => Box::into_raw(Box::new(VbufDevice {
            backend: Arc::new(backend),
        })),
        Err(e) => {
            set_error(e);
            ptr::null_mut()
        }
    }
}

/// Open a simulated device backed by host memory.
#[unsafe(no_mangle)]
pub extern "C" fn vbufpool_device_open_host() -> *mut VbufDevice {
    clear_error();
    Box::into_raw(Box::new(VbufDevice {
        backend: Arc::new(HostBackend::default()),
    }))
}

/// Close a device handle. Pools created on it keep the device alive until
/// they are torn down. Passing NULL is a no-op.
///
/// # Safety
///
/// `device` must be NULL or a pointer from `vbufpool_device_open*` that has
/// not been closed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_device_close(device: *mut VbufDevice) {
    if !device.is_null() {
        drop(unsafe { Box::from_raw(device) });
    }
}

// ---------------------------------------------------------------------------
// Pools
// ---------------------------------------------------------------------------

/// Create a pool of `count` buffers of `size` bytes on `device`.
///
/// Returns NULL on error; see `vbufpool_error_message()`.
///
/// # Safety
///
/// `device` must be a valid pointer from `vbufpool_device_open*`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_pool_create(
    device: *const VbufDevice,
    count: u32,
    size: usize,
    flags: u32,
) -> *mut VbufPool {
    clear_error();
    let Some(device) = (unsafe { device.as_ref() }) else {
        set_error("device must not be NULL");
        return ptr::null_mut();
    };

    let config = PoolConfig::new(count, size).with_flags(flags);
    pool_into_raw(BufferPool::create(Arc::clone(&device.backend), &config))
}

/// Open the `device_id`-th GPU adapter and create a pool on it.
///
/// Returns NULL on error; see `vbufpool_error_message()`.
#[unsafe(no_mangle)]
pub extern "C" fn vbufpool_pool_create_by_device_id(
    device_id: u32,
    count: u32,
    size: usize,
    flags: u32,
) -> *mut VbufPool {
    clear_error();
    let config = PoolConfig::new(count, size).with_flags(flags);
    pool_into_raw(BufferPool::create_by_device_id(device_id, &config))
}

/// Append `len` entries to the pool's offset table.
///
/// Returns 0 on success, -1 on error.
///
/// # Safety
///
/// - `pool` must be a valid pool handle.
/// - `offsets` must point to `len` readable `u32`s (may be NULL if `len` is 0).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_pool_offsets_set(
    pool: *const VbufPool,
    offsets: *const u32,
    len: usize,
) -> i32 {
    clear_error();
    let Some(pool) = (unsafe { pool.as_ref() }) else {
        set_error("pool must not be NULL");
        return -1;
    };
    let offsets = if len == 0 {
        &[][..]
    } else if offsets.is_null() {
        set_error("offsets must not be NULL when len > 0");
        return -1;
    } else {
        unsafe { std::slice::from_raw_parts(offsets, len) }
    };
    status(pool.pool.set_offsets(offsets))
}

/// Read entry `index` of the offset table of `buffer`'s pool into `out`.
///
/// Returns 0 on success, -1 on error.
///
/// # Safety
///
/// - `buffer` must be a valid buffer handle.
/// - `out` must be a valid, writable pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_pool_offset_get(
    buffer: *const VbufBuffer,
    index: u32,
    out: *mut u32,
) -> i32 {
    clear_error();
    let Some(buffer) = (unsafe { buffer.as_ref() }) else {
        set_error("buffer must not be NULL");
        return -1;
    };
    if out.is_null() {
        set_error("out must not be NULL");
        return -1;
    }
    match buffer.buffer.offset(index) {
        Ok(offset) => {
            unsafe { *out = offset };
            0
        }
        Err(e) => {
            set_error(e);
            -1
        }
    }
}

/// Add `additional` buffers to `buffer`'s pool.
///
/// Returns the new buffer count. If only some buffers could be created the
/// count reflects them and an error message is set; on any other failure 0
/// is returned.
///
/// # Safety
///
/// `buffer` must be a valid buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_pool_extend(buffer: *const VbufBuffer, additional: u32) -> u32 {
    clear_error();
    let Some(buffer) = (unsafe { buffer.as_ref() }) else {
        set_error("buffer must not be NULL");
        return 0;
    };
    match buffer.buffer.extend_pool(additional) {
        Ok(total) => total,
        Err(e) => {
            let total = e.extended_total().unwrap_or(0);
            set_error(e);
            total
        }
    }
}

/// Number of buffers in `buffer`'s pool.
///
/// # Safety
///
/// `buffer` must be NULL or a valid buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_pool_num_buffers_get(buffer: *const VbufBuffer) -> u32 {
    unsafe { buffer.as_ref() }.map_or(0, |b| b.buffer.pool_num_buffers())
}

/// Take a free buffer from the pool.
///
/// Returns NULL when every buffer is in use or on error (the error message is
/// only set for the latter).
///
/// # Safety
///
/// `pool` must be a valid pool handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_pool_entry_alloc(pool: *const VbufPool) -> *mut VbufBuffer {
    clear_error();
    let Some(pool) = (unsafe { pool.as_ref() }) else {
        set_error("pool must not be NULL");
        return ptr::null_mut();
    };
    match pool.pool.alloc() {
        Ok(Some(buffer)) => buffer_into_raw(buffer),
        Ok(None) => ptr::null_mut(),
        Err(e) => {
            set_error(e);
            ptr::null_mut()
        }
    }
}

/// Drop one reference to `buffer`.
///
/// Returns true when the buffer went back to the free set. A NULL buffer, or
/// one whose pool is already torn down, logs a warning and returns true. The
/// handle itself stays valid; release it with `vbufpool_buffer_release_handle`.
///
/// # Safety
///
/// `buffer` must be NULL or a valid buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_pool_entry_free(buffer: *const VbufBuffer) -> bool {
    clear_error();
    let Some(buffer) = (unsafe { buffer.as_ref() }) else {
        warn!("free of a NULL buffer");
        return true;
    };
    if buffer.buffer.pool().is_retired() {
        warn!(buffer = buffer.buffer.id(), "free of a buffer whose pool is gone");
        return true;
    }
    match buffer.buffer.free() {
        Ok(returned) => returned,
        Err(e) => {
            set_error(e);
            false
        }
    }
}

/// Release the pool's creation reference and its handle.
///
/// If no buffer is in use the pool is torn down now, otherwise when its last
/// buffer is freed. Returns 0 on success, -1 on error.
///
/// # Safety
///
/// `pool` must be NULL or a valid pool handle; it must not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_pool_destroy(pool: *mut VbufPool) -> i32 {
    clear_error();
    if pool.is_null() {
        set_error("pool must not be NULL");
        return -1;
    }
    let handle = unsafe { Box::from_raw(pool) };
    match handle.pool.destroy() {
        Ok(teardown) => {
            if let Some(teardown) = teardown {
                teardown.finish();
            }
            0
        }
        Err(e) => {
            set_error(e);
            -1
        }
    }
}

/// Release a pool handle without touching the pool's creation reference.
///
/// Use this for handles from `vbufpool_get_pool_handle`. Passing NULL is a
/// no-op.
///
/// # Safety
///
/// `pool` must be NULL or a valid pool handle; it must not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_pool_release_handle(pool: *mut VbufPool) {
    if !pool.is_null() {
        drop(unsafe { Box::from_raw(pool) });
    }
}

/// Number of free buffers in the pool.
///
/// # Safety
///
/// `pool` must be NULL or a valid pool handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_get_freelist_count(pool: *const VbufPool) -> usize {
    unsafe { pool.as_ref() }.map_or(0, |p| p.pool.free_count())
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// # Safety
///
/// `buffer` must be NULL or a valid buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_buffer_get_bo_handle(buffer: *const VbufBuffer) -> u32 {
    unsafe { buffer.as_ref() }.map_or(0, |b| b.buffer.bo_handle().0)
}

/// # Safety
///
/// `buffer` must be NULL or a valid buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_buffer_get_id(buffer: *const VbufBuffer) -> u32 {
    unsafe { buffer.as_ref() }.map_or(0, |b| b.buffer.id())
}

/// # Safety
///
/// `buffer` must be NULL or a valid buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_buffer_get_size(buffer: *const VbufBuffer) -> usize {
    unsafe { buffer.as_ref() }.map_or(0, |b| b.buffer.size())
}

/// # Safety
///
/// `buffer` must be NULL or a valid buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_buffer_get_paddr(buffer: *const VbufBuffer) -> u64 {
    unsafe { buffer.as_ref() }.map_or(0, |b| b.buffer.paddr())
}

/// Host mirror of the buffer. Valid until the pool is torn down.
///
/// # Safety
///
/// `buffer` must be NULL or a valid buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_buffer_get_host_ptr(buffer: *const VbufBuffer) -> *mut c_void {
    unsafe { buffer.as_ref() }.map_or(ptr::null_mut(), |b| b.buffer.host_ptr().cast())
}

/// # Safety
///
/// `buffer` must be NULL or a valid buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_buffer_get_refcnt(buffer: *const VbufBuffer) -> u32 {
    unsafe { buffer.as_ref() }.map_or(0, |b| b.buffer.refcnt())
}

/// Add a reference to an allocated buffer.
///
/// Returns 0 on success, -1 on error (including a buffer that is free).
///
/// # Safety
///
/// `buffer` must be a valid buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_buffer_refcnt_inc(buffer: *const VbufBuffer) -> i32 {
    clear_error();
    let Some(buffer) = (unsafe { buffer.as_ref() }) else {
        set_error("buffer must not be NULL");
        return -1;
    };
    status(buffer.buffer.refcnt_inc().map(drop))
}

/// Copy `size` bytes from `src` to the device at `offset`.
///
/// `src` may point into the buffer's own host mirror, e.g.
/// `vbufpool_buffer_get_host_ptr(buffer) + offset`.
///
/// Returns 0 on success, -1 on error.
///
/// # Safety
///
/// - `buffer` must be a valid buffer handle.
/// - `src` must point to `size` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_buffer_write(
    buffer: *const VbufBuffer,
    src: *const c_void,
    size: usize,
    offset: usize,
) -> i32 {
    clear_error();
    let Some(buffer) = (unsafe { buffer.as_ref() }) else {
        set_error("buffer must not be NULL");
        return -1;
    };
    if src.is_null() {
        set_error("src must not be NULL");
        return -1;
    }
    let src = unsafe { std::slice::from_raw_parts(src.cast::<u8>(), size) };
    status(buffer.buffer.write(src, offset))
}

/// Copy `size` bytes at `offset` from the device to `dst`, which may point
/// into the buffer's own host mirror.
///
/// Returns 0 on success, -1 on error.
///
/// # Safety
///
/// - `buffer` must be a valid buffer handle.
/// - `dst` must point to `size` writable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_buffer_read(
    buffer: *const VbufBuffer,
    dst: *mut c_void,
    size: usize,
    offset: usize,
) -> i32 {
    clear_error();
    let Some(buffer) = (unsafe { buffer.as_ref() }) else {
        set_error("buffer must not be NULL");
        return -1;
    };
    if dst.is_null() {
        set_error("dst must not be NULL");
        return -1;
    }
    let dst = unsafe { std::slice::from_raw_parts_mut(dst.cast::<u8>(), size) };
    status(buffer.buffer.read(dst, offset))
}

/// Release a buffer handle. Does not change the buffer's refcount. Passing
/// NULL is a no-op.
///
/// # Safety
///
/// `buffer` must be NULL or a valid buffer handle; it must not be used
/// afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_buffer_release_handle(buffer: *mut VbufBuffer) {
    if !buffer.is_null() {
        drop(unsafe { Box::from_raw(buffer) });
    }
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

/// New handle to `buffer`'s pool; release it with
/// `vbufpool_pool_release_handle`.
///
/// # Safety
///
/// `buffer` must be NULL or a valid buffer handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_get_pool_handle(buffer: *const VbufBuffer) -> *mut VbufPool {
    match unsafe { buffer.as_ref() } {
        Some(buffer) => Box::into_raw(Box::new(VbufPool {
            pool: buffer.buffer.pool(),
        })),
        None => ptr::null_mut(),
    }
}

/// Handle to buffer `index` of the pool, free or not. NULL if out of range.
///
/// # Safety
///
/// `pool` must be a valid pool handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_get_buffer_handle(pool: *const VbufPool, index: u32) -> *mut VbufBuffer {
    clear_error();
    let Some(pool) = (unsafe { pool.as_ref() }) else {
        set_error("pool must not be NULL");
        return ptr::null_mut();
    };
    match pool.pool.buffer(index) {
        Ok(buffer) => buffer_into_raw(buffer),
        Err(e) => {
            set_error(e);
            ptr::null_mut()
        }
    }
}

/// Handle to the buffer at device address `paddr`. NULL if no buffer of the
/// pool has that address.
///
/// # Safety
///
/// `pool` must be NULL or a valid pool handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vbufpool_buffer_get_handle(pool: *const VbufPool, paddr: u64) -> *mut VbufBuffer {
    unsafe { pool.as_ref() }
        .and_then(|p| p.pool.buffer_by_paddr(paddr))
        .map_or(ptr::null_mut(), buffer_into_raw)
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

/// Get the last error message, or NULL if no error occurred.
///
/// The returned pointer is owned by the library and valid until the next
/// FFI call on the same thread.
#[unsafe(no_mangle)]
pub extern "C" fn vbufpool_error_message() -> *const c_char {
    LAST_ERROR.with(|cell| {
        let borrow = cell.borrow();
        match borrow.as_ref() {
            Some(s) => s.as_ptr(),
            None => ptr::null(),
        }
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn status(result: Result<(), PoolError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            set_error(e);
            -1
        }
    }
}

fn pool_into_raw(result: Result<BufferPool, PoolError>) -> *mut VbufPool {
    match result {
        Ok(pool) => Box::into_raw(Box::new(VbufPool { pool })),
        Err(e) => {
            set_error(e);
            ptr::null_mut()
        }
    }
}

fn buffer_into_raw(buffer: BufferHandle) -> *mut VbufBuffer {
    Box::into_raw(Box::new(VbufBuffer { buffer }))
}
