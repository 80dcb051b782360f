//! Pool lifecycle against the simulated device: creation, allocation,
//! refcounting, extension and lookups.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{host_pool, init_tracing};
use vbufpool::{BackendError, BufferPool, HostBackend, PoolConfig, PoolError, Release};

#[test]
fn fresh_pool_is_all_free() {
    let (backend, pool) = host_pool(6, 4096);

    let stats = pool.stats();
    assert_eq!(stats.total, 6);
    assert_eq!(stats.free, 6);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.outstanding, 1);
    assert_eq!(pool.num_buffers(), 6);
    assert_eq!(backend.live_blocks(), 6);

    for index in 0..6 {
        let buffer = pool.buffer(index).unwrap();
        assert_eq!(buffer.refcnt(), 0);
        assert_eq!(buffer.id(), index);
        assert_eq!(buffer.size(), 4096);
    }
}

#[test]
fn create_passes_bank_flags_to_backend() {
    init_tracing();
    let backend = Arc::new(HostBackend::default());
    let pool = BufferPool::create(backend.clone(), &PoolConfig::new(1, 64).with_flags(3)).unwrap();

    let flags = backend.flags(pool.buffer(0).unwrap().bo_handle()).unwrap();
    assert_eq!(flags.bank, 3);
    assert!(flags.device_only);
    assert_eq!(pool.flags(), 3);
}

#[test]
fn empty_pool_is_immediately_exhausted() {
    let (_backend, pool) = host_pool(0, 64);
    assert!(pool.alloc().unwrap().is_none());
    assert_eq!(pool.extend(2).unwrap(), 2);
    assert!(pool.alloc().unwrap().is_some());
}

#[test]
fn exhaustion_and_reuse_of_freed_buffer() {
    let (_backend, pool) = host_pool(5, 1024);

    let buffers: Vec<_> = (0..5).map(|_| pool.alloc().unwrap().unwrap()).collect();
    assert!(pool.alloc().unwrap().is_none());

    let freed = buffers[2].clone();
    assert!(freed.free().unwrap());

    let again = pool.alloc().unwrap().unwrap();
    assert_eq!(again, freed);
    assert_eq!(again.refcnt(), 1);
}

#[test]
fn allocation_is_fifo() {
    let (_backend, pool) = host_pool(3, 64);

    let a = pool.alloc().unwrap().unwrap();
    let b = pool.alloc().unwrap().unwrap();
    assert_eq!((a.id(), b.id()), (0, 1));

    b.free().unwrap();
    a.free().unwrap();

    // Buffer 2 has been free the longest, then b, then a.
    let order: Vec<_> = (0..3).map(|_| pool.alloc().unwrap().unwrap().id()).collect();
    assert_eq!(order, vec![2, 1, 0]);
}

#[test]
fn alloc_then_free_all_restores_free_count() {
    let (_backend, pool) = host_pool(8, 256);

    let buffers: Vec<_> = std::iter::from_fn(|| pool.alloc().unwrap()).collect();
    assert_eq!(buffers.len(), 8);
    assert_eq!(pool.free_count(), 0);

    for buffer in &buffers {
        assert!(buffer.free().unwrap());
    }
    assert_eq!(pool.free_count(), 8);
    assert_eq!(pool.stats().outstanding, 1);
}

#[test]
fn extra_references_hold_the_buffer() {
    let (_backend, pool) = host_pool(2, 64);

    let buffer = pool.alloc().unwrap().unwrap();
    assert_eq!(buffer.refcnt_inc().unwrap(), 2);
    assert_eq!(buffer.refcnt_inc().unwrap(), 3);

    let results: Vec<_> = (0..4).map(|_| buffer.free().unwrap()).collect();
    assert_eq!(results, vec![false, false, true, false]);
    assert_eq!(buffer.refcnt(), 0);
    assert_eq!(pool.free_count(), 2);
}

#[test]
fn release_reports_each_transition() {
    let (_backend, pool) = host_pool(1, 64);

    let buffer = pool.alloc().unwrap().unwrap();
    buffer.refcnt_inc().unwrap();

    assert!(matches!(buffer.release().unwrap(), Release::Held { refcnt: 1 }));
    assert!(matches!(buffer.release().unwrap(), Release::Returned));
    assert!(matches!(buffer.release().unwrap(), Release::AlreadyFree));
}

#[test]
fn refcount_increment_on_free_buffer_is_rejected() {
    let (_backend, pool) = host_pool(2, 64);

    let free = pool.buffer(1).unwrap();
    let err = free.refcnt_inc().unwrap_err();
    assert!(matches!(err, PoolError::RefcountOnFreeBuffer(1)));
    assert!(err.is_logic_error());
    assert_eq!(free.refcnt(), 0);
    assert_eq!(pool.free_count(), 2);
}

#[test]
fn extend_with_outstanding_buffers() {
    let (backend, pool) = host_pool(4, 128);

    let held: Vec<_> = (0..3).map(|_| pool.alloc().unwrap().unwrap()).collect();
    assert_eq!(pool.extend(5).unwrap(), 9);

    assert_eq!(pool.num_buffers(), 9);
    assert_eq!(pool.free_count(), 9 - held.len());
    assert_eq!(backend.live_blocks(), 9);

    // New buffers queue behind the one that was already free.
    assert_eq!(pool.alloc().unwrap().unwrap().id(), 3);
    assert_eq!(pool.alloc().unwrap().unwrap().id(), 4);
}

#[test]
fn extend_is_reachable_from_any_buffer() {
    let (_backend, pool) = host_pool(2, 64);

    let buffer = pool.alloc().unwrap().unwrap();
    assert_eq!(buffer.extend_pool(3).unwrap(), 5);
    assert_eq!(buffer.pool_num_buffers(), 5);
    assert!(buffer.pool().same_pool(&pool));
}

#[test]
fn partial_extension_keeps_created_buffers() {
    let (backend, pool) = host_pool(2, 64);
    backend.fail_allocations_after(Some(2));

    let err = pool.extend(5).unwrap_err();
    match &err {
        PoolError::PartialExtend { added, total, source } => {
            assert_eq!((*added, *total), (2, 4));
            assert!(matches!(
                **source,
                PoolError::Allocation {
                    index: 4,
                    source: BackendError::OutOfMemory { size: 64 }
                }
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.extended_total(), Some(4));

    assert_eq!(pool.num_buffers(), 4);
    assert_eq!(pool.free_count(), 4);
    assert_eq!(backend.live_blocks(), 4);

    backend.fail_allocations_after(None);
    assert_eq!(pool.extend(1).unwrap(), 5);
}

#[test]
fn failed_create_leaks_nothing() {
    init_tracing();
    let backend = Arc::new(HostBackend::default());
    backend.fail_allocations_after(Some(3));

    let err = BufferPool::create(backend.clone(), &PoolConfig::new(5, 4096)).unwrap_err();
    assert!(matches!(err, PoolError::Allocation { index: 3, .. }));
    assert_eq!(backend.live_blocks(), 0);
    assert_eq!(backend.bytes_in_use(), 0);
}

#[test]
fn failed_initial_transfer_fails_create() {
    init_tracing();
    let backend = Arc::new(HostBackend::default());
    backend.fail_transfers(true);

    let err = BufferPool::create(backend.clone(), &PoolConfig::new(2, 64)).unwrap_err();
    assert!(matches!(err, PoolError::Allocation { index: 0, .. }));
    assert_eq!(backend.live_blocks(), 0);
}

#[test]
fn invalid_config_is_rejected_before_allocating() {
    init_tracing();
    let backend = Arc::new(HostBackend::default());

    let err = BufferPool::create(backend.clone(), &PoolConfig::new(3, 0)).unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));
    assert_eq!(backend.transfers(), 0);
    assert_eq!(backend.live_blocks(), 0);
}

#[test]
fn lookup_by_device_address() {
    let (_backend, pool) = host_pool(4, 10_000);

    let allocated: Vec<_> = (0..4).map(|_| pool.alloc().unwrap().unwrap()).collect();
    let addresses: HashSet<_> = allocated.iter().map(|b| b.paddr()).collect();
    assert_eq!(addresses.len(), 4);

    for buffer in &allocated {
        let found = pool.buffer_by_paddr(buffer.paddr()).unwrap();
        assert_eq!(&found, buffer);
    }
    assert!(pool.buffer_by_paddr(0xdead_beef).is_none());
    assert!(pool.buffer_by_paddr(allocated[0].paddr() + 1).is_none());
}

#[test]
fn buffer_index_out_of_range() {
    let (_backend, pool) = host_pool(3, 64);
    assert!(matches!(
        pool.buffer(3),
        Err(PoolError::BufferOutOfRange { index: 3, len: 3 })
    ));
}

#[test]
fn offsets_append_and_are_range_checked() {
    let (_backend, pool) = host_pool(1, 1920 * 1080 * 3 / 2);

    pool.set_offsets(&[0]).unwrap();
    pool.set_offsets(&[1920 * 1080]).unwrap();

    let buffer = pool.alloc().unwrap().unwrap();
    assert_eq!(buffer.offset(0).unwrap(), 0);
    assert_eq!(buffer.offset(1).unwrap(), 1920 * 1080);
    assert!(matches!(
        buffer.offset(2),
        Err(PoolError::OffsetOutOfRange { index: 2, len: 2 })
    ));
}

#[test]
fn host_pointer_is_page_aligned_and_stable() {
    let (_backend, pool) = host_pool(2, 100);

    let buffer = pool.alloc().unwrap().unwrap();
    let ptr = buffer.host_ptr();
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % vbufpool::mirror::PAGE_SIZE, 0);

    buffer.free().unwrap();
    let again = pool.alloc().unwrap().unwrap();
    assert_eq!(again.id(), 1);
    assert_eq!(pool.buffer(0).unwrap().host_ptr(), ptr);
}
