mod common;

use std::sync::Arc;

use common::{host_pool, init_tracing, random_pattern};
use vbufpool::{BufferPool, HostBackend, HostBackendOptions, PoolConfig, PoolError};

#[test]
fn pattern_round_trip() {
    let (_backend, pool) = host_pool(2, 64 * 1024);
    let buffer = pool.alloc().unwrap().unwrap();

    let pattern = random_pattern(64 * 1024);
    buffer.write(&pattern, 0).unwrap();

    let mut out = vec![0u8; pattern.len()];
    buffer.read(&mut out, 0).unwrap();
    assert_eq!(out, pattern);
}

#[test]
fn round_trip_at_offset() {
    let (backend, pool) = host_pool(1, 4096);
    let buffer = pool.alloc().unwrap().unwrap();

    let pattern = random_pattern(333);
    buffer.write(&pattern, 1001).unwrap();

    let mut out = vec![0u8; 333];
    buffer.read(&mut out, 1001).unwrap();
    assert_eq!(out, pattern);

    let device = backend.contents(buffer.bo_handle()).unwrap();
    assert!(device[..1001].iter().all(|b| *b == 0));
    assert_eq!(&device[1001..1334], &pattern[..]);
}

#[test]
fn out_of_bounds_transfers_touch_nothing() {
    let (backend, pool) = host_pool(1, 1024);
    let buffer = pool.alloc().unwrap().unwrap();
    let before = backend.transfers();

    let err = buffer.write(&[0xff; 1025], 0).unwrap_err();
    assert!(matches!(
        err,
        PoolError::TransferBounds {
            size: 1025,
            offset: 0,
            capacity: 1024
        }
    ));
    assert!(buffer.write(&[0xff; 16], 1020).is_err());
    assert!(buffer.write(&[0xff; 1], usize::MAX).is_err());
    assert!(buffer.read(&mut [0; 16], 1009).is_err());

    assert_eq!(backend.transfers(), before);
    let device = backend.contents(buffer.bo_handle()).unwrap();
    assert!(device.iter().all(|b| *b == 0));
    buffer
        .with_host_mirror(|m| assert!(m.iter().all(|b| *b == 0)))
        .unwrap();
}

#[test]
fn write_may_target_a_free_buffer_but_read_may_not() {
    let (backend, pool) = host_pool(1, 64);
    let buffer = pool.buffer(0).unwrap();

    buffer.write(b"staged", 0).unwrap();
    assert_eq!(&backend.contents(buffer.bo_handle()).unwrap()[..6], b"staged");

    let mut out = [0u8; 6];
    assert!(matches!(
        buffer.read(&mut out, 0),
        Err(PoolError::ReadUnallocated(0))
    ));
    assert_eq!(out, [0; 6]);

    let held = pool.alloc().unwrap().unwrap();
    held.read(&mut out, 0).unwrap();
    assert_eq!(&out, b"staged");
}

#[test]
fn backend_failure_surfaces_as_transfer_error() {
    let (backend, pool) = host_pool(1, 64);
    let buffer = pool.alloc().unwrap().unwrap();

    backend.fail_transfers(true);
    assert!(matches!(buffer.write(&[1; 8], 0), Err(PoolError::Transfer(_))));
    assert!(matches!(buffer.read(&mut [0; 8], 0), Err(PoolError::Transfer(_))));

    backend.fail_transfers(false);
    buffer.write(&[1; 8], 0).unwrap();
    let mut out = [0u8; 8];
    buffer.read(&mut out, 0).unwrap();
    assert_eq!(out, [1; 8]);
}

#[test]
fn mirror_flush_and_fetch() {
    let (backend, pool) = host_pool(1, 8192);
    let buffer = pool.alloc().unwrap().unwrap();

    let pattern = random_pattern(512);
    buffer
        .with_host_mirror(|m| m[4096..4608].copy_from_slice(&pattern))
        .unwrap();
    buffer.flush_mirror(512, 4096).unwrap();
    assert_eq!(
        &backend.contents(buffer.bo_handle()).unwrap()[4096..4608],
        &pattern[..]
    );

    buffer.with_host_mirror(|m| m.fill(0)).unwrap();
    buffer.fetch_mirror(512, 4096).unwrap();
    buffer
        .with_host_mirror(|m| assert_eq!(&m[4096..4608], &pattern[..]))
        .unwrap();

    assert!(matches!(
        buffer.flush_mirror(1, 8192),
        Err(PoolError::TransferBounds { .. })
    ));
}

#[test]
fn byte_aligned_backend_skips_staging() {
    init_tracing();
    let backend = Arc::new(HostBackend::new(HostBackendOptions {
        transfer_alignment: 1,
        ..Default::default()
    }));
    let pool = BufferPool::create(backend.clone(), &PoolConfig::new(1, 256)).unwrap();
    let buffer = pool.alloc().unwrap().unwrap();

    let pattern = random_pattern(100);
    buffer.write(&pattern[1..], 3).unwrap();
    buffer
        .with_host_mirror(|m| assert!(m.iter().all(|b| *b == 0)))
        .unwrap();

    let mut out = vec![0u8; 99];
    buffer.read(&mut out, 3).unwrap();
    assert_eq!(out, &pattern[1..]);
}

#[test]
fn transfers_from_the_host_pointer() {
    let (backend, pool) = host_pool(1, 8192);
    let buffer = pool.alloc().unwrap().unwrap();
    let host = buffer.host_ptr();

    // Offset 0 is page aligned; 1024 is the NV12 chroma case (1920 * 1080 % 4096).
    for (offset, fill) in [(0usize, 0x11u8), (1024, 0x5a)] {
        buffer
            .with_host_mirror(|m| m[offset..offset + 16].fill(fill))
            .unwrap();

        let src = unsafe { std::slice::from_raw_parts(host.add(offset), 16) };
        buffer.write(src, offset).unwrap();
        let device = backend.contents(buffer.bo_handle()).unwrap();
        assert_eq!(&device[offset..offset + 16], &[fill; 16]);

        buffer.with_host_mirror(|m| m.fill(0)).unwrap();
        let dst = unsafe { std::slice::from_raw_parts_mut(host.add(offset), 16) };
        buffer.read(dst, offset).unwrap();
        buffer
            .with_host_mirror(|m| assert_eq!(&m[offset..offset + 16], &[fill; 16]))
            .unwrap();
    }
}

#[test]
fn transfers_from_elsewhere_in_the_mirror() {
    let (backend, pool) = host_pool(1, 8192);
    let buffer = pool.alloc().unwrap().unwrap();
    let host = buffer.host_ptr();

    let pattern = random_pattern(64);
    buffer
        .with_host_mirror(|m| m[1000..1064].copy_from_slice(&pattern))
        .unwrap();

    // Source range overlaps the destination's mirror range without matching it.
    let src = unsafe { std::slice::from_raw_parts(host.add(1000), 64) };
    buffer.write(src, 1024).unwrap();
    assert_eq!(
        &backend.contents(buffer.bo_handle()).unwrap()[1024..1088],
        &pattern[..]
    );
    buffer
        .with_host_mirror(|m| assert_eq!(&m[1000..1064], &pattern[..]))
        .unwrap();

    let dst = unsafe { std::slice::from_raw_parts_mut(host.add(1040), 64) };
    buffer.read(dst, 1024).unwrap();
    buffer
        .with_host_mirror(|m| assert_eq!(&m[1040..1104], &pattern[..]))
        .unwrap();
}

#[test]
fn mirror_flush_and_fetch_at_unaligned_offset() {
    let (backend, pool) = host_pool(1, 8192);
    let buffer = pool.alloc().unwrap().unwrap();

    let pattern = random_pattern(16);
    buffer
        .with_host_mirror(|m| m[1024..1040].copy_from_slice(&pattern))
        .unwrap();
    buffer.flush_mirror(16, 1024).unwrap();
    assert_eq!(
        &backend.contents(buffer.bo_handle()).unwrap()[1024..1040],
        &pattern[..]
    );

    buffer.with_host_mirror(|m| m.fill(0)).unwrap();
    buffer.fetch_mirror(16, 1024).unwrap();
    buffer
        .with_host_mirror(|m| assert_eq!(&m[1024..1040], &pattern[..]))
        .unwrap();
}
