#![allow(dead_code)]

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use vbufpool::{BufferPool, HostBackend, PoolConfig};

/// Route `tracing` output to the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn host_pool(count: u32, size: usize) -> (Arc<HostBackend>, BufferPool) {
    init_tracing();
    let backend = Arc::new(HostBackend::default());
    let pool = BufferPool::create(backend.clone(), &PoolConfig::new(count, size))
        .expect("failed to create pool");
    (backend, pool)
}

pub fn random_pattern(len: usize) -> Vec<u8> {
    use rand::Rng;

    let mut pattern = vec![0u8; len];
    rand::rng().fill(&mut pattern[..]);
    pattern
}
