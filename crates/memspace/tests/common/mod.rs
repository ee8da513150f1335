//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use memspace::prelude::*;

/// Install a test-friendly subscriber once. `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Upload `data` to `space` from `worker`'s host.
pub fn upload<T: Element>(worker: &Worker, space: MemorySpace, data: Vec<T>) -> Value {
    let host = Value::Host(HostArray::from_vec(data));
    worker
        .move_value(&worker.host(), &space.into(), &host)
        .expect("Failed to upload")
}

/// Read a device value back to `worker`'s host.
pub fn read_back<T: Element>(worker: &Worker, value: &Value) -> Vec<T> {
    let array = value.as_device().expect("Not a device value");
    worker
        .mover()
        .download(array)
        .expect("Failed to download")
        .to_vec::<T>()
        .expect("Wrong element type")
}

/// Driver counters of a cluster worker.
pub fn driver_stats(cluster: &LocalCluster, worker: &Arc<Worker>) -> CpuDriverStats {
    cluster
        .driver(worker.id())
        .expect("Worker not in cluster")
        .stats()
}
