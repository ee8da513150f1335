//! # memspace
//!
//! Heterogeneous memory placement and data transfer for distributed
//! multi-GPU task execution.
//!
//! A distributed scheduler places tasks on processors (one accelerator on
//! one worker) and their arguments in memory spaces. memspace moves each
//! value to where the task needs it along the cheapest correct path:
//!
//! - immutable values pass through untouched
//! - host arrays are uploaded, device arrays downloaded
//! - device arrays cross devices of one worker with a direct copy ordered
//!   by a stream event
//! - workers sharing a node alias each other's device memory through IPC
//!   handles
//! - workers on different nodes round-trip through host memory
//!
//! ## Quick Start
//!
//! ```ignore
//! use memspace::prelude::*;
//!
//! let worker = Worker::builder().backend(Backend::Auto).build()?;
//! let space = worker.memory_spaces()[0];
//!
//! let host = Value::Host(HostArray::from_vec(vec![1.0f32, 2.0, 3.0]));
//! let on_device = worker.move_value(&worker.host(), &space.into(), &host)?;
//!
//! let sum = worker.execute_blocking(space.processor(), (), |ctx, array: Value| {
//!     // ... launch work on ctx.stream() ...
//!     Ok::<_, MemspaceError>(array)
//! }, on_device)?;
//! ```
//!
//! ## Backends
//!
//! - **CPU** - simulated accelerators in host memory (always available)
//! - **CUDA** - NVIDIA GPUs (requires `cuda` feature)
//!
//! ```toml
//! [dependencies]
//! memspace = { version = "0.1", features = ["cuda"] }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cluster;
mod worker;

// Re-export core types
pub use memspace_core::*;

// Re-export backends
pub use memspace_cpu::{CpuDriver, CpuDriverConfig, CpuDriverStats, PhysicalDevice, SimNode};
pub use memspace_cuda::{cuda_device_count, is_cuda_available, CudaDriver};

pub use cluster::LocalCluster;
pub use worker::{Worker, WorkerBuilder};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{LocalCluster, Worker, WorkerBuilder};
    pub use memspace_core::prelude::*;
    pub use memspace_cpu::{CpuDriver, CpuDriverConfig, CpuDriverStats, SimNode};
}
