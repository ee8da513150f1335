//! # memspace core
//!
//! Memory placement and data movement for distributed multi-accelerator
//! task execution.
//!
//! A value lives in a memory space: the host RAM of a worker, or the VRAM
//! of one device owned by one worker. When a task needs it somewhere else,
//! the [`DataMover`](mover::DataMover) produces an equivalent value there
//! along the cheapest correct path, keeping producer/consumer ordering
//! between asynchronous device streams intact.
//!
//! ## Core Abstractions
//!
//! - [`DeviceDriver`](driver::DeviceDriver) - native backend, spoken to
//!   through opaque handles
//! - [`DeviceRegistry`](registry::DeviceRegistry) - per-worker contexts and
//!   streams
//! - [`Processor`] / [`MemorySpace`] - execution and placement descriptors
//! - [`with_context`](context::with_context) - scoped device activation
//! - [`sync_cross`](sync::sync_cross) - event edges between streams
//! - [`ExecutionAdapter`](execution::ExecutionAdapter) - runs task closures
//!   on a device with explicit scheduler state
//!
//! ## Example
//!
//! ```ignore
//! use memspace_core::prelude::*;
//!
//! let registry = DeviceRegistry::with_driver(WorkerId(0), driver, &RegistryConfig::default())?;
//! let fabric = Arc::new(Standalone::new(WorkerId(0), NodeId::local()));
//! let mover = DataMover::new(registry.clone(), fabric, TransferConfig::default());
//!
//! let space = registry.memory_spaces()[0];
//! let host = Value::Host(HostArray::from_vec(vec![1.0f32, 2.0, 3.0]));
//! let on_device = mover.move_value(&Location::Host(WorkerId(0)), &space.into(), &host)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod alloc;
pub mod array;
pub mod backend_stub;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod execution;
pub mod fabric;
pub mod mover;
pub mod registry;
pub mod route;
pub mod routines;
pub mod sync;
pub mod types;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::alloc::AllocIntent;
    pub use crate::array::{AllocationKind, DType, DeviceAllocation, DeviceArray, Element, HostArray};
    pub use crate::config::{
        ConfigBuilder, ExecutionConfig, MemspaceConfig, RegistryConfig, TransferConfig,
    };
    pub use crate::context::{activate, current, current_stream, with_context, Activation, ContextGuard};
    pub use crate::descriptor::{AsDevice, Device, Location, MemorySpace, Processor};
    pub use crate::driver::{DeviceDriver, IpcMemHandle, NativeFill};
    pub use crate::error::{MemspaceError, Result};
    pub use crate::execution::{BoxError, ExecutionAdapter, FailureCause, TaskContext, TaskFailure};
    pub use crate::fabric::{
        Fabric, IpcExport, RemoteInvoker, RemoteJob, RemoteReply, Standalone, Topology,
    };
    pub use crate::mover::{DataMover, MoveTarget, TransferStatsSnapshot};
    pub use crate::registry::{DeviceEntry, DeviceRegistry};
    pub use crate::route::TransferRoute;
    pub use crate::routines::RoutineTable;
    pub use crate::sync::{sync_cross, sync_local, StreamEvent};
    pub use crate::types::{
        AllocationHandle, Backend, ContextHandle, DeviceId, DeviceUuid, EventHandle, NodeId,
        RegistryId, StreamHandle, WorkerId,
    };
    pub use crate::value::{Chunk, ChunkId, Scalar, Value, ValueKind};
}

pub use descriptor::{Location, MemorySpace, Processor};
pub use error::{MemspaceError, Result};
