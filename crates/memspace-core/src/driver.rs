//! Native driver abstraction.
//!
//! Every accelerator backend implements [`DeviceDriver`]. The trait is
//! object-safe and speaks only in opaque handles, so the registry, the
//! synchronization bridge and the data mover are written once against
//! `Arc<dyn DeviceDriver>`.
//!
//! # Ordering contract
//!
//! - `alloc`, `copy_htod`, `copy_dtod` and `record_event` only enqueue work
//!   on the given stream. Work on one stream runs in issue order.
//! - `copy_dtoh`, `synchronize_stream`, `synchronize_context` block the
//!   caller until the relevant work is complete.
//! - `stream_wait_event` makes all later work on the stream wait for the
//!   event without blocking the caller or any other stream.

use serde::{Deserialize, Serialize};

use crate::array::DType;
use crate::error::Result;
use crate::types::{
    AllocationHandle, Backend, ContextHandle, DeviceId, DeviceUuid, EventHandle, StreamHandle,
};

/// How a fresh allocation is initialized by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeFill {
    /// Leave contents undefined.
    Uninit,
    /// Zero every byte.
    Zeroed,
    /// Repeat this byte pattern (one element wide) across the buffer.
    Pattern(Vec<u8>),
    /// Fill with uniform random values in the unit interval of the given
    /// type. Whether 0 or 1 is reachable depends on the backend generator.
    UniformRandom {
        /// Element type to generate.
        dtype: DType,
        /// Generator seed.
        seed: u64,
    },
}

/// Exported inter-process memory handle.
///
/// The contents are opaque and backend-defined; the handle is only valid
/// for importers on the same physical node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcMemHandle {
    /// Backend that produced the handle.
    pub backend: Backend,
    /// Raw handle bytes.
    pub bytes: Vec<u8>,
}

/// Native accelerator driver used by a single worker process.
pub trait DeviceDriver: Send + Sync + 'static {
    /// Backend kind.
    fn backend(&self) -> Backend;

    /// Number of locally visible devices.
    fn device_count(&self) -> Result<usize>;

    /// Hardware identity of a device.
    fn device_uuid(&self, device: DeviceId) -> Result<DeviceUuid>;

    /// Human-readable device name.
    fn device_name(&self, device: DeviceId) -> Result<String>;

    /// Create the execution context for a device.
    fn create_context(&self, device: DeviceId) -> Result<ContextHandle>;

    /// Create a command stream inside a context.
    fn create_stream(&self, context: ContextHandle) -> Result<StreamHandle>;

    /// Destroy a stream created by `create_stream`.
    fn destroy_stream(&self, stream: StreamHandle) -> Result<()>;

    /// Destroy a context created by `create_context`.
    fn destroy_context(&self, context: ContextHandle) -> Result<()>;

    /// Make a context current on the calling thread, or clear it.
    fn set_current(&self, context: Option<ContextHandle>) -> Result<()>;

    /// Block until all work on every stream of the context has completed.
    fn synchronize_context(&self, context: ContextHandle) -> Result<()>;

    /// Block until all work on the stream has completed.
    fn synchronize_stream(&self, stream: StreamHandle) -> Result<()>;

    /// Record an event capturing all work enqueued on `stream` so far.
    fn record_event(&self, stream: StreamHandle) -> Result<EventHandle>;

    /// Make later work on `stream` wait for `event`.
    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle) -> Result<()>;

    /// Release an event. Waits already enqueued on it remain valid.
    fn destroy_event(&self, event: EventHandle) -> Result<()>;

    /// Allocate `bytes` on the stream's device, initialized by the driver's
    /// native routine for `fill`.
    fn alloc(&self, stream: StreamHandle, bytes: usize, fill: NativeFill)
        -> Result<AllocationHandle>;

    /// Release an allocation obtained from `alloc`.
    fn free(&self, allocation: AllocationHandle) -> Result<()>;

    /// Enqueue a host-to-device copy of `src` into the start of `dst`.
    fn copy_htod(&self, stream: StreamHandle, src: &[u8], dst: AllocationHandle) -> Result<()>;

    /// Copy the first `dst.len()` bytes of `src` into `dst`, returning once
    /// the bytes are on the host.
    fn copy_dtoh(&self, stream: StreamHandle, src: AllocationHandle, dst: &mut [u8]) -> Result<()>;

    /// Enqueue a copy of `bytes` from `src` to `dst`. The allocations may
    /// live on different devices of this process.
    fn copy_dtod(
        &self,
        stream: StreamHandle,
        src: AllocationHandle,
        dst: AllocationHandle,
        bytes: usize,
    ) -> Result<()>;

    /// Export an inter-process handle for an allocation.
    fn ipc_export(&self, allocation: AllocationHandle) -> Result<IpcMemHandle>;

    /// Map an exported handle into this process under `context`.
    fn ipc_import(&self, context: ContextHandle, handle: &IpcMemHandle) -> Result<AllocationHandle>;

    /// Unmap an allocation obtained from `ipc_import`.
    fn ipc_close(&self, allocation: AllocationHandle) -> Result<()>;
}
