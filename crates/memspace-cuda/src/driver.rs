//! CUDA implementation of [`DeviceDriver`] on the raw driver API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use cudarc::curand::result as curand_result;
use cudarc::curand::sys as curand_sys;
use cudarc::driver::result as cuda_result;
use cudarc::driver::sys as cuda_sys;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use memspace_core::driver::{DeviceDriver, IpcMemHandle, NativeFill};
use memspace_core::error::{MemspaceError, Result};
use memspace_core::array::DType;
use memspace_core::types::{
    AllocationHandle, Backend, ContextHandle, DeviceId, DeviceUuid, EventHandle, StreamHandle,
};

const IPC_HANDLE_BYTES: usize = 64;

fn backend_err(what: &str, e: impl std::fmt::Debug) -> MemspaceError {
    MemspaceError::BackendError(format!("{}: {:?}", what, e))
}

fn check(what: &str, result: cuda_sys::CUresult) -> Result<()> {
    if result == cuda_sys::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(backend_err(what, result))
    }
}

struct Context {
    device: cuda_sys::CUdevice,
    raw: cuda_sys::CUcontext,
}

struct Allocation {
    ptr: cuda_sys::CUdeviceptr,
    bytes: usize,
    /// Context the pointer was allocated or mapped in.
    context: ContextHandle,
    imported: bool,
}

#[derive(Default)]
struct Tables {
    contexts: HashMap<ContextHandle, Context>,
    streams: HashMap<StreamHandle, (cuda_sys::CUstream, ContextHandle)>,
    events: HashMap<EventHandle, cuda_sys::CUevent>,
    allocations: HashMap<AllocationHandle, Allocation>,
}

// Raw CUDA handles are process-global and usable from any thread once the
// owning context is current.
unsafe impl Send for Tables {}

/// CUDA driver for one worker process.
///
/// Uses the primary context of each device and non-blocking streams.
/// Callers make the owning context current (see
/// [`memspace_core::context::activate`]) before stream operations.
pub struct CudaDriver {
    next_handle: AtomicU64,
    tables: Mutex<Tables>,
}

impl CudaDriver {
    /// Initialize the CUDA driver API.
    pub fn new() -> Result<Self> {
        cuda_result::init().map_err(|e| {
            MemspaceError::BackendUnavailable(format!("CUDA driver init failed: {:?}", e))
        })?;
        info!("CUDA driver initialized");
        Ok(Self {
            next_handle: AtomicU64::new(1),
            tables: Mutex::new(Tables::default()),
        })
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn cu_device(device: DeviceId) -> Result<cuda_sys::CUdevice> {
        cuda_result::device::get(device.0 as i32).map_err(|_| MemspaceError::DeviceNotFound(device))
    }

    fn raw_stream(&self, stream: StreamHandle) -> Result<cuda_sys::CUstream> {
        self.stream_entry(stream).map(|(raw, _)| raw)
    }

    fn stream_entry(&self, stream: StreamHandle) -> Result<(cuda_sys::CUstream, ContextHandle)> {
        self.tables
            .lock()
            .streams
            .get(&stream)
            .copied()
            .ok_or_else(|| MemspaceError::BackendError(format!("unknown {}", stream)))
    }

    fn raw_context(&self, context: ContextHandle) -> Result<cuda_sys::CUcontext> {
        self.tables
            .lock()
            .contexts
            .get(&context)
            .map(|c| c.raw)
            .ok_or_else(|| MemspaceError::BackendError(format!("unknown {}", context)))
    }

    fn device_ptr(&self, allocation: AllocationHandle) -> Result<(cuda_sys::CUdeviceptr, usize)> {
        self.tables
            .lock()
            .allocations
            .get(&allocation)
            .map(|a| (a.ptr, a.bytes))
            .ok_or_else(|| MemspaceError::BackendError(format!("unknown {}", allocation)))
    }

    fn insert_allocation(
        &self,
        ptr: cuda_sys::CUdeviceptr,
        bytes: usize,
        context: ContextHandle,
        imported: bool,
    ) -> AllocationHandle {
        let handle = AllocationHandle(self.next());
        self.tables.lock().allocations.insert(
            handle,
            Allocation {
                ptr,
                bytes,
                context,
                imported,
            },
        );
        handle
    }

    /// Run `f` with `context` current on the calling thread, then restore
    /// whatever was current before.
    ///
    /// Allocations may be released from any thread, including threads that
    /// never activated a device.
    fn with_bound<R>(&self, context: ContextHandle, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let raw = self.raw_context(context)?;
        let previous = cuda_result::ctx::get_current().map_err(|e| backend_err("cuCtxGetCurrent", e))?;
        unsafe { cuda_result::ctx::set_current(raw) }.map_err(|e| backend_err("cuCtxSetCurrent", e))?;
        let out = f();
        let restored = unsafe { cuda_result::ctx::set_current(previous.unwrap_or(std::ptr::null_mut())) }
            .map_err(|e| backend_err("cuCtxSetCurrent", e));
        let out = out?;
        restored?;
        Ok(out)
    }

    /// Number of live allocations and imported aliases.
    pub fn live_allocations(&self) -> usize {
        self.tables.lock().allocations.len()
    }
}

/// Enqueue `fill` over the first `bytes` of `ptr` on `stream`.
///
/// Patterns of 1, 2 and 4 bytes map to the matching memset width. 8-byte
/// patterns are written as two strided 32-bit memsets, one per word.
fn fill_on_stream(
    ptr: cuda_sys::CUdeviceptr,
    bytes: usize,
    fill: &NativeFill,
    stream: cuda_sys::CUstream,
) -> Result<()> {
    if bytes == 0 {
        return Ok(());
    }
    match fill {
        NativeFill::Uninit => Ok(()),
        NativeFill::Zeroed => unsafe { cuda_result::memset_d8_async(ptr, 0, bytes, stream) }
            .map_err(|e| backend_err("cuMemsetD8Async", e)),
        NativeFill::Pattern(pattern) => match pattern.as_slice() {
            [] => unsafe { cuda_result::memset_d8_async(ptr, 0, bytes, stream) }
                .map_err(|e| backend_err("cuMemsetD8Async", e)),
            [b] => check("cuMemsetD8Async", unsafe {
                cuda_sys::cuMemsetD8Async(ptr, *b, bytes, stream)
            }),
            [a, b] => check("cuMemsetD16Async", unsafe {
                cuda_sys::cuMemsetD16Async(ptr, u16::from_ne_bytes([*a, *b]), bytes / 2, stream)
            }),
            [a, b, c, d] => check("cuMemsetD32Async", unsafe {
                cuda_sys::cuMemsetD32Async(ptr, u32::from_ne_bytes([*a, *b, *c, *d]), bytes / 4, stream)
            }),
            [a, b, c, d, e, f, g, h] => {
                let rows = bytes / 8;
                let low = u32::from_ne_bytes([*a, *b, *c, *d]);
                let high = u32::from_ne_bytes([*e, *f, *g, *h]);
                check("cuMemsetD2D32Async", unsafe {
                    cuda_sys::cuMemsetD2D32Async(ptr, 8, low, 1, rows, stream)
                })?;
                check("cuMemsetD2D32Async", unsafe {
                    cuda_sys::cuMemsetD2D32Async(ptr + 4, 8, high, 1, rows, stream)
                })
            }
            other => Err(MemspaceError::NotSupported(format!(
                "{}-byte fill pattern",
                other.len()
            ))),
        },
        NativeFill::UniformRandom { dtype, seed } => uniform_random(ptr, bytes, *dtype, *seed, stream),
    }
}

fn uniform_random(
    ptr: cuda_sys::CUdeviceptr,
    bytes: usize,
    dtype: DType,
    seed: u64,
    stream: cuda_sys::CUstream,
) -> Result<()> {
    let generator = curand_result::create_generator().map_err(|e| backend_err("curandCreateGenerator", e))?;
    let generated = unsafe {
        curand_result::set_seed(generator, seed)
            .and_then(|_| curand_result::set_stream(generator, stream as curand_sys::cudaStream_t))
            .and_then(|_| match dtype {
                DType::F64 => curand_result::generate::uniform_f64(generator, ptr as *mut f64, bytes / 8),
                _ => curand_result::generate::uniform_f32(generator, ptr as *mut f32, bytes / 4),
            })
    }
    .map_err(|e| backend_err("curandGenerateUniform", e));
    // The generator's state must outlive the enqueued kernel.
    let drained = unsafe { cuda_result::stream::synchronize(stream) }
        .map_err(|e| backend_err("cuStreamSynchronize", e));
    let _ = unsafe { curand_result::destroy_generator(generator) };
    generated?;
    drained
}

impl DeviceDriver for CudaDriver {
    fn backend(&self) -> Backend {
        Backend::Cuda
    }

    fn device_count(&self) -> Result<usize> {
        cuda_result::device::get_count()
            .map(|n| n as usize)
            .map_err(|e| backend_err("cuDeviceGetCount", e))
    }

    fn device_uuid(&self, device: DeviceId) -> Result<DeviceUuid> {
        let dev = Self::cu_device(device)?;
        let uuid = cuda_result::device::get_uuid(dev).map_err(|e| backend_err("cuDeviceGetUuid", e))?;
        let mut bytes = [0u8; 16];
        for (b, c) in bytes.iter_mut().zip(uuid.bytes.iter()) {
            *b = *c as u8;
        }
        Ok(DeviceUuid::from_bytes(bytes))
    }

    fn device_name(&self, device: DeviceId) -> Result<String> {
        let dev = Self::cu_device(device)?;
        cuda_result::device::get_name(dev).map_err(|e| backend_err("cuDeviceGetName", e))
    }

    fn create_context(&self, device: DeviceId) -> Result<ContextHandle> {
        let dev = Self::cu_device(device)?;
        let raw = unsafe { cuda_result::primary_ctx::retain(dev) }
            .map_err(|e| backend_err("cuDevicePrimaryCtxRetain", e))?;
        let handle = ContextHandle(self.next());
        self.tables.lock().contexts.insert(handle, Context { device: dev, raw });
        debug!(device = %device, context = %handle, "Retained primary context");
        Ok(handle)
    }

    fn create_stream(&self, context: ContextHandle) -> Result<StreamHandle> {
        let raw = self.with_bound(context, || {
            cuda_result::stream::create(cuda_result::stream::StreamKind::NonBlocking)
                .map_err(|e| backend_err("cuStreamCreate", e))
        })?;
        let handle = StreamHandle(self.next());
        self.tables.lock().streams.insert(handle, (raw, context));
        Ok(handle)
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        let removed = self.tables.lock().streams.remove(&stream);
        match removed {
            Some((raw, _)) => unsafe { cuda_result::stream::destroy(raw) }
                .map_err(|e| backend_err("cuStreamDestroy", e)),
            None => Err(MemspaceError::BackendError(format!("unknown {}", stream))),
        }
    }

    fn destroy_context(&self, context: ContextHandle) -> Result<()> {
        let removed = self.tables.lock().contexts.remove(&context);
        match removed {
            Some(ctx) => unsafe { cuda_result::primary_ctx::release(ctx.device) }
                .map_err(|e| backend_err("cuDevicePrimaryCtxRelease", e)),
            None => Err(MemspaceError::BackendError(format!("unknown {}", context))),
        }
    }

    fn set_current(&self, context: Option<ContextHandle>) -> Result<()> {
        let raw = match context {
            Some(ctx) => self.raw_context(ctx)?,
            None => std::ptr::null_mut(),
        };
        unsafe { cuda_result::ctx::set_current(raw) }.map_err(|e| backend_err("cuCtxSetCurrent", e))
    }

    fn synchronize_context(&self, context: ContextHandle) -> Result<()> {
        self.with_bound(context, || {
            cuda_result::ctx::synchronize().map_err(|e| backend_err("cuCtxSynchronize", e))
        })
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> Result<()> {
        let raw = self.raw_stream(stream)?;
        unsafe { cuda_result::stream::synchronize(raw) }.map_err(|e| backend_err("cuStreamSynchronize", e))
    }

    fn record_event(&self, stream: StreamHandle) -> Result<EventHandle> {
        let raw_stream = self.raw_stream(stream)?;
        let event = cuda_result::event::create(cuda_sys::CUevent_flags::CU_EVENT_DISABLE_TIMING)
            .map_err(|e| backend_err("cuEventCreate", e))?;
        if let Err(e) = unsafe { cuda_result::event::record(event, raw_stream) } {
            let _ = unsafe { cuda_result::event::destroy(event) };
            return Err(backend_err("cuEventRecord", e));
        }
        let handle = EventHandle(self.next());
        self.tables.lock().events.insert(handle, event);
        Ok(handle)
    }

    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle) -> Result<()> {
        let raw_stream = self.raw_stream(stream)?;
        let raw_event = self
            .tables
            .lock()
            .events
            .get(&event)
            .copied()
            .ok_or_else(|| MemspaceError::BackendError(format!("unknown {}", event)))?;
        unsafe {
            cuda_result::stream::wait_event(
                raw_stream,
                raw_event,
                cuda_sys::CUevent_wait_flags::CU_EVENT_WAIT_DEFAULT,
            )
        }
        .map_err(|e| backend_err("cuStreamWaitEvent", e))
    }

    fn destroy_event(&self, event: EventHandle) -> Result<()> {
        if let Some(raw) = self.tables.lock().events.remove(&event) {
            unsafe { cuda_result::event::destroy(raw) }.map_err(|e| backend_err("cuEventDestroy", e))?;
        }
        Ok(())
    }

    fn alloc(&self, stream: StreamHandle, bytes: usize, fill: NativeFill) -> Result<AllocationHandle> {
        let (raw_stream, context) = self.stream_entry(stream)?;
        // cuIpcGetMemHandle rejects pool allocations, so no cuMemAllocAsync.
        // Zero-sized allocations still get a distinct pointer.
        let size = bytes.max(1);
        let ptr = self.with_bound(context, || {
            let ptr = unsafe { cuda_result::malloc_sync(size) }.map_err(|e| backend_err("cuMemAlloc", e))?;
            if let Err(e) = fill_on_stream(ptr, bytes, &fill, raw_stream) {
                let _ = unsafe { cuda_result::free_sync(ptr) };
                return Err(e);
            }
            Ok(ptr)
        })?;
        Ok(self.insert_allocation(ptr, bytes, context, false))
    }

    fn free(&self, allocation: AllocationHandle) -> Result<()> {
        let removed = self.tables.lock().allocations.remove(&allocation);
        match removed {
            Some(a) => self.with_bound(a.context, || {
                unsafe { cuda_result::free_sync(a.ptr) }.map_err(|e| backend_err("cuMemFree", e))
            }),
            None => Err(MemspaceError::BackendError(format!("unknown {}", allocation))),
        }
    }

    fn copy_htod(&self, stream: StreamHandle, src: &[u8], dst: AllocationHandle) -> Result<()> {
        let raw_stream = self.raw_stream(stream)?;
        let (ptr, bytes) = self.device_ptr(dst)?;
        if src.len() > bytes {
            return Err(MemspaceError::BackendError(format!(
                "copy of {} bytes overflows {}",
                src.len(),
                dst
            )));
        }
        // Pageable source: the stream is drained before the slice is released.
        unsafe {
            cuda_result::memcpy_htod_async(ptr, src, raw_stream)
                .and_then(|_| cuda_result::stream::synchronize(raw_stream))
        }
        .map_err(|e| backend_err("cuMemcpyHtoDAsync", e))
    }

    fn copy_dtoh(&self, stream: StreamHandle, src: AllocationHandle, dst: &mut [u8]) -> Result<()> {
        let raw_stream = self.raw_stream(stream)?;
        let (ptr, bytes) = self.device_ptr(src)?;
        let n = dst.len().min(bytes);
        unsafe {
            cuda_result::memcpy_dtoh_async(&mut dst[..n], ptr, raw_stream)
                .and_then(|_| cuda_result::stream::synchronize(raw_stream))
        }
        .map_err(|e| backend_err("cuMemcpyDtoHAsync", e))
    }

    fn copy_dtod(
        &self,
        stream: StreamHandle,
        src: AllocationHandle,
        dst: AllocationHandle,
        bytes: usize,
    ) -> Result<()> {
        let raw_stream = self.raw_stream(stream)?;
        let (from, _) = self.device_ptr(src)?;
        let (to, _) = self.device_ptr(dst)?;
        unsafe { cuda_result::memcpy_dtod_async(to, from, bytes, raw_stream) }
            .map_err(|e| backend_err("cuMemcpyDtoDAsync", e))
    }

    fn ipc_export(&self, allocation: AllocationHandle) -> Result<IpcMemHandle> {
        let (ptr, context) = {
            let tables = self.tables.lock();
            let a = tables
                .allocations
                .get(&allocation)
                .ok_or_else(|| MemspaceError::BackendError(format!("unknown {}", allocation)))?;
            (a.ptr, a.context)
        };
        let mut handle = std::mem::MaybeUninit::<cuda_sys::CUipcMemHandle>::zeroed();
        self.with_bound(context, || {
            check("cuIpcGetMemHandle", unsafe {
                cuda_sys::cuIpcGetMemHandle(handle.as_mut_ptr(), ptr)
            })
        })?;
        let handle = unsafe { handle.assume_init() };
        Ok(IpcMemHandle {
            backend: Backend::Cuda,
            bytes: handle.reserved.iter().map(|c| *c as u8).collect(),
        })
    }

    fn ipc_import(&self, context: ContextHandle, handle: &IpcMemHandle) -> Result<AllocationHandle> {
        if handle.backend != Backend::Cuda || handle.bytes.len() != IPC_HANDLE_BYTES {
            return Err(MemspaceError::BackendError("malformed CUDA IPC handle".to_string()));
        }
        let mut raw = unsafe { std::mem::zeroed::<cuda_sys::CUipcMemHandle>() };
        for (dst, src) in raw.reserved.iter_mut().zip(&handle.bytes) {
            *dst = *src as _;
        }
        let mut ptr: cuda_sys::CUdeviceptr = 0;
        self.with_bound(context, || {
            check("cuIpcOpenMemHandle", unsafe {
                cuda_sys::cuIpcOpenMemHandle_v2(
                    &mut ptr,
                    raw,
                    cuda_sys::CUipcMem_flags::CU_IPC_MEM_LAZY_ENABLE_PEER_ACCESS as u32,
                )
            })
        })?;
        // Mapped size is not carried by the handle.
        Ok(self.insert_allocation(ptr, usize::MAX, context, true))
    }

    fn ipc_close(&self, allocation: AllocationHandle) -> Result<()> {
        let removed = self.tables.lock().allocations.remove(&allocation);
        match removed {
            Some(a) if a.imported => self.with_bound(a.context, || {
                check("cuIpcCloseMemHandle", unsafe { cuda_sys::cuIpcCloseMemHandle(a.ptr) })
            }),
            Some(a) => {
                self.tables.lock().allocations.insert(allocation, a);
                Err(MemspaceError::BackendError(format!(
                    "{} is not an imported alias",
                    allocation
                )))
            }
            None => Err(MemspaceError::BackendError(format!("unknown {}", allocation))),
        }
    }
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        let tables = std::mem::take(&mut *self.tables.lock());
        if !tables.allocations.is_empty() {
            warn!(
                allocations = tables.allocations.len(),
                "CUDA driver dropped with live allocations"
            );
        }
        for (_, event) in tables.events {
            let _ = unsafe { cuda_result::event::destroy(event) };
        }
        for (_, (stream, _)) in tables.streams {
            let _ = unsafe { cuda_result::stream::destroy(stream) };
        }
        for (_, ctx) in tables.contexts {
            let _ = unsafe { cuda_result::primary_ctx::release(ctx.device) };
        }
    }
}

impl std::fmt::Debug for CudaDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("CudaDriver")
            .field("contexts", &tables.contexts.len())
            .field("streams", &tables.streams.len())
            .field("allocations", &tables.allocations.len())
            .finish()
    }
}
