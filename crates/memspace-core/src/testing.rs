//! Synchronous in-memory driver for unit tests.
//!
//! Every operation completes immediately and is appended to an operation
//! log, so tests can assert on the exact sequence of driver calls.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::array::DType;
use crate::driver::{DeviceDriver, IpcMemHandle, NativeFill};
use crate::error::{MemspaceError, Result};
use crate::types::{
    AllocationHandle, Backend, ContextHandle, DeviceId, DeviceUuid, EventHandle, StreamHandle,
};

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Op {
    SetCurrent(Option<ContextHandle>),
    SyncContext(ContextHandle),
    SyncStream(StreamHandle),
    RecordEvent {
        stream: StreamHandle,
        current: Option<ContextHandle>,
    },
    WaitEvent {
        stream: StreamHandle,
        current: Option<ContextHandle>,
    },
    DestroyEvent,
    Alloc {
        stream: StreamHandle,
        bytes: usize,
    },
    Free(AllocationHandle),
    Htod(StreamHandle),
    Dtoh(StreamHandle),
    Dtod(StreamHandle),
    IpcExport,
    IpcImport,
    IpcClose(AllocationHandle),
}

#[derive(Default)]
struct Tables {
    contexts: HashMap<ContextHandle, DeviceId>,
    streams: HashMap<StreamHandle, ContextHandle>,
    events: HashSet<EventHandle>,
    memory: HashMap<AllocationHandle, Arc<Mutex<Vec<u8>>>>,
    current: HashMap<ThreadId, Option<ContextHandle>>,
}

pub(crate) struct MockDriver {
    devices: usize,
    uuids: Vec<DeviceUuid>,
    fail_count: bool,
    fail_context: Option<DeviceId>,
    next: AtomicU64,
    tables: Mutex<Tables>,
    ops: Mutex<Vec<Op>>,
}

impl MockDriver {
    pub(crate) fn new(devices: usize) -> Self {
        Self {
            devices,
            uuids: (0..devices).map(|_| DeviceUuid::new_v4()).collect(),
            fail_count: false,
            fail_context: None,
            next: AtomicU64::new(1),
            tables: Mutex::new(Tables::default()),
            ops: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn fail_device_count(mut self) -> Self {
        self.fail_count = true;
        self
    }

    pub(crate) fn fail_context_for(mut self, device: DeviceId) -> Self {
        self.fail_context = Some(device);
        self
    }

    pub(crate) fn live_contexts(&self) -> usize {
        self.tables.lock().contexts.len()
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.tables.lock().memory.len()
    }

    pub(crate) fn current_context(&self) -> Option<ContextHandle> {
        let thread = std::thread::current().id();
        self.tables.lock().current.get(&thread).copied().flatten()
    }

    pub(crate) fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    pub(crate) fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    /// Raw bytes of an allocation.
    pub(crate) fn read(&self, allocation: AllocationHandle) -> Vec<u8> {
        self.tables
            .lock()
            .memory
            .get(&allocation)
            .map(|m| m.lock().clone())
            .unwrap_or_default()
    }

    fn handle(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    fn log(&self, op: Op) {
        self.ops.lock().push(op);
    }

    fn memory(&self, allocation: AllocationHandle) -> Result<Arc<Mutex<Vec<u8>>>> {
        self.tables
            .lock()
            .memory
            .get(&allocation)
            .cloned()
            .ok_or_else(|| MemspaceError::BackendError(format!("unknown {}", allocation)))
    }

    fn check_stream(&self, stream: StreamHandle) -> Result<()> {
        if self.tables.lock().streams.contains_key(&stream) {
            Ok(())
        } else {
            Err(MemspaceError::BackendError(format!("unknown {}", stream)))
        }
    }
}

fn fill_bytes(bytes: usize, fill: &NativeFill) -> Vec<u8> {
    match fill {
        NativeFill::Uninit | NativeFill::Zeroed => vec![0; bytes],
        NativeFill::Pattern(pattern) => pattern.iter().copied().cycle().take(bytes).collect(),
        NativeFill::UniformRandom { dtype, .. } => {
            let half: Vec<u8> = match dtype {
                DType::F64 => 0.5f64.to_ne_bytes().to_vec(),
                _ => 0.5f32.to_ne_bytes().to_vec(),
            };
            half.into_iter().cycle().take(bytes).collect()
        }
    }
}

impl DeviceDriver for MockDriver {
    fn backend(&self) -> Backend {
        Backend::Cpu
    }

    fn device_count(&self) -> Result<usize> {
        if self.fail_count {
            Err(MemspaceError::BackendError("no driver".to_string()))
        } else {
            Ok(self.devices)
        }
    }

    fn device_uuid(&self, device: DeviceId) -> Result<DeviceUuid> {
        self.uuids
            .get(device.0)
            .copied()
            .ok_or(MemspaceError::DeviceNotFound(device))
    }

    fn device_name(&self, device: DeviceId) -> Result<String> {
        Ok(format!("mock-{}", device))
    }

    fn create_context(&self, device: DeviceId) -> Result<ContextHandle> {
        if self.fail_context == Some(device) {
            return Err(MemspaceError::BackendError("context creation failed".to_string()));
        }
        let ctx = ContextHandle(self.handle());
        self.tables.lock().contexts.insert(ctx, device);
        Ok(ctx)
    }

    fn create_stream(&self, context: ContextHandle) -> Result<StreamHandle> {
        let stream = StreamHandle(self.handle());
        self.tables.lock().streams.insert(stream, context);
        Ok(stream)
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        self.tables.lock().streams.remove(&stream);
        Ok(())
    }

    fn destroy_context(&self, context: ContextHandle) -> Result<()> {
        self.tables.lock().contexts.remove(&context);
        Ok(())
    }

    fn set_current(&self, context: Option<ContextHandle>) -> Result<()> {
        let thread = std::thread::current().id();
        self.tables.lock().current.insert(thread, context);
        self.log(Op::SetCurrent(context));
        Ok(())
    }

    fn synchronize_context(&self, context: ContextHandle) -> Result<()> {
        self.log(Op::SyncContext(context));
        Ok(())
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> Result<()> {
        self.log(Op::SyncStream(stream));
        Ok(())
    }

    fn record_event(&self, stream: StreamHandle) -> Result<EventHandle> {
        self.check_stream(stream)?;
        let event = EventHandle(self.handle());
        self.tables.lock().events.insert(event);
        self.log(Op::RecordEvent {
            stream,
            current: self.current_context(),
        });
        Ok(event)
    }

    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle) -> Result<()> {
        self.check_stream(stream)?;
        if !self.tables.lock().events.contains(&event) {
            return Err(MemspaceError::BackendError(format!("unknown {}", event)));
        }
        self.log(Op::WaitEvent {
            stream,
            current: self.current_context(),
        });
        Ok(())
    }

    fn destroy_event(&self, event: EventHandle) -> Result<()> {
        self.tables.lock().events.remove(&event);
        self.log(Op::DestroyEvent);
        Ok(())
    }

    fn alloc(&self, stream: StreamHandle, bytes: usize, fill: NativeFill) -> Result<AllocationHandle> {
        self.check_stream(stream)?;
        let handle = AllocationHandle(self.handle());
        self.tables
            .lock()
            .memory
            .insert(handle, Arc::new(Mutex::new(fill_bytes(bytes, &fill))));
        self.log(Op::Alloc { stream, bytes });
        Ok(handle)
    }

    fn free(&self, allocation: AllocationHandle) -> Result<()> {
        self.tables.lock().memory.remove(&allocation);
        self.log(Op::Free(allocation));
        Ok(())
    }

    fn copy_htod(&self, stream: StreamHandle, src: &[u8], dst: AllocationHandle) -> Result<()> {
        let memory = self.memory(dst)?;
        let mut bytes = memory.lock();
        if src.len() > bytes.len() {
            return Err(MemspaceError::BackendError("copy exceeds allocation".to_string()));
        }
        bytes[..src.len()].copy_from_slice(src);
        self.log(Op::Htod(stream));
        Ok(())
    }

    fn copy_dtoh(&self, stream: StreamHandle, src: AllocationHandle, dst: &mut [u8]) -> Result<()> {
        let memory = self.memory(src)?;
        let bytes = memory.lock();
        let n = dst.len().min(bytes.len());
        dst[..n].copy_from_slice(&bytes[..n]);
        self.log(Op::Dtoh(stream));
        Ok(())
    }

    fn copy_dtod(
        &self,
        stream: StreamHandle,
        src: AllocationHandle,
        dst: AllocationHandle,
        bytes: usize,
    ) -> Result<()> {
        let data = self.memory(src)?.lock()[..bytes].to_vec();
        self.memory(dst)?.lock()[..bytes].copy_from_slice(&data);
        self.log(Op::Dtod(stream));
        Ok(())
    }

    fn ipc_export(&self, allocation: AllocationHandle) -> Result<IpcMemHandle> {
        self.memory(allocation)?;
        self.log(Op::IpcExport);
        Ok(IpcMemHandle {
            backend: Backend::Cpu,
            bytes: allocation.raw().to_le_bytes().to_vec(),
        })
    }

    fn ipc_import(&self, _context: ContextHandle, handle: &IpcMemHandle) -> Result<AllocationHandle> {
        let raw: [u8; 8] = handle
            .bytes
            .as_slice()
            .try_into()
            .map_err(|_| MemspaceError::BackendError("bad handle".to_string()))?;
        let memory = self.memory(AllocationHandle(u64::from_le_bytes(raw)))?;
        let alias = AllocationHandle(self.handle());
        self.tables.lock().memory.insert(alias, memory);
        self.log(Op::IpcImport);
        Ok(alias)
    }

    fn ipc_close(&self, allocation: AllocationHandle) -> Result<()> {
        self.tables.lock().memory.remove(&allocation);
        self.log(Op::IpcClose(allocation));
        Ok(())
    }
}
