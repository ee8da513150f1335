//! Host-memory implementation of [`DeviceDriver`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use memspace_core::array::DType;
use memspace_core::driver::{DeviceDriver, IpcMemHandle, NativeFill};
use memspace_core::error::{MemspaceError, Result};
use memspace_core::types::{
    AllocationHandle, Backend, ContextHandle, DeviceId, DeviceUuid, EventHandle, StreamHandle,
};

use crate::node::{SimMemory, SimNode};
use crate::stream::{SimEvent, SimStream};

/// Configuration of a [`CpuDriver`].
#[derive(Debug, Clone)]
pub struct CpuDriverConfig {
    /// Number of simulated devices when the driver creates its own node.
    pub devices: usize,
    /// Delay applied before every stream operation. Makes asynchronous
    /// ordering bugs observable in tests.
    pub stream_latency: Option<Duration>,
}

impl Default for CpuDriverConfig {
    fn default() -> Self {
        Self {
            devices: 2,
            stream_latency: None,
        }
    }
}

impl CpuDriverConfig {
    /// Set the device count.
    #[must_use]
    pub fn with_devices(mut self, devices: usize) -> Self {
        self.devices = devices;
        self
    }

    /// Set the per-operation stream latency.
    #[must_use]
    pub fn with_stream_latency(mut self, latency: Duration) -> Self {
        self.stream_latency = Some(latency);
        self
    }
}

/// Snapshot of driver call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuDriverStats {
    /// Allocations made with `alloc`.
    pub allocations: u64,
    /// Host-to-device copies.
    pub htod_copies: u64,
    /// Device-to-host copies.
    pub dtoh_copies: u64,
    /// Device-to-device copies.
    pub dtod_copies: u64,
    /// IPC handles exported.
    pub ipc_exports: u64,
    /// IPC handles imported.
    pub ipc_imports: u64,
    /// IPC mappings closed.
    pub ipc_closes: u64,
    /// Context synchronizations.
    pub device_syncs: u64,
    /// Events recorded.
    pub events_recorded: u64,
    /// Stream waits on events.
    pub event_waits: u64,
}

impl CpuDriverStats {
    /// Number of copies of any direction.
    pub fn copies(&self) -> u64 {
        self.htod_copies + self.dtoh_copies + self.dtod_copies
    }
}

#[derive(Default)]
struct Counters {
    allocations: AtomicU64,
    htod_copies: AtomicU64,
    dtoh_copies: AtomicU64,
    dtod_copies: AtomicU64,
    ipc_exports: AtomicU64,
    ipc_imports: AtomicU64,
    ipc_closes: AtomicU64,
    device_syncs: AtomicU64,
    events_recorded: AtomicU64,
    event_waits: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct SimAllocation {
    memory: SimMemory,
    alias: bool,
    exports: Vec<u64>,
}

#[derive(Default)]
struct Tables {
    contexts: HashMap<ContextHandle, DeviceId>,
    streams: HashMap<StreamHandle, Arc<SimStream>>,
    events: HashMap<EventHandle, Arc<SimEvent>>,
    allocations: HashMap<AllocationHandle, SimAllocation>,
}

thread_local! {
    // Current context per driver instance on this thread.
    static CURRENT: RefCell<HashMap<u64, ContextHandle>> = RefCell::new(HashMap::new());
}

/// Accelerator driver simulated in host memory.
///
/// Device memory is host memory; streams are threads; events are
/// completion flags. The ordering contract of [`DeviceDriver`] holds for
/// real, so stream races show up as wrong bytes.
pub struct CpuDriver {
    instance: u64,
    node: SimNode,
    visible: Vec<usize>,
    config: CpuDriverConfig,
    next_handle: AtomicU64,
    tables: Mutex<Tables>,
    counters: Counters,
}

impl CpuDriver {
    /// Create a driver on a private node with `config.devices` devices.
    pub fn new(config: CpuDriverConfig) -> Self {
        let node = SimNode::new("localhost", config.devices);
        let visible = (0..config.devices).collect();
        Self::build(node, visible, config)
    }

    /// Create a driver for a process on `node` that sees the node's
    /// physical devices `visible`, in that order.
    pub fn on_node(node: &SimNode, visible: &[usize], config: CpuDriverConfig) -> Result<Self> {
        if let Some(missing) = visible.iter().find(|i| node.device(**i).is_none()) {
            return Err(MemspaceError::InvalidConfig(format!(
                "node {} has no device {}",
                node.name(),
                missing
            )));
        }
        Ok(Self::build(node.clone(), visible.to_vec(), config))
    }

    fn build(node: SimNode, visible: Vec<usize>, config: CpuDriverConfig) -> Self {
        static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

        info!(node = node.name(), devices = visible.len(), "Creating CPU simulation driver");
        Self {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            node,
            visible,
            config,
            next_handle: AtomicU64::new(1),
            tables: Mutex::new(Tables::default()),
            counters: Counters::default(),
        }
    }

    /// The simulated machine this driver runs on.
    pub fn node(&self) -> &SimNode {
        &self.node
    }

    /// Driver call counters.
    pub fn stats(&self) -> CpuDriverStats {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        CpuDriverStats {
            allocations: load(&c.allocations),
            htod_copies: load(&c.htod_copies),
            dtoh_copies: load(&c.dtoh_copies),
            dtod_copies: load(&c.dtod_copies),
            ipc_exports: load(&c.ipc_exports),
            ipc_imports: load(&c.ipc_imports),
            ipc_closes: load(&c.ipc_closes),
            device_syncs: load(&c.device_syncs),
            events_recorded: load(&c.events_recorded),
            event_waits: load(&c.event_waits),
        }
    }

    /// Allocations (owned or aliased) currently live.
    pub fn live_allocations(&self) -> usize {
        self.tables.lock().allocations.len()
    }

    /// Context current on the calling thread.
    pub fn current_context(&self) -> Option<ContextHandle> {
        CURRENT.with(|c| c.borrow().get(&self.instance).copied())
    }

    /// Enqueue a simulated kernel that mutates an allocation in place.
    pub fn enqueue_kernel<F>(&self, stream: StreamHandle, allocation: AllocationHandle, kernel: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]) + Send + 'static,
    {
        let stream = self.stream(stream)?;
        let memory = self.memory(allocation)?;
        stream.enqueue(move || kernel(&mut memory.lock()))
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn physical(&self, device: DeviceId) -> Result<usize> {
        self.visible
            .get(device.0)
            .copied()
            .ok_or(MemspaceError::DeviceNotFound(device))
    }

    fn stream(&self, stream: StreamHandle) -> Result<Arc<SimStream>> {
        self.tables
            .lock()
            .streams
            .get(&stream)
            .cloned()
            .ok_or_else(|| MemspaceError::BackendError(format!("unknown {}", stream)))
    }

    fn memory(&self, allocation: AllocationHandle) -> Result<SimMemory> {
        self.tables
            .lock()
            .allocations
            .get(&allocation)
            .map(|a| a.memory.clone())
            .ok_or_else(|| MemspaceError::BackendError(format!("unknown {}", allocation)))
    }

    fn event(&self, event: EventHandle) -> Result<Arc<SimEvent>> {
        self.tables
            .lock()
            .events
            .get(&event)
            .cloned()
            .ok_or_else(|| MemspaceError::BackendError(format!("unknown {}", event)))
    }

    fn streams_of(&self, context: ContextHandle) -> Vec<Arc<SimStream>> {
        self.tables
            .lock()
            .streams
            .values()
            .filter(|s| s.context() == context)
            .cloned()
            .collect()
    }

    fn insert_allocation(&self, memory: SimMemory, alias: bool) -> AllocationHandle {
        let handle = AllocationHandle(self.next());
        self.tables.lock().allocations.insert(
            handle,
            SimAllocation {
                memory,
                alias,
                exports: Vec::new(),
            },
        );
        handle
    }
}

fn filled(bytes: usize, fill: &NativeFill) -> Vec<u8> {
    match fill {
        NativeFill::Uninit | NativeFill::Zeroed => vec![0u8; bytes],
        NativeFill::Pattern(pattern) if pattern.is_empty() => vec![0u8; bytes],
        NativeFill::Pattern(pattern) => pattern.iter().copied().cycle().take(bytes).collect(),
        NativeFill::UniformRandom { dtype, seed } => {
            let mut rng = StdRng::seed_from_u64(*seed);
            let mut out = Vec::with_capacity(bytes);
            match dtype {
                DType::F64 => {
                    for _ in 0..bytes / 8 {
                        out.extend_from_slice(bytemuck::bytes_of(&rng.gen::<f64>()));
                    }
                }
                _ => {
                    for _ in 0..bytes / 4 {
                        out.extend_from_slice(bytemuck::bytes_of(&rng.gen::<f32>()));
                    }
                }
            }
            out.resize(bytes, 0);
            out
        }
    }
}

impl DeviceDriver for CpuDriver {
    fn backend(&self) -> Backend {
        Backend::Cpu
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.visible.len())
    }

    fn device_uuid(&self, device: DeviceId) -> Result<DeviceUuid> {
        let index = self.physical(device)?;
        self.node
            .device(index)
            .map(|d| d.uuid)
            .ok_or(MemspaceError::DeviceNotFound(device))
    }

    fn device_name(&self, device: DeviceId) -> Result<String> {
        let index = self.physical(device)?;
        self.node
            .device(index)
            .map(|d| d.name.clone())
            .ok_or(MemspaceError::DeviceNotFound(device))
    }

    fn create_context(&self, device: DeviceId) -> Result<ContextHandle> {
        self.physical(device)?;
        let context = ContextHandle(self.next());
        self.tables.lock().contexts.insert(context, device);
        debug!(device = %device, context = %context, "Created simulated context");
        Ok(context)
    }

    fn create_stream(&self, context: ContextHandle) -> Result<StreamHandle> {
        if !self.tables.lock().contexts.contains_key(&context) {
            return Err(MemspaceError::BackendError(format!("unknown {}", context)));
        }
        let handle = StreamHandle(self.next());
        let stream = SimStream::spawn(handle, context, self.config.stream_latency)?;
        self.tables.lock().streams.insert(handle, Arc::new(stream));
        Ok(handle)
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        let removed = self.tables.lock().streams.remove(&stream);
        match removed {
            Some(stream) => {
                stream.shutdown();
                Ok(())
            }
            None => Err(MemspaceError::BackendError(format!("unknown {}", stream))),
        }
    }

    fn destroy_context(&self, context: ContextHandle) -> Result<()> {
        for stream in self.streams_of(context) {
            stream.synchronize()?;
        }
        self.tables.lock().contexts.remove(&context);
        Ok(())
    }

    fn set_current(&self, context: Option<ContextHandle>) -> Result<()> {
        CURRENT.with(|c| {
            let mut current = c.borrow_mut();
            match context {
                Some(ctx) => current.insert(self.instance, ctx),
                None => current.remove(&self.instance),
            }
        });
        Ok(())
    }

    fn synchronize_context(&self, context: ContextHandle) -> Result<()> {
        bump(&self.counters.device_syncs);
        for stream in self.streams_of(context) {
            stream.synchronize()?;
        }
        Ok(())
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> Result<()> {
        self.stream(stream)?.synchronize()
    }

    fn record_event(&self, stream: StreamHandle) -> Result<EventHandle> {
        let sim = self.stream(stream)?;
        let event = Arc::new(SimEvent::default());
        let handle = EventHandle(self.next());
        self.tables.lock().events.insert(handle, event.clone());

        sim.enqueue(move || event.fire())?;
        bump(&self.counters.events_recorded);
        Ok(handle)
    }

    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle) -> Result<()> {
        let sim = self.stream(stream)?;
        let event = self.event(event)?;
        sim.enqueue(move || event.wait())?;
        bump(&self.counters.event_waits);
        Ok(())
    }

    fn destroy_event(&self, event: EventHandle) -> Result<()> {
        self.tables.lock().events.remove(&event);
        Ok(())
    }

    fn alloc(&self, stream: StreamHandle, bytes: usize, fill: NativeFill) -> Result<AllocationHandle> {
        self.stream(stream)?;
        let memory = Arc::new(Mutex::new(filled(bytes, &fill)));
        bump(&self.counters.allocations);
        Ok(self.insert_allocation(memory, false))
    }

    fn free(&self, allocation: AllocationHandle) -> Result<()> {
        let removed = self.tables.lock().allocations.remove(&allocation);
        match removed {
            Some(a) => {
                self.node.revoke(&a.exports);
                Ok(())
            }
            None => Err(MemspaceError::BackendError(format!("unknown {}", allocation))),
        }
    }

    fn copy_htod(&self, stream: StreamHandle, src: &[u8], dst: AllocationHandle) -> Result<()> {
        let sim = self.stream(stream)?;
        let memory = self.memory(dst)?;
        if memory.lock().len() < src.len() {
            return Err(MemspaceError::BackendError(format!(
                "copy of {} bytes overflows {}",
                src.len(),
                dst
            )));
        }

        let staged = src.to_vec();
        sim.enqueue(move || memory.lock()[..staged.len()].copy_from_slice(&staged))?;
        bump(&self.counters.htod_copies);
        Ok(())
    }

    fn copy_dtoh(&self, stream: StreamHandle, src: AllocationHandle, dst: &mut [u8]) -> Result<()> {
        let sim = self.stream(stream)?;
        let memory = self.memory(src)?;
        let wanted = dst.len();

        let (tx, rx) = std::sync::mpsc::channel();
        sim.enqueue(move || {
            let bytes = memory.lock();
            let n = wanted.min(bytes.len());
            let _ = tx.send(bytes[..n].to_vec());
        })?;

        let bytes = rx
            .recv()
            .map_err(|_| MemspaceError::BackendError(format!("download from {} aborted", src)))?;
        sim.synchronize()?;
        dst[..bytes.len()].copy_from_slice(&bytes);
        bump(&self.counters.dtoh_copies);
        Ok(())
    }

    fn copy_dtod(
        &self,
        stream: StreamHandle,
        src: AllocationHandle,
        dst: AllocationHandle,
        bytes: usize,
    ) -> Result<()> {
        let sim = self.stream(stream)?;
        let from = self.memory(src)?;
        let to = self.memory(dst)?;
        let src_len = from.lock().len();
        let dst_len = to.lock().len();
        if src_len < bytes || dst_len < bytes {
            return Err(MemspaceError::BackendError(format!(
                "copy of {} bytes from {} to {} is out of bounds",
                bytes, src, dst
            )));
        }

        sim.enqueue(move || {
            // Read first: source and destination may alias the same memory.
            let data = from.lock()[..bytes].to_vec();
            to.lock()[..bytes].copy_from_slice(&data);
        })?;
        bump(&self.counters.dtod_copies);
        Ok(())
    }

    fn ipc_export(&self, allocation: AllocationHandle) -> Result<IpcMemHandle> {
        let mut tables = self.tables.lock();
        let entry = tables
            .allocations
            .get_mut(&allocation)
            .ok_or_else(|| MemspaceError::BackendError(format!("unknown {}", allocation)))?;
        if entry.alias {
            return Err(MemspaceError::BackendError(format!(
                "{} is an imported alias and cannot be re-exported",
                allocation
            )));
        }

        let (export, bytes) = self.node.export(entry.memory.clone());
        entry.exports.push(export);
        bump(&self.counters.ipc_exports);
        Ok(IpcMemHandle {
            backend: Backend::Cpu,
            bytes,
        })
    }

    fn ipc_import(&self, context: ContextHandle, handle: &IpcMemHandle) -> Result<AllocationHandle> {
        if handle.backend != Backend::Cpu {
            return Err(MemspaceError::BackendError(format!(
                "cannot import a {} handle",
                handle.backend
            )));
        }
        if !self.tables.lock().contexts.contains_key(&context) {
            return Err(MemspaceError::BackendError(format!("unknown {}", context)));
        }

        let memory = self.node.import(&handle.bytes)?;
        bump(&self.counters.ipc_imports);
        Ok(self.insert_allocation(memory, true))
    }

    fn ipc_close(&self, allocation: AllocationHandle) -> Result<()> {
        let removed = self.tables.lock().allocations.remove(&allocation);
        match removed {
            Some(a) if a.alias => {
                bump(&self.counters.ipc_closes);
                Ok(())
            }
            Some(a) => {
                // Not an alias: put it back untouched.
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

impl Drop for CpuDriver {
    fn drop(&mut self) {
        let streams: Vec<_> = self.tables.lock().streams.drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.shutdown();
        }
    }
}

impl std::fmt::Debug for CpuDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuDriver")
            .field("instance", &self.instance)
            .field("node", &self.node.name())
            .field("visible", &self.visible)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn driver(devices: usize) -> CpuDriver {
        CpuDriver::new(CpuDriverConfig::default().with_devices(devices))
    }

    fn open(d: &CpuDriver, device: usize) -> (ContextHandle, StreamHandle) {
        let ctx = d.create_context(DeviceId(device)).unwrap();
        let stream = d.create_stream(ctx).unwrap();
        (ctx, stream)
    }

    #[test]
    fn test_upload_download() {
        let d = driver(1);
        let (_, s) = open(&d, 0);
        let a = d.alloc(s, 4, NativeFill::Uninit).unwrap();
        d.copy_htod(s, &[1, 2, 3, 4], a).unwrap();

        let mut out = [0u8; 4];
        d.copy_dtoh(s, a, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(d.stats().copies(), 2);
    }

    #[test]
    fn test_native_fills() {
        let d = driver(1);
        let (_, s) = open(&d, 0);

        let ones = d.alloc(s, 8, NativeFill::Pattern(1i32.to_ne_bytes().to_vec())).unwrap();
        let mut out = [0u8; 8];
        d.copy_dtoh(s, ones, &mut out).unwrap();
        assert_eq!(bytemuck::cast_slice::<u8, i32>(&out), &[1, 1]);

        let a = d
            .alloc(s, 64, NativeFill::UniformRandom { dtype: DType::F32, seed: 7 })
            .unwrap();
        let b = d
            .alloc(s, 64, NativeFill::UniformRandom { dtype: DType::F32, seed: 7 })
            .unwrap();
        let (mut x, mut y) = ([0u8; 64], [0u8; 64]);
        d.copy_dtoh(s, a, &mut x).unwrap();
        d.copy_dtoh(s, b, &mut y).unwrap();
        assert_eq!(x, y);
        let values: Vec<f32> = bytemuck::allocation::pod_collect_to_vec(&x);
        assert!(values.iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn test_event_orders_streams() {
        let d = CpuDriver::new(
            CpuDriverConfig::default()
                .with_devices(2)
                .with_stream_latency(Duration::from_millis(1)),
        );
        let (_, s0) = open(&d, 0);
        let (_, s1) = open(&d, 1);
        let src = d.alloc(s0, 4, NativeFill::Zeroed).unwrap();
        let dst = d.alloc(s1, 4, NativeFill::Zeroed).unwrap();

        d.enqueue_kernel(s0, src, |bytes| {
            std::thread::sleep(Duration::from_millis(30));
            bytes.copy_from_slice(&[9, 9, 9, 9]);
        })
        .unwrap();
        let event = d.record_event(s0).unwrap();
        d.stream_wait_event(s1, event).unwrap();
        d.destroy_event(event).unwrap();
        d.copy_dtod(s1, src, dst, 4).unwrap();

        let mut out = [0u8; 4];
        d.copy_dtoh(s1, dst, &mut out).unwrap();
        assert_eq!(out, [9, 9, 9, 9]);
    }

    #[test]
    fn test_enqueue_returns_before_completion() {
        let d = driver(1);
        let (ctx, s) = open(&d, 0);
        let a = d.alloc(s, 1, NativeFill::Zeroed).unwrap();

        let start = Instant::now();
        d.enqueue_kernel(s, a, |_| std::thread::sleep(Duration::from_millis(50)))
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
        d.synchronize_context(ctx).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_ipc_on_same_node_aliases() {
        let node = SimNode::new("n0", 1);
        let owner = CpuDriver::on_node(&node, &[0], CpuDriverConfig::default()).unwrap();
        let peer = CpuDriver::on_node(&node, &[0], CpuDriverConfig::default()).unwrap();
        assert_eq!(
            owner.device_uuid(DeviceId(0)).unwrap(),
            peer.device_uuid(DeviceId(0)).unwrap()
        );

        let (_, s) = open(&owner, 0);
        let (pctx, ps) = open(&peer, 0);
        let a = owner.alloc(s, 2, NativeFill::Zeroed).unwrap();
        let handle = owner.ipc_export(a).unwrap();
        let alias = peer.ipc_import(pctx, &handle).unwrap();

        owner.copy_htod(s, &[4, 2], a).unwrap();
        owner.synchronize_stream(s).unwrap();
        let mut out = [0u8; 2];
        peer.copy_dtoh(ps, alias, &mut out).unwrap();
        assert_eq!(out, [4, 2]);

        peer.ipc_close(alias).unwrap();
        assert_eq!(peer.stats().ipc_closes, 1);
        assert!(peer.ipc_close(alias).is_err());
        owner.free(a).unwrap();
        assert_eq!(node.open_exports(), 0);
    }

    #[test]
    fn test_ipc_across_nodes_fails() {
        let a = CpuDriver::new(CpuDriverConfig::default().with_devices(1));
        let b = CpuDriver::new(CpuDriverConfig::default().with_devices(1));
        let (_, s) = open(&a, 0);
        let (bctx, _) = open(&b, 0);
        let alloc = a.alloc(s, 4, NativeFill::Zeroed).unwrap();
        let handle = a.ipc_export(alloc).unwrap();
        assert!(b.ipc_import(bctx, &handle).is_err());
    }

    #[test]
    fn test_current_context_is_per_thread_and_per_driver() {
        let a = driver(1);
        let b = driver(1);
        let ctx = a.create_context(DeviceId(0)).unwrap();
        a.set_current(Some(ctx)).unwrap();
        assert_eq!(a.current_context(), Some(ctx));
        assert_eq!(b.current_context(), None);
        std::thread::scope(|s| {
            s.spawn(|| assert_eq!(a.current_context(), None));
        });
        a.set_current(None).unwrap();
        assert_eq!(a.current_context(), None);
    }

    #[test]
    fn test_visible_devices_must_exist() {
        let node = SimNode::new("n0", 1);
        assert!(CpuDriver::on_node(&node, &[1], CpuDriverConfig::default()).is_err());
    }
}
