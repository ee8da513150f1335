//! The data mover.
//!
//! A [`DataMover`] lives on one worker and produces, in a destination
//! memory space owned by that worker, the equivalent of a value that lives
//! anywhere in the cluster. Each move is classified into a
//! [`TransferRoute`] and executed along the cheapest correct path:
//!
//! | route | action |
//! |---|---|
//! | passthrough | return the value itself |
//! | host to device | allocate, enqueue upload, synchronize |
//! | device to host | drain the device, synchronizing download |
//! | device to host, remote | the owner downloads, bytes returned by value |
//! | same device | return the same allocation, correcting stream affinity |
//! | cross device | event edge, allocate, enqueue device copy |
//! | shared memory | owner exports an IPC handle, import it here |
//! | cross node | owner downloads, upload here |
//!
//! Multi-step submissions on a device stream (affinity check then sync,
//! allocate then copy) hold that device's submission lock for the sequence.
//! No two submission locks are ever held at once.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::alloc::AllocIntent;
use crate::array::{AllocationKind, DType, DeviceAllocation, DeviceArray, HostArray};
use crate::config::TransferConfig;
use crate::context::activate;
use crate::descriptor::{Location, MemorySpace};
use crate::driver::NativeFill;
use crate::error::{MemspaceError, Result};
use crate::fabric::{Fabric, IpcExport, RemoteReply};
use crate::registry::{DeviceEntry, DeviceRegistry};
use crate::route::TransferRoute;
use crate::sync::{sync_cross, sync_local};
use crate::types::WorkerId;
use crate::value::{Chunk, ChunkId, Value};

/// Pre-allocated destination of [`DataMover::move_into`].
#[derive(Debug)]
pub enum MoveTarget<'a> {
    /// Host array to overwrite.
    Host(&'a mut HostArray),
    /// Device array to overwrite.
    Device(&'a mut DeviceArray),
}

impl MoveTarget<'_> {
    fn dtype(&self) -> DType {
        match self {
            MoveTarget::Host(h) => h.dtype(),
            MoveTarget::Device(d) => d.dtype(),
        }
    }

    fn shape(&self) -> &[usize] {
        match self {
            MoveTarget::Host(h) => h.shape(),
            MoveTarget::Device(d) => d.shape(),
        }
    }
}

impl<'a> From<&'a mut HostArray> for MoveTarget<'a> {
    fn from(h: &'a mut HostArray) -> Self {
        MoveTarget::Host(h)
    }
}

impl<'a> From<&'a mut DeviceArray> for MoveTarget<'a> {
    fn from(d: &'a mut DeviceArray) -> Self {
        MoveTarget::Device(d)
    }
}

/// Per-route transfer counters.
#[derive(Debug, Default)]
struct TransferStats {
    passthrough: AtomicU64,
    host_to_host: AtomicU64,
    host_to_device: AtomicU64,
    device_to_host_local: AtomicU64,
    device_to_host_remote: AtomicU64,
    same_device: AtomicU64,
    cross_device: AtomicU64,
    shared_memory: AtomicU64,
    cross_node: AtomicU64,
    bytes_moved: AtomicU64,
    affinity_corrections: AtomicU64,
}

impl TransferStats {
    fn record(&self, route: TransferRoute, bytes: usize) {
        let counter = match route {
            TransferRoute::Passthrough => &self.passthrough,
            TransferRoute::HostToHost => &self.host_to_host,
            TransferRoute::HostToDevice => &self.host_to_device,
            TransferRoute::DeviceToHostLocal => &self.device_to_host_local,
            TransferRoute::DeviceToHostRemote => &self.device_to_host_remote,
            TransferRoute::SameDevice => &self.same_device,
            TransferRoute::CrossDevice => &self.cross_device,
            TransferRoute::SharedMemory { .. } => &self.shared_memory,
            TransferRoute::CrossNode => &self.cross_node,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes_moved.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransferStatsSnapshot {
        TransferStatsSnapshot {
            passthrough: self.passthrough.load(Ordering::Relaxed),
            host_to_host: self.host_to_host.load(Ordering::Relaxed),
            host_to_device: self.host_to_device.load(Ordering::Relaxed),
            device_to_host_local: self.device_to_host_local.load(Ordering::Relaxed),
            device_to_host_remote: self.device_to_host_remote.load(Ordering::Relaxed),
            same_device: self.same_device.load(Ordering::Relaxed),
            cross_device: self.cross_device.load(Ordering::Relaxed),
            shared_memory: self.shared_memory.load(Ordering::Relaxed),
            cross_node: self.cross_node.load(Ordering::Relaxed),
            bytes_moved: self.bytes_moved.load(Ordering::Relaxed),
            affinity_corrections: self.affinity_corrections.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a mover's transfer counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStatsSnapshot {
    /// Immutable values returned as-is.
    pub passthrough: u64,
    /// Host values moved between hosts.
    pub host_to_host: u64,
    /// Uploads.
    pub host_to_device: u64,
    /// Local downloads.
    pub device_to_host_local: u64,
    /// Downloads performed by another worker.
    pub device_to_host_remote: u64,
    /// Identity moves.
    pub same_device: u64,
    /// Copies between devices of this worker.
    pub cross_device: u64,
    /// Shared-memory imports.
    pub shared_memory: u64,
    /// Host round trips from another node.
    pub cross_node: u64,
    /// Payload bytes over all routes.
    pub bytes_moved: u64,
    /// Identity moves that had to synchronize a mismatched stream.
    pub affinity_corrections: u64,
}

impl TransferStatsSnapshot {
    /// Count for one route.
    pub fn count(&self, route: TransferRoute) -> u64 {
        match route {
            TransferRoute::Passthrough => self.passthrough,
            TransferRoute::HostToHost => self.host_to_host,
            TransferRoute::HostToDevice => self.host_to_device,
            TransferRoute::DeviceToHostLocal => self.device_to_host_local,
            TransferRoute::DeviceToHostRemote => self.device_to_host_remote,
            TransferRoute::SameDevice => self.same_device,
            TransferRoute::CrossDevice => self.cross_device,
            TransferRoute::SharedMemory { .. } => self.shared_memory,
            TransferRoute::CrossNode => self.cross_node,
        }
    }

    /// Moves over all routes.
    pub fn total_moves(&self) -> u64 {
        self.passthrough
            + self.host_to_host
            + self.host_to_device
            + self.device_to_host_local
            + self.device_to_host_remote
            + self.same_device
            + self.cross_device
            + self.shared_memory
            + self.cross_node
    }
}

#[derive(Default)]
struct ChunkStore {
    next: AtomicU64,
    values: RwLock<HashMap<ChunkId, Value>>,
}

fn payload_bytes(value: &Value) -> usize {
    match value {
        Value::Host(h) => h.size_bytes(),
        Value::Device(d) => d.size_bytes(),
        _ => 0,
    }
}

fn device_array(value: &Value) -> Result<&DeviceArray> {
    value.as_device().ok_or_else(|| {
        MemspaceError::InvalidState(format!("expected a device array, got {:?}", value.kind()))
    })
}

fn check_compatible(dtype: DType, shape: &[usize], src: &Value) -> Result<()> {
    let (src_dtype, src_shape) = match src {
        Value::Host(h) => (h.dtype(), h.shape()),
        Value::Device(d) => (d.dtype(), d.shape()),
        other => {
            return Err(MemspaceError::InvalidState(format!(
                "cannot copy a {:?} value into an array",
                other.kind()
            )))
        }
    };
    if src_dtype != dtype {
        return Err(MemspaceError::TypeMismatch {
            expected: dtype.to_string(),
            actual: src_dtype.to_string(),
        });
    }
    if src_shape != shape {
        return Err(MemspaceError::ShapeMismatch {
            expected: shape.to_vec(),
            actual: src_shape.to_vec(),
        });
    }
    Ok(())
}

/// Moves values into memory spaces owned by one worker.
pub struct DataMover {
    registry: Arc<DeviceRegistry>,
    fabric: Arc<dyn Fabric>,
    config: TransferConfig,
    chunks: ChunkStore,
    stats: TransferStats,
}

impl DataMover {
    /// Create a mover for the registry's worker.
    pub fn new(registry: Arc<DeviceRegistry>, fabric: Arc<dyn Fabric>, config: TransferConfig) -> Self {
        Self {
            registry,
            fabric,
            config,
            chunks: ChunkStore::default(),
            stats: TransferStats::default(),
        }
    }

    /// Worker this mover runs on.
    pub fn worker(&self) -> WorkerId {
        self.registry.worker()
    }

    /// Device registry of this worker.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Fabric used for remote work.
    pub fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.fabric
    }

    /// Transfer configuration.
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Transfer counters.
    pub fn stats(&self) -> TransferStatsSnapshot {
        self.stats.snapshot()
    }

    fn check_destination(&self, to: &Location) -> Result<()> {
        if to.owner() != self.worker() {
            return Err(MemspaceError::ForeignDestination {
                to: to.clone(),
                local: self.worker(),
            });
        }
        Ok(())
    }

    fn check_source(from: &Location, value: &Value) -> Result<()> {
        if let Value::Device(array) = value {
            if *from != Location::Device(array.space()) {
                return Err(MemspaceError::InvalidState(format!(
                    "device array lives in {}, not {}",
                    array.space(),
                    from
                )));
            }
        }
        Ok(())
    }

    fn origin_of(value: &Value, owner: WorkerId) -> Location {
        match value {
            Value::Device(array) => Location::Device(array.space()),
            _ => Location::Host(owner),
        }
    }

    fn route(&self, from: &Location, to: &Location, value: &Value) -> Result<TransferRoute> {
        Self::check_source(from, value)?;
        let route = TransferRoute::classify(value.kind(), from, to, &*self.fabric)?;
        Ok(if self.config.enable_ipc {
            route
        } else {
            route.without_ipc()
        })
    }

    /// Produce the equivalent of `value` (living at `from`) at `to`.
    ///
    /// `to` must be owned by this worker. Immutable values come back as the
    /// same object; a device array moved to its own space comes back as the
    /// same allocation.
    pub fn move_value(&self, from: &Location, to: &Location, value: &Value) -> Result<Value> {
        self.check_destination(to)?;

        if let Value::Chunk(chunk) = value {
            let resolved = self.resolve(chunk)?;
            let origin = Self::origin_of(&resolved, chunk.owner);
            return self.move_value(&origin, to, &resolved);
        }

        let route = self.route(from, to, value)?;
        let bytes = payload_bytes(value);
        tracing::debug!(from = %from, to = %to, route = %route, bytes, "Moving value");

        let moved = match route {
            TransferRoute::Passthrough | TransferRoute::HostToHost => value.clone(),
            TransferRoute::HostToDevice => {
                let host = value.as_host().ok_or_else(|| {
                    MemspaceError::InvalidState("expected a host array".to_string())
                })?;
                Value::Device(self.upload_to(from, self.device_space(to)?, host)?)
            }
            TransferRoute::DeviceToHostLocal => {
                Value::Host(self.download_local(device_array(value)?, to)?)
            }
            TransferRoute::DeviceToHostRemote => {
                Value::Host(self.fetch_host(device_array(value)?)?)
            }
            TransferRoute::SameDevice => {
                let array = device_array(value)?;
                self.correct_affinity(array)?;
                Value::Device(array.clone())
            }
            TransferRoute::CrossDevice => {
                Value::Device(self.copy_across(device_array(value)?, from, to)?)
            }
            TransferRoute::SharedMemory { same_device } => {
                Value::Device(self.via_shared_memory(device_array(value)?, from, to, same_device)?)
            }
            TransferRoute::CrossNode => {
                let host = self.fetch_host(device_array(value)?)?;
                let staging = Location::Host(self.worker());
                Value::Device(self.upload_to(&staging, self.device_space(to)?, &host)?)
            }
        };

        self.stats.record(route, bytes);
        Ok(moved)
    }

    fn device_space<'a>(&self, to: &'a Location) -> Result<&'a MemorySpace> {
        to.as_device()
            .ok_or_else(|| MemspaceError::InvalidState(format!("{} is not a device location", to)))
    }

    fn alloc_on(&self, entry: &DeviceEntry, bytes: usize, fill: NativeFill) -> Result<DeviceAllocation> {
        let driver = self.registry.driver();
        let handle = driver.alloc(entry.stream, bytes, fill)?;
        Ok(DeviceAllocation::new(driver.clone(), handle, bytes, AllocationKind::Owned))
    }

    fn upload_to(&self, from: &Location, space: &MemorySpace, host: &HostArray) -> Result<DeviceArray> {
        let to = Location::Device(*space);
        let entry = self.registry.entry(*space)?;
        let driver = self.registry.driver();
        let _guard = activate(&self.registry, *space)?;

        let memory = {
            let _submit = entry.submission_lock().lock();
            let memory = self
                .alloc_on(&entry, host.size_bytes(), NativeFill::Uninit)
                .map_err(|e| MemspaceError::transfer(from, &to, e))?;
            driver
                .copy_htod(entry.stream, host.as_bytes(), memory.handle())
                .map_err(|e| MemspaceError::transfer(from, &to, e))?;
            memory
        };

        if self.config.sync_after_upload {
            driver
                .synchronize_context(entry.context)
                .map_err(|e| MemspaceError::transfer(from, &to, e))?;
        }

        Ok(DeviceArray::new(
            host.dtype(),
            host.shape().to_vec(),
            *space,
            Arc::new(memory),
            Some(entry.stream),
        ))
    }

    fn upload_into(&self, from: &Location, dst: &mut DeviceArray, host: &HostArray) -> Result<()> {
        let to = Location::Device(dst.space());
        let entry = self.registry.entry(dst.space())?;
        let driver = self.registry.driver();
        let _guard = activate(&self.registry, dst.space())?;

        {
            let _submit = entry.submission_lock().lock();
            driver
                .copy_htod(entry.stream, host.as_bytes(), dst.handle())
                .map_err(|e| MemspaceError::transfer(from, &to, e))?;
        }
        dst.set_affinity(Some(entry.stream));

        if self.config.sync_after_upload {
            driver
                .synchronize_context(entry.context)
                .map_err(|e| MemspaceError::transfer(from, &to, e))?;
        }
        Ok(())
    }

    fn download_into(&self, array: &DeviceArray, to: &Location, dst: &mut [u8]) -> Result<()> {
        let from = Location::Device(array.space());
        sync_local(&self.registry, &from)?;

        let entry = self.registry.entry(array.space())?;
        let _guard = activate(&self.registry, array.space())?;
        self.registry
            .driver()
            .copy_dtoh(entry.stream, array.handle(), dst)
            .map_err(|e| MemspaceError::transfer(&from, to, e))
    }

    fn download_local(&self, array: &DeviceArray, to: &Location) -> Result<HostArray> {
        let mut host = HostArray::zeros(array.dtype(), array.shape().to_vec());
        self.download_into(array, to, host.as_bytes_mut())?;
        Ok(host)
    }

    /// Ask the owner of `array` to download it and return the bytes.
    fn fetch_host(&self, array: &DeviceArray) -> Result<HostArray> {
        let owner = array.space().owner;
        let array = array.clone();
        self.fabric
            .invoke(
                owner,
                Box::new(move |mover: &DataMover| {
                    let host = mover.download(&array)?;
                    Ok(RemoteReply::Value(Value::Host(host)))
                }),
            )?
            .into_value()?
            .into_host()
    }

    fn correct_affinity(&self, array: &DeviceArray) -> Result<()> {
        let entry = self.registry.entry(array.space())?;
        let _submit = entry.submission_lock().lock();
        if array.affinity() == Some(entry.stream) {
            return Ok(());
        }

        if self.config.warn_on_affinity_mismatch {
            tracing::warn!(
                space = %array.space(),
                affinity = ?array.affinity(),
                stream = %entry.stream,
                "Buffer stream affinity differs from device stream, synchronizing"
            );
        }
        self.stats.affinity_corrections.fetch_add(1, Ordering::Relaxed);
        sync_local(&self.registry, &Location::Device(array.space()))
    }

    fn copy_across(&self, array: &DeviceArray, from: &Location, to: &Location) -> Result<DeviceArray> {
        let space = *self.device_space(to)?;
        sync_cross(&self.registry, from, to)?;

        let entry = self.registry.entry(space)?;
        let driver = self.registry.driver();
        let _guard = activate(&self.registry, space)?;
        let bytes = array.size_bytes();

        let memory = {
            let _submit = entry.submission_lock().lock();
            let memory = self
                .alloc_on(&entry, bytes, NativeFill::Uninit)
                .map_err(|e| MemspaceError::transfer(from, to, e))?;
            driver
                .copy_dtod(entry.stream, array.handle(), memory.handle(), bytes)
                .map_err(|e| MemspaceError::transfer(from, to, e))?;
            memory
        };

        Ok(DeviceArray::new(
            array.dtype(),
            array.shape().to_vec(),
            space,
            Arc::new(memory),
            Some(entry.stream),
        ))
    }

    fn request_export(&self, array: &DeviceArray, to: &Location) -> Result<IpcExport> {
        let owner = array.space().owner;
        let array = array.clone();
        let to = to.clone();
        self.fabric
            .invoke(
                owner,
                Box::new(move |mover: &DataMover| {
                    mover.export_for(&array, &to).map(RemoteReply::Ipc)
                }),
            )?
            .into_ipc()
    }

    fn export_for(&self, array: &DeviceArray, to: &Location) -> Result<IpcExport> {
        let space = array.space();
        if space.owner != self.worker() {
            return Err(MemspaceError::ForeignDevice {
                device: space.device,
                owner: space.owner,
                local: self.worker(),
            });
        }

        let from = Location::Device(space);
        sync_local(&self.registry, &from)?;
        let handle = self
            .registry
            .driver()
            .ipc_export(array.handle())
            .map_err(|e| MemspaceError::ipc(&from, to, e))?;

        tracing::debug!(space = %space, bytes = array.size_bytes(), "Exported IPC handle");
        Ok(IpcExport {
            handle,
            dtype: array.dtype(),
            shape: array.shape().to_vec(),
            source: space,
        })
    }

    fn import_alias(&self, export: &IpcExport, space: &MemorySpace) -> Result<DeviceArray> {
        let from = Location::Device(export.source);
        let to = Location::Device(*space);
        let entry = self.registry.entry(*space)?;
        let driver = self.registry.driver();
        let _guard = activate(&self.registry, *space)?;

        let handle = driver
            .ipc_import(entry.context, &export.handle)
            .map_err(|e| MemspaceError::ipc(&from, &to, e))?;
        let memory = DeviceAllocation::new(
            driver.clone(),
            handle,
            export.size_bytes(),
            AllocationKind::IpcAlias,
        );

        Ok(DeviceArray::new(
            export.dtype,
            export.shape.clone(),
            *space,
            Arc::new(memory),
            None,
        ))
    }

    /// Copy `alias` into `dst` on the destination stream and wait for it,
    /// so the alias can be closed as soon as the caller drops it.
    fn copy_from_alias(
        &self,
        alias: &DeviceArray,
        dst: AllocationDest<'_>,
        from: &Location,
        to: &Location,
    ) -> Result<Option<DeviceAllocation>> {
        let space = alias.space();
        let entry = self.registry.entry(space)?;
        let driver = self.registry.driver();
        let _guard = activate(&self.registry, space)?;
        let bytes = alias.size_bytes();

        let fresh = {
            let _submit = entry.submission_lock().lock();
            let (target, fresh) = match dst {
                AllocationDest::Fresh => {
                    let memory = self
                        .alloc_on(&entry, bytes, NativeFill::Uninit)
                        .map_err(|e| MemspaceError::transfer(from, to, e))?;
                    (memory.handle(), Some(memory))
                }
                AllocationDest::Existing(array) => {
                    array.set_affinity(Some(entry.stream));
                    (array.handle(), None)
                }
            };
            driver
                .copy_dtod(entry.stream, alias.handle(), target, bytes)
                .map_err(|e| MemspaceError::transfer(from, to, e))?;
            fresh
        };

        driver
            .synchronize_stream(entry.stream)
            .map_err(|e| MemspaceError::transfer(from, to, e))?;
        Ok(fresh)
    }

    fn via_shared_memory(
        &self,
        array: &DeviceArray,
        from: &Location,
        to: &Location,
        same_device: bool,
    ) -> Result<DeviceArray> {
        let space = *self.device_space(to)?;
        let export = self.request_export(array, to)?;
        let alias = self.import_alias(&export, &space)?;
        if same_device {
            return Ok(alias);
        }

        let memory = self
            .copy_from_alias(&alias, AllocationDest::Fresh, from, to)?
            .ok_or_else(|| MemspaceError::InvalidState("no destination allocated".to_string()))?;
        drop(alias);

        let stream = self.registry.stream_for(space.device)?;
        Ok(DeviceArray::new(
            array.dtype(),
            array.shape().to_vec(),
            space,
            Arc::new(memory),
            Some(stream),
        ))
    }

    /// Overwrite a pre-allocated array with the contents of `src`.
    ///
    /// Element type and shape must match.
    pub fn move_into<'a>(
        &self,
        to: &Location,
        from: &Location,
        dst: impl Into<MoveTarget<'a>>,
        src: &Value,
    ) -> Result<()> {
        self.check_destination(to)?;

        if let Value::Chunk(chunk) = src {
            let resolved = self.resolve(chunk)?;
            let origin = Self::origin_of(&resolved, chunk.owner);
            return self.move_into(to, &origin, dst, &resolved);
        }

        Self::check_source(from, src)?;
        let target = dst.into();
        check_compatible(target.dtype(), target.shape(), src)?;
        let bytes = payload_bytes(src);

        let route = match target {
            MoveTarget::Host(host) => {
                if !to.is_host() {
                    return Err(MemspaceError::InvalidState(format!(
                        "host array cannot live at {}",
                        to
                    )));
                }
                self.move_into_host(from, to, host, src)?
            }
            MoveTarget::Device(array) => {
                if *to != Location::Device(array.space()) {
                    return Err(MemspaceError::InvalidState(format!(
                        "destination array lives in {}, not {}",
                        array.space(),
                        to
                    )));
                }
                self.move_into_device(from, to, array, src)?
            }
        };

        tracing::debug!(from = %from, to = %to, route = %route, bytes, "Moved value into existing array");
        self.stats.record(route, bytes);
        Ok(())
    }

    fn move_into_host(
        &self,
        from: &Location,
        to: &Location,
        dst: &mut HostArray,
        src: &Value,
    ) -> Result<TransferRoute> {
        let route = self.route(from, to, src)?;
        match route {
            TransferRoute::HostToHost => {
                let host = src
                    .as_host()
                    .ok_or_else(|| MemspaceError::InvalidState("expected a host array".to_string()))?;
                dst.as_bytes_mut().copy_from_slice(host.as_bytes());
            }
            TransferRoute::DeviceToHostLocal => {
                self.download_into(device_array(src)?, to, dst.as_bytes_mut())?;
            }
            TransferRoute::DeviceToHostRemote => {
                let host = self.fetch_host(device_array(src)?)?;
                dst.as_bytes_mut().copy_from_slice(host.as_bytes());
            }
            other => {
                return Err(MemspaceError::InvalidState(format!(
                    "route {} cannot fill a host array",
                    other
                )))
            }
        }
        Ok(route)
    }

    fn move_into_device(
        &self,
        from: &Location,
        to: &Location,
        dst: &mut DeviceArray,
        src: &Value,
    ) -> Result<TransferRoute> {
        let route = self.route(from, to, src)?;
        match route {
            TransferRoute::HostToDevice => {
                let host = src
                    .as_host()
                    .ok_or_else(|| MemspaceError::InvalidState("expected a host array".to_string()))?;
                self.upload_into(from, dst, host)?;
            }
            TransferRoute::SameDevice | TransferRoute::CrossDevice => {
                let array = device_array(src)?;
                if array.same_allocation(dst) {
                    return Ok(route);
                }
                if route == TransferRoute::SameDevice {
                    self.correct_affinity(array)?;
                } else {
                    sync_cross(&self.registry, from, to)?;
                }

                let entry = self.registry.entry(dst.space())?;
                let _guard = activate(&self.registry, dst.space())?;
                let _submit = entry.submission_lock().lock();
                self.registry
                    .driver()
                    .copy_dtod(entry.stream, array.handle(), dst.handle(), array.size_bytes())
                    .map_err(|e| MemspaceError::transfer(from, to, e))?;
                dst.set_affinity(Some(entry.stream));
            }
            TransferRoute::SharedMemory { .. } => {
                let export = self.request_export(device_array(src)?, to)?;
                let alias = self.import_alias(&export, &dst.space())?;
                self.copy_from_alias(&alias, AllocationDest::Existing(dst), from, to)?;
            }
            TransferRoute::CrossNode => {
                let host = self.fetch_host(device_array(src)?)?;
                self.upload_into(&Location::Host(self.worker()), dst, &host)?;
            }
            other => {
                return Err(MemspaceError::InvalidState(format!(
                    "route {} cannot fill a device array",
                    other
                )))
            }
        }
        Ok(route)
    }

    /// Allocate a device array filled by the backend's native routine.
    pub fn allocate(
        &self,
        space: &MemorySpace,
        dtype: DType,
        shape: &[usize],
        intent: AllocIntent,
    ) -> Result<DeviceArray> {
        self.check_destination(&Location::Device(*space))?;
        let fill = intent.native_fill(dtype)?;
        let bytes = shape.iter().product::<usize>() * dtype.size();

        let entry = self.registry.entry(*space)?;
        let _guard = activate(&self.registry, *space)?;
        let memory = {
            let _submit = entry.submission_lock().lock();
            self.alloc_on(&entry, bytes, fill)
                .map_err(|e| MemspaceError::AllocationFailed {
                    size: bytes,
                    reason: e.to_string(),
                })?
        };

        tracing::debug!(space = %space, dtype = %dtype, bytes, intent = ?intent, "Allocated device array");
        Ok(DeviceArray::new(
            dtype,
            shape.to_vec(),
            *space,
            Arc::new(memory),
            Some(entry.stream),
        ))
    }

    /// Upload a host array into a local device.
    pub fn upload(&self, space: &MemorySpace, host: &HostArray) -> Result<DeviceArray> {
        let from = Location::Host(self.worker());
        self.check_destination(&Location::Device(*space))?;
        let array = self.upload_to(&from, space, host)?;
        self.stats.record(TransferRoute::HostToDevice, host.size_bytes());
        Ok(array)
    }

    /// Download a device array, local or remote, to this worker's host.
    pub fn download(&self, array: &DeviceArray) -> Result<HostArray> {
        let from = Location::Device(array.space());
        let to = Location::Host(self.worker());
        self.move_value(&from, &to, &Value::Device(array.clone()))?
            .into_host()
    }

    /// Export a shared-memory handle for a local device array.
    pub fn export_ipc(&self, value: &Value) -> Result<IpcExport> {
        let array = device_array(value)?;
        self.export_for(array, &Location::Device(array.space()))
    }

    /// Map an exported handle into a local device. The result is an alias
    /// with untracked stream affinity, closed when its last clone drops.
    pub fn import_ipc(&self, export: &IpcExport, space: &MemorySpace) -> Result<DeviceArray> {
        self.check_destination(&Location::Device(*space))?;
        self.import_alias(export, space)
    }

    /// Store a value in this worker's chunk store.
    pub fn publish(&self, value: Value) -> Chunk {
        if let Value::Chunk(chunk) = value {
            return chunk;
        }
        let id = ChunkId(self.chunks.next.fetch_add(1, Ordering::Relaxed));
        self.chunks.values.write().insert(id, value);
        Chunk {
            owner: self.worker(),
            id,
        }
    }

    /// Look up a chunk, asking its owner when it is not local.
    pub fn resolve(&self, chunk: &Chunk) -> Result<Value> {
        if chunk.owner == self.worker() {
            return self
                .chunks
                .values
                .read()
                .get(&chunk.id)
                .cloned()
                .ok_or_else(|| MemspaceError::ChunkNotFound(chunk.to_string()));
        }

        let target = *chunk;
        self.fabric
            .invoke(
                chunk.owner,
                Box::new(move |mover: &DataMover| mover.resolve(&target).map(RemoteReply::Value)),
            )?
            .into_value()
    }

    /// Remove a chunk from its owner's store.
    pub fn retire(&self, chunk: &Chunk) -> Result<()> {
        if chunk.owner == self.worker() {
            return self
                .chunks
                .values
                .write()
                .remove(&chunk.id)
                .map(|_| ())
                .ok_or_else(|| MemspaceError::ChunkNotFound(chunk.to_string()));
        }

        let target = *chunk;
        self.fabric.invoke(
            chunk.owner,
            Box::new(move |mover: &DataMover| {
                mover.retire(&target)?;
                Ok(RemoteReply::Value(Value::Scalar(crate::value::Scalar::Bool(true))))
            }),
        )?;
        Ok(())
    }

    /// Number of values held in this worker's chunk store.
    pub fn published(&self) -> usize {
        self.chunks.values.read().len()
    }
}

enum AllocationDest<'a> {
    Fresh,
    Existing(&'a mut DeviceArray),
}

impl fmt::Debug for DataMover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataMover")
            .field("worker", &self.worker())
            .field("config", &self.config)
            .field("published", &self.published())
            .finish()
    }
}
