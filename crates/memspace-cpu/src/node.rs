//! Simulated physical machines.
//!
//! A [`SimNode`] stands for one physical host: its accelerators (identified
//! by uuid) and the kernel-level table that makes exported memory handles
//! resolvable by other processes on the same host. Workers created on the
//! same node can alias each other's memory through IPC handles; workers on
//! different nodes cannot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use memspace_core::error::{MemspaceError, Result};
use memspace_core::types::DeviceUuid;

/// Simulated device memory.
pub(crate) type SimMemory = Arc<Mutex<Vec<u8>>>;

/// One physical accelerator of a node.
#[derive(Debug, Clone)]
pub struct PhysicalDevice {
    /// Hardware identity.
    pub uuid: DeviceUuid,
    /// Product name.
    pub name: String,
}

struct NodeShared {
    id: u64,
    name: String,
    devices: Vec<PhysicalDevice>,
    next_export: AtomicU64,
    exports: Mutex<HashMap<u64, SimMemory>>,
}

/// A simulated physical machine. Clones refer to the same machine.
#[derive(Clone)]
pub struct SimNode {
    shared: Arc<NodeShared>,
}

impl SimNode {
    /// Create a machine with `devices` accelerators.
    pub fn new(name: impl Into<String>, devices: usize) -> Self {
        static NEXT_NODE: AtomicU64 = AtomicU64::new(1);

        let devices = (0..devices)
            .map(|i| PhysicalDevice {
                uuid: DeviceUuid::new_v4(),
                name: format!("Simulated Accelerator {}", i),
            })
            .collect();

        Self {
            shared: Arc::new(NodeShared {
                id: NEXT_NODE.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                devices,
                next_export: AtomicU64::new(1),
                exports: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Machine name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of physical accelerators.
    pub fn device_count(&self) -> usize {
        self.shared.devices.len()
    }

    /// A physical accelerator by index.
    pub fn device(&self, index: usize) -> Option<&PhysicalDevice> {
        self.shared.devices.get(index)
    }

    /// Number of currently exported handles.
    pub fn open_exports(&self) -> usize {
        self.shared.exports.lock().len()
    }

    pub(crate) fn export(&self, memory: SimMemory) -> (u64, Vec<u8>) {
        let export = self.shared.next_export.fetch_add(1, Ordering::Relaxed);
        self.shared.exports.lock().insert(export, memory);

        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&self.shared.id.to_le_bytes());
        bytes.extend_from_slice(&export.to_le_bytes());
        (export, bytes)
    }

    pub(crate) fn import(&self, bytes: &[u8]) -> Result<SimMemory> {
        if bytes.len() != 16 {
            return Err(MemspaceError::BackendError(format!(
                "malformed IPC handle ({} bytes)",
                bytes.len()
            )));
        }
        let (node, export) = bytes.split_at(8);
        let node = u64::from_le_bytes(node.try_into().map_err(|_| bad_handle())?);
        let export = u64::from_le_bytes(export.try_into().map_err(|_| bad_handle())?);

        if node != self.shared.id {
            return Err(MemspaceError::BackendError(format!(
                "IPC handle was exported on another node, not on {}",
                self.shared.name
            )));
        }

        self.shared
            .exports
            .lock()
            .get(&export)
            .cloned()
            .ok_or_else(|| MemspaceError::BackendError(format!("IPC handle {} is not open", export)))
    }

    pub(crate) fn revoke(&self, exports: &[u64]) {
        let mut table = self.shared.exports.lock();
        for export in exports {
            table.remove(export);
        }
    }
}

fn bad_handle() -> MemspaceError {
    MemspaceError::BackendError("malformed IPC handle".to_string())
}

impl std::fmt::Debug for SimNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNode")
            .field("name", &self.shared.name)
            .field("devices", &self.shared.devices.len())
            .field("open_exports", &self.open_exports())
            .finish()
    }
}
