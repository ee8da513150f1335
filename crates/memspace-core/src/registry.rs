//! Per-worker device registry.
//!
//! The registry owns the process-wide execution context and default
//! command stream of every device visible to one worker. It is an explicit
//! object with an `init()`/`shutdown()` lifecycle; components that need
//! device resources hold an `Arc<DeviceRegistry>`.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::RegistryConfig;
use crate::descriptor::{AsDevice, Device, MemorySpace, Processor};
use crate::driver::DeviceDriver;
use crate::error::{MemspaceError, Result};
use crate::types::{Backend, ContextHandle, DeviceId, DeviceUuid, RegistryId, StreamHandle, WorkerId};

/// Resources of one registered device.
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    /// Device description.
    pub device: Device,
    /// Execution context.
    pub context: ContextHandle,
    /// Default command stream.
    pub stream: StreamHandle,
    submission: Arc<Mutex<()>>,
}

impl DeviceEntry {
    /// Lock serializing multi-step submission sequences on this device's
    /// stream. Hold it for one sequence only, and never two at once.
    pub fn submission_lock(&self) -> &Mutex<()> {
        &self.submission
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    ShutDown,
}

struct RegistryState {
    lifecycle: Lifecycle,
    devices: BTreeMap<DeviceId, DeviceEntry>,
}

/// Devices, contexts and streams of one worker.
pub struct DeviceRegistry {
    id: RegistryId,
    worker: WorkerId,
    driver: Arc<dyn DeviceDriver>,
    config: RegistryConfig,
    state: RwLock<RegistryState>,
}

impl DeviceRegistry {
    /// Create an uninitialized registry.
    pub fn new(worker: WorkerId, driver: Arc<dyn DeviceDriver>, config: &RegistryConfig) -> Self {
        Self {
            id: RegistryId::next(),
            worker,
            driver,
            config: config.clone(),
            state: RwLock::new(RegistryState {
                lifecycle: Lifecycle::Created,
                devices: BTreeMap::new(),
            }),
        }
    }

    /// Create and initialize a registry in one step.
    pub fn with_driver(
        worker: WorkerId,
        driver: Arc<dyn DeviceDriver>,
        config: &RegistryConfig,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(Self::new(worker, driver, config));
        registry.init()?;
        Ok(registry)
    }

    /// Discover visible devices and create one context and one stream for
    /// each.
    ///
    /// A driver that cannot count devices, or reports none, leaves the
    /// registry empty. Devices whose context or stream cannot be created
    /// are skipped.
    pub fn init(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.lifecycle != Lifecycle::Created {
            return Err(MemspaceError::InvalidState(format!(
                "registry for worker {} already initialized",
                self.worker
            )));
        }

        let count = match self.driver.device_count() {
            Ok(count) => count,
            Err(e) => {
                tracing::info!(
                    worker = %self.worker,
                    backend = %self.driver.backend(),
                    error = %e,
                    "No accelerator driver available, registry is empty"
                );
                0
            }
        };

        for ordinal in (0..count).filter(|o| self.config.is_visible(*o)) {
            let id = DeviceId(ordinal);
            match self.open_device(id) {
                Ok(entry) => {
                    state.devices.insert(id, entry);
                }
                Err(e) => {
                    tracing::warn!(worker = %self.worker, device = %id, error = %e, "Skipping device");
                }
            }
        }

        state.lifecycle = Lifecycle::Running;
        tracing::info!(
            worker = %self.worker,
            backend = %self.driver.backend(),
            devices = state.devices.len(),
            "Device registry initialized"
        );
        Ok(())
    }

    fn open_device(&self, id: DeviceId) -> Result<DeviceEntry> {
        let uuid = self.driver.device_uuid(id)?;
        let name = self.driver.device_name(id)?;
        let context = self.driver.create_context(id)?;
        let stream = match self.driver.create_stream(context) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = self.driver.destroy_context(context);
                return Err(e);
            }
        };

        Ok(DeviceEntry {
            device: Device {
                id,
                uuid,
                owner: self.worker,
                name,
            },
            context,
            stream,
            submission: Arc::new(Mutex::new(())),
        })
    }

    /// Synchronize and destroy every stream and context. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.lifecycle == Lifecycle::ShutDown {
            return Ok(());
        }

        let devices = std::mem::take(&mut state.devices);
        state.lifecycle = Lifecycle::ShutDown;
        drop(state);

        let mut first_error = None;
        for (id, entry) in devices {
            let result = self
                .driver
                .synchronize_stream(entry.stream)
                .and_then(|_| self.driver.destroy_stream(entry.stream))
                .and_then(|_| self.driver.destroy_context(entry.context));
            if let Err(e) = result {
                tracing::warn!(worker = %self.worker, device = %id, error = %e, "Device teardown failed");
                first_error.get_or_insert(e);
            }
        }

        tracing::info!(worker = %self.worker, "Device registry shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether `init()` has completed and `shutdown()` has not run.
    pub fn is_running(&self) -> bool {
        self.state.read().lifecycle == Lifecycle::Running
    }

    /// Process-unique id.
    pub fn id(&self) -> RegistryId {
        self.id
    }

    /// Owning worker.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Driver backing this registry.
    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    /// Backend kind of the driver.
    pub fn backend(&self) -> Backend {
        self.driver.backend()
    }

    /// Resolve a target to its device resources.
    ///
    /// Targets naming another worker fail with `ForeignDevice`, descriptors
    /// whose uuid no longer matches the ordinal with `StaleDescriptor`.
    pub fn entry(&self, target: impl AsDevice) -> Result<DeviceEntry> {
        let device = target.device_id();
        if let Some(owner) = target.owner() {
            if owner != self.worker {
                return Err(MemspaceError::ForeignDevice {
                    device,
                    owner,
                    local: self.worker,
                });
            }
        }

        let entry = self
            .state
            .read()
            .devices
            .get(&device)
            .cloned()
            .ok_or(MemspaceError::DeviceNotFound(device))?;
        match target.uuid() {
            Some(expected) if expected != entry.device.uuid => Err(MemspaceError::StaleDescriptor {
                device,
                expected,
                found: entry.device.uuid,
            }),
            _ => Ok(entry),
        }
    }

    /// Execution context of a device.
    pub fn context_for(&self, device: DeviceId) -> Result<ContextHandle> {
        Ok(self.entry(device)?.context)
    }

    /// Default stream of a device.
    pub fn stream_for(&self, device: DeviceId) -> Result<StreamHandle> {
        Ok(self.entry(device)?.stream)
    }

    /// Description of a device.
    pub fn device(&self, id: DeviceId) -> Option<Device> {
        self.state.read().devices.get(&id).map(|e| e.device.clone())
    }

    /// All registered devices in ordinal order.
    pub fn devices(&self) -> Vec<Device> {
        self.state.read().devices.values().map(|e| e.device.clone()).collect()
    }

    /// Processor descriptor for a device.
    pub fn processor(&self, id: DeviceId) -> Result<Processor> {
        self.device(id)
            .map(|d| d.processor())
            .ok_or(MemspaceError::DeviceNotFound(id))
    }

    /// Processor descriptors for every device.
    pub fn processors(&self) -> Vec<Processor> {
        self.state.read().devices.values().map(|e| e.device.processor()).collect()
    }

    /// Memory-space descriptors for every device.
    pub fn memory_spaces(&self) -> Vec<MemorySpace> {
        self.state
            .read()
            .devices
            .values()
            .map(|e| e.device.memory_space())
            .collect()
    }

    /// Find the local device with a given hardware identity.
    pub fn find_by_uuid(&self, uuid: DeviceUuid) -> Option<Device> {
        self.state
            .read()
            .devices
            .values()
            .find(|e| e.device.uuid == uuid)
            .map(|e| e.device.clone())
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.state.read().devices.len()
    }

    /// Returns true when no device is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("DeviceRegistry")
            .field("id", &self.id)
            .field("worker", &self.worker)
            .field("backend", &self.driver.backend())
            .field("lifecycle", &state.lifecycle)
            .field("devices", &state.devices.len())
            .finish()
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(worker = %self.worker, error = %e, "Registry shutdown on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDriver;

    fn registry(devices: usize) -> (Arc<MockDriver>, DeviceRegistry) {
        let driver = Arc::new(MockDriver::new(devices));
        let registry = DeviceRegistry::new(WorkerId(1), driver.clone(), &RegistryConfig::default());
        (driver, registry)
    }

    #[test]
    fn test_init_creates_context_and_stream_per_device() {
        let (driver, registry) = registry(2);
        registry.init().unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.is_running());
        let c0 = registry.context_for(DeviceId(0)).unwrap();
        let c1 = registry.context_for(DeviceId(1)).unwrap();
        assert_ne!(c0, c1);
        assert_ne!(
            registry.stream_for(DeviceId(0)).unwrap(),
            registry.stream_for(DeviceId(1)).unwrap()
        );
        assert_eq!(driver.live_contexts(), 2);
    }

    #[test]
    fn test_entry_rejects_mismatched_uuid() {
        let (_driver, registry) = registry(2);
        registry.init().unwrap();

        let space = registry.memory_spaces()[0];
        assert_eq!(registry.entry(space).unwrap().device.id, DeviceId(0));

        let mut stale = space;
        stale.uuid = registry.memory_spaces()[1].uuid;
        let err = registry.entry(stale).unwrap_err();
        assert!(matches!(
            err,
            MemspaceError::StaleDescriptor { device: DeviceId(0), .. }
        ));

        let mut proc = registry.processor(DeviceId(1)).unwrap();
        proc.uuid = DeviceUuid::nil();
        assert!(matches!(
            registry.entry(&proc),
            Err(MemspaceError::StaleDescriptor { .. })
        ));

        // Bare ordinals carry no identity to check.
        assert!(registry.entry(DeviceId(1)).is_ok());
    }

    #[test]
    fn test_init_twice_is_error() {
        let (_driver, registry) = registry(1);
        registry.init().unwrap();
        assert!(matches!(registry.init(), Err(MemspaceError::InvalidState(_))));
    }

    #[test]
    fn test_no_driver_yields_empty_registry() {
        let driver = Arc::new(MockDriver::new(0).fail_device_count());
        let registry = DeviceRegistry::new(WorkerId(1), driver, &RegistryConfig::default());
        registry.init().unwrap();
        assert!(registry.is_empty());
        assert!(registry.processors().is_empty());
    }

    #[test]
    fn test_failing_device_is_skipped() {
        let driver = Arc::new(MockDriver::new(3).fail_context_for(DeviceId(1)));
        let registry = DeviceRegistry::new(WorkerId(1), driver, &RegistryConfig::default());
        registry.init().unwrap();

        let ids: Vec<_> = registry.devices().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![DeviceId(0), DeviceId(2)]);
    }

    #[test]
    fn test_visible_devices_filter() {
        let driver = Arc::new(MockDriver::new(4));
        let config = RegistryConfig {
            visible_devices: Some(vec![3, 1]),
        };
        let registry = DeviceRegistry::new(WorkerId(1), driver, &config);
        registry.init().unwrap();

        let ids: Vec<_> = registry.devices().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![DeviceId(1), DeviceId(3)]);
        assert!(matches!(
            registry.context_for(DeviceId(0)),
            Err(MemspaceError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_descriptors_are_rebuilt_equal() {
        let (_driver, registry) = registry(2);
        registry.init().unwrap();

        let first = registry.processors();
        let second = registry.processors();
        assert_eq!(first, second);
        assert_eq!(first[1].owner, WorkerId(1));
        assert_eq!(registry.memory_spaces()[1], first[1].memory_space());

        let uuid = first[1].uuid;
        assert_eq!(registry.find_by_uuid(uuid).unwrap().id, DeviceId(1));
    }

    #[test]
    fn test_foreign_target_rejected() {
        let (_driver, registry) = registry(1);
        registry.init().unwrap();

        let mut proc = registry.processor(DeviceId(0)).unwrap();
        proc.owner = WorkerId(9);
        assert!(matches!(
            registry.entry(proc),
            Err(MemspaceError::ForeignDevice { owner: WorkerId(9), .. })
        ));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (driver, registry) = registry(2);
        registry.init().unwrap();
        registry.shutdown().unwrap();
        registry.shutdown().unwrap();

        assert!(registry.is_empty());
        assert!(!registry.is_running());
        assert_eq!(driver.live_contexts(), 0);
        assert!(registry.init().is_err());
    }
}
