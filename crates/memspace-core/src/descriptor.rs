//! Processor and memory-space descriptors.
//!
//! A [`Processor`] names "device D on worker W" as a schedulable execution
//! unit; a [`MemorySpace`] names the same pair as a placement of bytes. The
//! two convert into each other losslessly.
//!
//! Descriptors are plain values. They are rebuilt on demand and compared
//! structurally; nothing caches or interns them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{DeviceId, DeviceUuid, WorkerId};

/// One accelerator discovered by a worker's registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Ordinal within the owning worker.
    pub id: DeviceId,
    /// Hardware identity.
    pub uuid: DeviceUuid,
    /// Worker process owning the device.
    pub owner: WorkerId,
    /// Human-readable device name.
    pub name: String,
}

impl Device {
    /// Execution descriptor for this device.
    pub fn processor(&self) -> Processor {
        Processor::new(self.owner, self.id, self.uuid)
    }

    /// Placement descriptor for this device.
    pub fn memory_space(&self) -> MemorySpace {
        MemorySpace::new(self.owner, self.id, self.uuid)
    }
}

/// Schedulable execution unit: one device on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Processor {
    /// Owning worker.
    pub owner: WorkerId,
    /// Device ordinal on the owner.
    pub device: DeviceId,
    /// Hardware identity.
    pub uuid: DeviceUuid,
}

impl Processor {
    /// Create a processor descriptor.
    pub fn new(owner: WorkerId, device: DeviceId, uuid: DeviceUuid) -> Self {
        Self { owner, device, uuid }
    }

    /// The memory space local to this processor.
    pub fn memory_space(&self) -> MemorySpace {
        MemorySpace::from(*self)
    }
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "proc(worker {}, device {}, {})",
            self.owner, self.device, self.uuid
        )
    }
}

/// Placement of bytes in the VRAM of one device on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemorySpace {
    /// Owning worker.
    pub owner: WorkerId,
    /// Device ordinal on the owner.
    pub device: DeviceId,
    /// Hardware identity.
    pub uuid: DeviceUuid,
}

impl MemorySpace {
    /// Create a memory-space descriptor.
    pub fn new(owner: WorkerId, device: DeviceId, uuid: DeviceUuid) -> Self {
        Self { owner, device, uuid }
    }

    /// The processor that executes against this space.
    pub fn processor(&self) -> Processor {
        Processor::from(*self)
    }
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vram(worker {}, device {}, {})",
            self.owner, self.device, self.uuid
        )
    }
}

impl From<Processor> for MemorySpace {
    fn from(p: Processor) -> Self {
        Self::new(p.owner, p.device, p.uuid)
    }
}

impl From<MemorySpace> for Processor {
    fn from(s: MemorySpace) -> Self {
        Self::new(s.owner, s.device, s.uuid)
    }
}

/// Descriptor naming either side of a move.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    /// Host RAM of a worker.
    Host(WorkerId),
    /// VRAM of a device.
    Device(MemorySpace),
}

impl Location {
    /// Worker owning the bytes.
    pub fn owner(&self) -> WorkerId {
        match self {
            Location::Host(w) => *w,
            Location::Device(s) => s.owner,
        }
    }

    /// The device space, if this is a device location.
    pub fn as_device(&self) -> Option<&MemorySpace> {
        match self {
            Location::Device(s) => Some(s),
            Location::Host(_) => None,
        }
    }

    /// Returns true for host locations.
    pub fn is_host(&self) -> bool {
        matches!(self, Location::Host(_))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Host(w) => write!(f, "host@{}", w),
            Location::Device(s) => s.fmt(f),
        }
    }
}

impl From<MemorySpace> for Location {
    fn from(s: MemorySpace) -> Self {
        Location::Device(s)
    }
}

impl From<Processor> for Location {
    fn from(p: Processor) -> Self {
        Location::Device(p.into())
    }
}

/// Anything that names a device on some worker: a processor, a memory
/// space, or a bare device id (assumed local).
pub trait AsDevice {
    /// Device ordinal.
    fn device_id(&self) -> DeviceId;

    /// Owning worker, or `None` when the target does not say (bare ids).
    fn owner(&self) -> Option<WorkerId>;

    /// Physical device identity, or `None` for bare ids.
    fn uuid(&self) -> Option<DeviceUuid> {
        None
    }
}

impl AsDevice for DeviceId {
    fn device_id(&self) -> DeviceId {
        *self
    }

    fn owner(&self) -> Option<WorkerId> {
        None
    }
}

impl AsDevice for Processor {
    fn device_id(&self) -> DeviceId {
        self.device
    }

    fn owner(&self) -> Option<WorkerId> {
        Some(self.owner)
    }

    fn uuid(&self) -> Option<DeviceUuid> {
        Some(self.uuid)
    }
}

impl AsDevice for MemorySpace {
    fn device_id(&self) -> DeviceId {
        self.device
    }

    fn owner(&self) -> Option<WorkerId> {
        Some(self.owner)
    }

    fn uuid(&self) -> Option<DeviceUuid> {
        Some(self.uuid)
    }
}

impl<T: AsDevice> AsDevice for &T {
    fn device_id(&self) -> DeviceId {
        (**self).device_id()
    }

    fn owner(&self) -> Option<WorkerId> {
        (**self).owner()
    }

    fn uuid(&self) -> Option<DeviceUuid> {
        (**self).uuid()
    }
}
