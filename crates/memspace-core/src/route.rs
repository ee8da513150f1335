//! Transfer route classification.

use std::fmt;

use crate::descriptor::Location;
use crate::error::{MemspaceError, Result};
use crate::fabric::Topology;
use crate::value::ValueKind;

/// How a value travels from one location to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferRoute {
    /// Immutable value, returned as-is.
    Passthrough,
    /// Host value to host.
    HostToHost,
    /// Upload into a device of this worker.
    HostToDevice,
    /// Download from a device of this worker.
    DeviceToHostLocal,
    /// Download performed by the owning worker, bytes returned by value.
    DeviceToHostRemote,
    /// Source and destination are the same device.
    SameDevice,
    /// Two devices of this worker.
    CrossDevice,
    /// Another worker on this node; shared-memory handle.
    SharedMemory {
        /// Whether both ends are the same physical device.
        same_device: bool,
    },
    /// Another node; host round trip.
    CrossNode,
}

impl TransferRoute {
    /// Pick the route for a value of `kind` moving `from` -> `to`.
    ///
    /// Chunks are classified by their destination only; the mover resolves
    /// them first and then moves the resolved value.
    pub fn classify<T>(kind: ValueKind, from: &Location, to: &Location, topology: &T) -> Result<Self>
    where
        T: Topology + ?Sized,
    {
        let local = topology.local_worker();
        let route = match (kind, from, to) {
            (ValueKind::Shareable, _, _) => TransferRoute::Passthrough,
            (ValueKind::Chunk, _, Location::Host(_)) => TransferRoute::HostToHost,
            (ValueKind::Chunk, _, Location::Device(_)) => TransferRoute::HostToDevice,
            (ValueKind::Host, Location::Host(_), Location::Host(_)) => TransferRoute::HostToHost,
            (ValueKind::Host, Location::Host(_), Location::Device(_)) => TransferRoute::HostToDevice,
            (ValueKind::Device, Location::Device(src), Location::Host(_)) => {
                if src.owner == local {
                    TransferRoute::DeviceToHostLocal
                } else {
                    TransferRoute::DeviceToHostRemote
                }
            }
            (ValueKind::Device, Location::Device(src), Location::Device(dst)) => {
                if src == dst {
                    TransferRoute::SameDevice
                } else if src.owner == dst.owner {
                    TransferRoute::CrossDevice
                } else if topology.same_node(src.owner, dst.owner) {
                    TransferRoute::SharedMemory {
                        same_device: src.uuid == dst.uuid,
                    }
                } else {
                    TransferRoute::CrossNode
                }
            }
            (kind, from, _) => {
                return Err(MemspaceError::InvalidState(format!(
                    "a {:?} value cannot live at {}",
                    kind, from
                )))
            }
        };
        Ok(route)
    }

    /// The route to take when shared-memory handles are disabled.
    pub fn without_ipc(self) -> Self {
        match self {
            TransferRoute::SharedMemory { .. } => TransferRoute::CrossNode,
            other => other,
        }
    }

    /// Whether the route involves another worker.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            TransferRoute::DeviceToHostRemote
                | TransferRoute::SharedMemory { .. }
                | TransferRoute::CrossNode
        )
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            TransferRoute::Passthrough => "passthrough",
            TransferRoute::HostToHost => "host-to-host",
            TransferRoute::HostToDevice => "host-to-device",
            TransferRoute::DeviceToHostLocal => "device-to-host",
            TransferRoute::DeviceToHostRemote => "device-to-host-remote",
            TransferRoute::SameDevice => "same-device",
            TransferRoute::CrossDevice => "cross-device",
            TransferRoute::SharedMemory { .. } => "shared-memory",
            TransferRoute::CrossNode => "cross-node",
        }
    }
}

impl fmt::Display for TransferRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
