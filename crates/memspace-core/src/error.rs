//! Error types for memspace.

use thiserror::Error;

use crate::descriptor::Location;
use crate::execution::TaskFailure;
use crate::types::{DeviceId, DeviceUuid, WorkerId};

/// Result type alias used throughout memspace.
pub type Result<T> = std::result::Result<T, MemspaceError>;

/// Errors surfaced by the memspace core and its driver backends.
///
/// The core never retries; every variant reaches the caller unchanged.
#[derive(Error, Debug)]
pub enum MemspaceError {
    /// The requested backend is not compiled in or has no usable driver.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A native driver call failed.
    #[error("Backend error: {0}")]
    BackendError(String),

    /// No device with this id is registered on the worker.
    #[error("Device {0} not found")]
    DeviceNotFound(DeviceId),

    /// The device belongs to another worker and cannot be activated here.
    #[error("Device {device} is owned by worker {owner}, not by worker {local}")]
    ForeignDevice {
        /// Device that was requested.
        device: DeviceId,
        /// Worker owning the device.
        owner: WorkerId,
        /// Worker that attempted the activation.
        local: WorkerId,
    },

    /// A descriptor names a local ordinal that now holds a different
    /// physical device.
    #[error("Device {device} is {found}, but the descriptor names {expected}")]
    StaleDescriptor {
        /// Device ordinal in the descriptor.
        device: DeviceId,
        /// Uuid carried by the descriptor.
        expected: DeviceUuid,
        /// Uuid registered for the ordinal.
        found: DeviceUuid,
    },

    /// Moves must run on the worker that owns the destination.
    #[error("Destination {to} is not owned by worker {local}")]
    ForeignDestination {
        /// Requested destination.
        to: Location,
        /// Worker executing the move.
        local: WorkerId,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Device allocation failed.
    #[error("Allocation of {size} bytes failed: {reason}")]
    AllocationFailed {
        /// Requested size in bytes.
        size: usize,
        /// Driver-provided reason.
        reason: String,
    },

    /// A copy between two locations was rejected.
    #[error("Transfer from {from} to {to} failed: {reason}")]
    TransferFailed {
        /// Source descriptor.
        from: Location,
        /// Destination descriptor.
        to: Location,
        /// Driver-provided reason.
        reason: String,
    },

    /// Shared-memory handle export or import failed.
    #[error("IPC handle transfer from {from} to {to} failed: {reason}")]
    IpcFailed {
        /// Source descriptor.
        from: Location,
        /// Destination descriptor.
        to: Location,
        /// Driver-provided reason.
        reason: String,
    },

    /// The remote invocation primitive itself failed.
    #[error("Remote call to worker {worker} failed: {reason}")]
    RemoteCallFailed {
        /// Target worker.
        worker: WorkerId,
        /// Reason reported by the fabric.
        reason: String,
    },

    /// A chunk id was not present in the owner's store.
    #[error("Chunk {0} not found")]
    ChunkNotFound(String),

    /// Source and destination shapes differ.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Shape of the destination.
        expected: Vec<usize>,
        /// Shape of the source.
        actual: Vec<usize>,
    },

    /// Element types differ.
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Expected element type name.
        expected: String,
        /// Actual element type name.
        actual: String,
    },

    /// The backend has no native routine for this request.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// A task closure failed inside the execution adapter.
    #[error("{0}")]
    TaskFailed(Box<TaskFailure>),
}

impl MemspaceError {
    /// Wrap a driver error raised during a copy between two locations.
    pub fn transfer(from: &Location, to: &Location, source: impl std::fmt::Display) -> Self {
        MemspaceError::TransferFailed {
            from: from.clone(),
            to: to.clone(),
            reason: source.to_string(),
        }
    }

    /// Wrap a driver error raised while exporting or importing an IPC handle.
    pub fn ipc(from: &Location, to: &Location, source: impl std::fmt::Display) -> Self {
        MemspaceError::IpcFailed {
            from: from.clone(),
            to: to.clone(),
            reason: source.to_string(),
        }
    }

    /// Returns the task failure if this error came from a task closure.
    pub fn as_task_failure(&self) -> Option<&TaskFailure> {
        match self {
            MemspaceError::TaskFailed(failure) => Some(failure),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::MemorySpace;

    #[test]
    fn test_transfer_error_names_both_ends() {
        let from = Location::Host(WorkerId(1));
        let to = Location::Device(MemorySpace::new(WorkerId(2), DeviceId(0), DeviceUuid::nil()));
        let err = MemspaceError::transfer(&from, &to, "copy rejected");

        let msg = err.to_string();
        assert!(msg.contains("host@1"));
        assert!(msg.contains("worker 2"));
        assert!(msg.contains("copy rejected"));
    }

    #[test]
    fn test_as_task_failure_none_for_other_errors() {
        let err = MemspaceError::DeviceNotFound(DeviceId(3));
        assert!(err.as_task_failure().is_none());
        assert_eq!(err.to_string(), "Device 3 not found");
    }
}
