//! Interfaces to the surrounding distributed runtime.
//!
//! The data mover needs two things from outside its own worker: where
//! other workers run ([`Topology`]), and a way to run a closure on another
//! worker and get its result back ([`RemoteInvoker`]).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::array::DType;
use crate::descriptor::{MemorySpace, Processor};
use crate::driver::IpcMemHandle;
use crate::error::{MemspaceError, Result};
use crate::mover::DataMover;
use crate::registry::DeviceRegistry;
use crate::types::{NodeId, WorkerId};
use crate::value::Value;

/// Shared-memory handle plus the metadata needed to rebuild an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcExport {
    /// Exported handle.
    pub handle: IpcMemHandle,
    /// Element type.
    pub dtype: DType,
    /// Array shape.
    pub shape: Vec<usize>,
    /// Where the exported memory lives.
    pub source: MemorySpace,
}

impl IpcExport {
    /// Payload size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.shape.iter().product::<usize>() * self.dtype.size()
    }
}

/// Result of a remote job.
#[derive(Debug, Clone)]
pub enum RemoteReply {
    /// A value returned by value.
    Value(Value),
    /// An exported shared-memory handle.
    Ipc(IpcExport),
}

impl RemoteReply {
    /// Unwrap a value reply.
    pub fn into_value(self) -> Result<Value> {
        match self {
            RemoteReply::Value(v) => Ok(v),
            RemoteReply::Ipc(_) => Err(MemspaceError::InvalidState(
                "expected a value reply, got an IPC handle".to_string(),
            )),
        }
    }

    /// Unwrap an IPC reply.
    pub fn into_ipc(self) -> Result<IpcExport> {
        match self {
            RemoteReply::Ipc(export) => Ok(export),
            RemoteReply::Value(_) => Err(MemspaceError::InvalidState(
                "expected an IPC handle, got a value".to_string(),
            )),
        }
    }
}

/// Work shipped to another worker, run against that worker's mover.
pub type RemoteJob = Box<dyn FnOnce(&DataMover) -> Result<RemoteReply> + Send>;

/// Placement of workers on physical nodes.
pub trait Topology: Send + Sync {
    /// Worker this process runs as.
    fn local_worker(&self) -> WorkerId;

    /// Node a worker runs on, if known.
    fn node_of(&self, worker: WorkerId) -> Option<NodeId>;

    /// Processors owned by a worker.
    fn processors(&self, worker: WorkerId) -> Vec<Processor>;

    /// Whether two workers share a physical node. Unknown workers never do.
    fn same_node(&self, a: WorkerId, b: WorkerId) -> bool {
        match (self.node_of(a), self.node_of(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }
}

/// Runs a job on another worker and waits for its reply.
pub trait RemoteInvoker: Send + Sync {
    /// Run `job` on `worker`. Errors returned by the job reach the caller
    /// unchanged.
    fn invoke(&self, worker: WorkerId, job: RemoteJob) -> Result<RemoteReply>;
}

/// Topology and remote invocation together.
pub trait Fabric: Topology + RemoteInvoker {}

impl<T: Topology + RemoteInvoker> Fabric for T {}

/// Fabric of a worker running alone.
pub struct Standalone {
    worker: WorkerId,
    node: NodeId,
    registry: Option<Arc<DeviceRegistry>>,
}

impl Standalone {
    /// Create a standalone fabric.
    pub fn new(worker: WorkerId, node: NodeId) -> Self {
        Self {
            worker,
            node,
            registry: None,
        }
    }

    /// Answer `processors()` for the local worker from `registry`.
    pub fn with_registry(mut self, registry: Arc<DeviceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }
}

impl Topology for Standalone {
    fn local_worker(&self) -> WorkerId {
        self.worker
    }

    fn node_of(&self, worker: WorkerId) -> Option<NodeId> {
        (worker == self.worker).then(|| self.node.clone())
    }

    fn processors(&self, worker: WorkerId) -> Vec<Processor> {
        match &self.registry {
            Some(registry) if worker == self.worker => registry.processors(),
            _ => Vec::new(),
        }
    }
}

impl RemoteInvoker for Standalone {
    fn invoke(&self, worker: WorkerId, _job: RemoteJob) -> Result<RemoteReply> {
        Err(MemspaceError::RemoteCallFailed {
            worker,
            reason: format!("worker {} runs standalone", self.worker),
        })
    }
}
