//! In-process cluster of simulated workers.
//!
//! A [`LocalCluster`] hosts several [`Worker`]s in one process, grouped on
//! simulated physical nodes. Each worker gets a fabric that answers
//! topology queries from the cluster membership and runs remote jobs on a
//! fresh thread of the target worker, so thread-local device state never
//! leaks between workers.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;

use memspace_core::config::{MemspaceConfig, TransferConfig};
use memspace_core::descriptor::Processor;
use memspace_core::driver::DeviceDriver;
use memspace_core::error::{MemspaceError, Result};
use memspace_core::fabric::{Fabric, RemoteInvoker, RemoteJob, RemoteReply, Topology};
use memspace_core::registry::DeviceRegistry;
use memspace_core::types::{Backend, NodeId, WorkerId};
use memspace_cpu::{CpuDriver, CpuDriverConfig, SimNode};

use crate::worker::Worker;

struct Member {
    node: NodeId,
    worker: Arc<Worker>,
    driver: Arc<CpuDriver>,
}

#[derive(Default)]
struct Membership {
    next_worker: u32,
    nodes: BTreeMap<String, SimNode>,
    members: BTreeMap<WorkerId, Member>,
}

/// Several workers on simulated nodes inside one process.
pub struct LocalCluster {
    shared: Arc<RwLock<Membership>>,
    transfer: TransferConfig,
    stream_latency: Option<Duration>,
}

impl LocalCluster {
    /// Empty cluster with default transfer settings.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RwLock::new(Membership::default())),
            transfer: TransferConfig::default(),
            stream_latency: None,
        }
    }

    /// Transfer settings for workers added from now on.
    #[must_use]
    pub fn with_transfer(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }

    /// Per-operation stream latency for workers added from now on.
    #[must_use]
    pub fn with_stream_latency(mut self, latency: Duration) -> Self {
        self.stream_latency = Some(latency);
        self
    }

    /// Add a physical node with `devices` accelerators.
    pub fn add_node(&self, name: &str, devices: usize) -> Result<SimNode> {
        let mut membership = self.shared.write();
        if membership.nodes.contains_key(name) {
            return Err(MemspaceError::InvalidConfig(format!("node {} already exists", name)));
        }
        let node = SimNode::new(name, devices);
        membership.nodes.insert(name.to_string(), node.clone());
        Ok(node)
    }

    /// Start a worker on `node` that sees the node's physical devices
    /// `visible`, in that order.
    pub fn spawn_worker(&self, node: &SimNode, visible: &[usize]) -> Result<Arc<Worker>> {
        let id = {
            let mut membership = self.shared.write();
            if !membership.nodes.contains_key(node.name()) {
                return Err(MemspaceError::InvalidConfig(format!(
                    "node {} is not part of this cluster",
                    node.name()
                )));
            }
            let id = WorkerId(membership.next_worker);
            membership.next_worker += 1;
            id
        };

        let mut driver_config = CpuDriverConfig::default().with_devices(node.device_count());
        driver_config.stream_latency = self.stream_latency;
        let driver = Arc::new(CpuDriver::on_node(node, visible, driver_config)?);

        let config = MemspaceConfig {
            worker: id,
            node: NodeId::new(node.name()),
            backend: Backend::Cpu,
            transfer: self.transfer.clone(),
            ..MemspaceConfig::default()
        };

        let links = Arc::downgrade(&self.shared);
        let worker = Worker::builder()
            .config(config.clone())
            .driver(driver.clone() as Arc<dyn DeviceDriver>)
            .fabric_factory(Box::new(move |_: &Arc<DeviceRegistry>| -> Arc<dyn Fabric> {
                Arc::new(ClusterFabric { local: id, links })
            }))
            .build()?;
        let worker = Arc::new(worker);

        self.shared.write().members.insert(
            id,
            Member {
                node: config.node,
                worker: worker.clone(),
                driver,
            },
        );
        Ok(worker)
    }

    /// A worker by id.
    pub fn worker(&self, id: WorkerId) -> Option<Arc<Worker>> {
        self.shared.read().members.get(&id).map(|m| m.worker.clone())
    }

    /// The simulated driver of a worker, for inspecting its call counters.
    pub fn driver(&self, id: WorkerId) -> Option<Arc<CpuDriver>> {
        self.shared.read().members.get(&id).map(|m| m.driver.clone())
    }

    /// Ids of all workers.
    pub fn workers(&self) -> Vec<WorkerId> {
        self.shared.read().members.keys().copied().collect()
    }

    /// Shut down every worker and leave the cluster empty.
    pub fn shutdown(&self) -> Result<()> {
        let members = std::mem::take(&mut self.shared.write().members);
        let mut first_error = None;
        for (_, member) in members {
            if let Err(e) = member.worker.shutdown() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let membership = self.shared.read();
        f.debug_struct("LocalCluster")
            .field("nodes", &membership.nodes.keys().collect::<Vec<_>>())
            .field("workers", &membership.members.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Fabric handed to each cluster worker. Holds the membership weakly:
/// members own workers, workers own their fabric.
struct ClusterFabric {
    local: WorkerId,
    links: Weak<RwLock<Membership>>,
}

impl ClusterFabric {
    fn membership(&self) -> Option<Arc<RwLock<Membership>>> {
        self.links.upgrade()
    }
}

impl Topology for ClusterFabric {
    fn local_worker(&self) -> WorkerId {
        self.local
    }

    fn node_of(&self, worker: WorkerId) -> Option<NodeId> {
        let membership = self.membership()?;
        let node = membership.read().members.get(&worker).map(|m| m.node.clone());
        node
    }

    fn processors(&self, worker: WorkerId) -> Vec<Processor> {
        let Some(membership) = self.membership() else {
            return Vec::new();
        };
        let target = membership.read().members.get(&worker).map(|m| m.worker.clone());
        target.map(|w| w.processors()).unwrap_or_default()
    }
}

impl RemoteInvoker for ClusterFabric {
    fn invoke(&self, worker: WorkerId, job: RemoteJob) -> Result<RemoteReply> {
        let failed = |reason: String| MemspaceError::RemoteCallFailed { worker, reason };

        let membership = self
            .membership()
            .ok_or_else(|| failed("cluster is gone".to_string()))?;
        let target = membership.read().members.get(&worker).map(|m| m.worker.clone());
        let target =
            target.ok_or_else(|| failed(format!("worker {} is not a cluster member", worker)))?;

        tracing::trace!(from = %self.local, to = %worker, "Remote call");
        let mover = target.mover().clone();
        let handle = std::thread::Builder::new()
            .name(format!("memspace-remote-{}", worker))
            .spawn(move || job(&*mover))
            .map_err(|e| failed(format!("failed to spawn remote thread: {}", e)))?;
        handle
            .join()
            .map_err(|_| failed("remote job panicked".to_string()))?
    }
}
