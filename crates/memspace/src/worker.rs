//! One worker process: registry, data mover and execution adapter.

use std::sync::Arc;

use memspace_core::config::MemspaceConfig;
use memspace_core::descriptor::{Location, MemorySpace, Processor};
use memspace_core::driver::DeviceDriver;
use memspace_core::error::{MemspaceError, Result};
use memspace_core::execution::{BoxError, ExecutionAdapter, TaskContext};
use memspace_core::fabric::{Fabric, Standalone};
use memspace_core::mover::DataMover;
use memspace_core::registry::DeviceRegistry;
use memspace_core::types::{Backend, NodeId, WorkerId};
use memspace_core::value::Value;
use memspace_cpu::{CpuDriver, CpuDriverConfig};

/// Builds the fabric of a worker once its registry exists.
pub(crate) type FabricFactory = Box<dyn FnOnce(&Arc<DeviceRegistry>) -> Arc<dyn Fabric>>;

/// A worker process: its devices, its mover and its task adapter.
pub struct Worker {
    config: MemspaceConfig,
    registry: Arc<DeviceRegistry>,
    mover: Arc<DataMover>,
    adapter: ExecutionAdapter,
}

impl Worker {
    /// Create a new worker builder.
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::new()
    }

    /// Create a standalone worker from a configuration.
    pub fn new(config: MemspaceConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Worker id.
    pub fn id(&self) -> WorkerId {
        self.config.worker
    }

    /// Node this worker runs on.
    pub fn node(&self) -> &NodeId {
        &self.config.node
    }

    /// Configuration the worker was built from.
    pub fn config(&self) -> &MemspaceConfig {
        &self.config
    }

    /// Backend of the worker's driver.
    pub fn backend(&self) -> Backend {
        self.registry.backend()
    }

    /// Device registry.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Data mover.
    pub fn mover(&self) -> &Arc<DataMover> {
        &self.mover
    }

    /// Execution adapter.
    pub fn adapter(&self) -> &ExecutionAdapter {
        &self.adapter
    }

    /// Host memory of this worker.
    pub fn host(&self) -> Location {
        Location::Host(self.id())
    }

    /// Processors advertised by this worker. Empty without accelerators.
    pub fn processors(&self) -> Vec<Processor> {
        self.registry.processors()
    }

    /// Memory spaces of this worker's devices.
    pub fn memory_spaces(&self) -> Vec<MemorySpace> {
        self.registry.memory_spaces()
    }

    /// Move `value` from `from` to `to`, which this worker must own.
    pub fn move_value(&self, from: &Location, to: &Location, value: &Value) -> Result<Value> {
        self.mover.move_value(from, to, value)
    }

    /// Run a task closure on one of this worker's processors.
    pub async fn execute<S, A, R, E, F>(&self, processor: Processor, state: S, f: F, args: A) -> Result<R>
    where
        S: Send + 'static,
        A: Send + 'static,
        R: Send + 'static,
        E: Into<BoxError> + 'static,
        F: FnOnce(&TaskContext<S>, A) -> std::result::Result<R, E> + Send + 'static,
    {
        self.adapter.execute(processor, state, f, args).await
    }

    /// Blocking variant of [`execute`](Self::execute).
    pub fn execute_blocking<S, A, R, E, F>(
        &self,
        processor: Processor,
        state: S,
        f: F,
        args: A,
    ) -> Result<R>
    where
        S: Send + 'static,
        A: Send + 'static,
        R: Send + 'static,
        E: Into<BoxError> + 'static,
        F: FnOnce(&TaskContext<S>, A) -> std::result::Result<R, E> + Send + 'static,
    {
        self.adapter.execute_blocking(processor, state, f, args)
    }

    /// Release device contexts and streams.
    pub fn shutdown(&self) -> Result<()> {
        self.registry.shutdown()
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.config.worker)
            .field("node", &self.config.node)
            .field("registry", &self.registry)
            .finish()
    }
}

/// Builder for [`Worker`].
pub struct WorkerBuilder {
    config: MemspaceConfig,
    driver: Option<Arc<dyn DeviceDriver>>,
    fabric: Option<FabricFactory>,
}

impl WorkerBuilder {
    /// Create a new builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: MemspaceConfig::default(),
            driver: None,
            fabric: None,
        }
    }

    /// Set the configuration.
    #[must_use]
    pub fn config(mut self, config: MemspaceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the backend.
    #[must_use]
    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Use this driver instead of selecting one from the backend.
    #[must_use]
    pub fn driver(mut self, driver: Arc<dyn DeviceDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Use this fabric instead of a standalone one.
    #[must_use]
    pub fn fabric(mut self, fabric: Arc<dyn Fabric>) -> Self {
        self.fabric = Some(Box::new(move |_: &Arc<DeviceRegistry>| fabric));
        self
    }

    pub(crate) fn fabric_factory(mut self, factory: FabricFactory) -> Self {
        self.fabric = Some(factory);
        self
    }

    /// Build the worker.
    pub fn build(self) -> Result<Worker> {
        self.config.validate()?;
        let driver = match self.driver {
            Some(driver) => driver,
            None => select_driver(self.config.backend)?,
        };

        let registry = DeviceRegistry::with_driver(self.config.worker, driver, &self.config.registry)?;
        let fabric = match self.fabric {
            Some(factory) => factory(&registry),
            None => Arc::new(
                Standalone::new(self.config.worker, self.config.node.clone())
                    .with_registry(registry.clone()),
            ),
        };

        let mover = Arc::new(DataMover::new(
            registry.clone(),
            fabric,
            self.config.transfer.clone(),
        ));
        let adapter = ExecutionAdapter::new(registry.clone(), self.config.execution.clone());

        tracing::info!(
            worker = %self.config.worker,
            node = %self.config.node,
            backend = %registry.backend(),
            devices = registry.len(),
            "Worker started"
        );
        Ok(Worker {
            config: self.config,
            registry,
            mover,
            adapter,
        })
    }
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn select_driver(backend: Backend) -> Result<Arc<dyn DeviceDriver>> {
    match backend {
        Backend::Cpu => Ok(Arc::new(CpuDriver::new(CpuDriverConfig::default()))),
        Backend::Cuda => Ok(Arc::new(memspace_cuda::CudaDriver::new()?)),
        Backend::Auto => {
            if memspace_cuda::is_cuda_available() {
                match memspace_cuda::CudaDriver::new() {
                    Ok(driver) => {
                        tracing::info!("Auto-selected CUDA backend");
                        return Ok(Arc::new(driver));
                    }
                    Err(MemspaceError::BackendUnavailable(reason)) => {
                        tracing::debug!(reason = %reason, "CUDA driver unavailable");
                    }
                    Err(e) => return Err(e),
                }
            }
            tracing::info!("Auto-selected CPU backend (no GPU available)");
            Ok(Arc::new(CpuDriver::new(CpuDriverConfig::default())))
        }
    }
}
