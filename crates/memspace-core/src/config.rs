//! Worker configuration.
//!
//! Configuration is plain data: build it in code through
//! [`ConfigBuilder`], start from a preset, or parse it from TOML. Every
//! section carries serde defaults so partial files are accepted.
//!
//! ```toml
//! worker = 1
//! node = "gpu-node-07"
//! backend = "Cuda"
//!
//! [registry]
//! visible_devices = [0, 1]
//!
//! [transfer]
//! enable_ipc = true
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{MemspaceError, Result};
use crate::types::{Backend, NodeId, WorkerId};

/// Environment variable overriding [`MemspaceConfig::worker`].
pub const ENV_WORKER: &str = "MEMSPACE_WORKER";
/// Environment variable overriding [`MemspaceConfig::node`].
pub const ENV_NODE: &str = "MEMSPACE_NODE";
/// Comma-separated device ordinals overriding
/// [`RegistryConfig::visible_devices`].
pub const ENV_VISIBLE_DEVICES: &str = "MEMSPACE_VISIBLE_DEVICES";
/// Any value other than `0`/`false` disables shared-memory transfers.
pub const ENV_DISABLE_IPC: &str = "MEMSPACE_DISABLE_IPC";

/// Complete configuration of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemspaceConfig {
    /// Worker identity within the distributed execution.
    #[serde(default = "default_worker")]
    pub worker: WorkerId,

    /// Physical machine the worker runs on.
    #[serde(default = "NodeId::local")]
    pub node: NodeId,

    /// Driver backend.
    #[serde(default = "default_backend")]
    pub backend: Backend,

    /// Device discovery.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Data mover behaviour.
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Task execution.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

fn default_worker() -> WorkerId {
    WorkerId(0)
}

fn default_backend() -> Backend {
    Backend::Auto
}

impl Default for MemspaceConfig {
    fn default() -> Self {
        Self {
            worker: default_worker(),
            node: NodeId::local(),
            backend: default_backend(),
            registry: RegistryConfig::default(),
            transfer: TransferConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

/// Device discovery configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Restrict discovery to these ordinals. `None` registers every device
    /// the driver reports.
    #[serde(default)]
    pub visible_devices: Option<Vec<usize>>,
}

impl RegistryConfig {
    /// Whether a device ordinal passes the visibility filter.
    pub fn is_visible(&self, ordinal: usize) -> bool {
        match &self.visible_devices {
            Some(list) => list.contains(&ordinal),
            None => true,
        }
    }
}

/// Data mover configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Use shared-memory handles between processes on one node. When off,
    /// those moves take the host round trip.
    #[serde(default = "default_true")]
    pub enable_ipc: bool,

    /// Synchronize the destination device after a host-to-device upload.
    #[serde(default = "default_true")]
    pub sync_after_upload: bool,

    /// Log a warning when an identity move finds a buffer whose stream
    /// affinity differs from the device stream.
    #[serde(default = "default_true")]
    pub warn_on_affinity_mismatch: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            enable_ipc: true,
            sync_after_upload: true,
            warn_on_affinity_mismatch: true,
        }
    }
}

/// Execution adapter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Prefix of the names given to task threads.
    #[serde(default = "default_thread_prefix")]
    pub thread_name_prefix: String,

    /// Stack size of task threads. `None` uses the platform default.
    #[serde(default)]
    pub stack_size: Option<usize>,
}

fn default_thread_prefix() -> String {
    "memspace-task".to_string()
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: default_thread_prefix(),
            stack_size: None,
        }
    }
}

impl MemspaceConfig {
    /// Development preset: CPU simulation, IPC on, chatty warnings.
    pub fn development() -> Self {
        Self {
            backend: Backend::Cpu,
            ..Self::default()
        }
    }

    /// Production preset: best available backend, large task stacks.
    pub fn production() -> Self {
        Self {
            backend: Backend::Auto,
            execution: ExecutionConfig {
                thread_name_prefix: default_thread_prefix(),
                stack_size: Some(16 * 1024 * 1024),
            },
            ..Self::default()
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| MemspaceError::InvalidConfig(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MEMSPACE_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `MEMSPACE_*` overrides using `lookup` as the environment.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_WORKER) {
            let id = raw.trim().parse::<u32>().map_err(|e| {
                MemspaceError::InvalidConfig(format!("{}={:?}: {}", ENV_WORKER, raw, e))
            })?;
            self.worker = WorkerId(id);
        }

        if let Some(raw) = lookup(ENV_NODE) {
            self.node = NodeId::new(raw.trim());
        }

        if let Some(raw) = lookup(ENV_VISIBLE_DEVICES) {
            let mut ordinals = Vec::new();
            for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let ordinal = part.parse::<usize>().map_err(|e| {
                    MemspaceError::InvalidConfig(format!(
                        "{}={:?}: {}",
                        ENV_VISIBLE_DEVICES, raw, e
                    ))
                })?;
                ordinals.push(ordinal);
            }
            self.registry.visible_devices = Some(ordinals);
        }

        if let Some(raw) = lookup(ENV_DISABLE_IPC) {
            let raw = raw.trim().to_ascii_lowercase();
            if raw != "0" && raw != "false" {
                self.transfer.enable_ipc = false;
            }
        }

        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.as_str().is_empty() {
            return Err(MemspaceError::InvalidConfig(
                "node id must not be empty".to_string(),
            ));
        }

        if let Some(list) = &self.registry.visible_devices {
            let mut sorted = list.clone();
            sorted.sort_unstable();
            sorted.dedup();
            if sorted.len() != list.len() {
                return Err(MemspaceError::InvalidConfig(format!(
                    "visible_devices contains duplicates: {:?}",
                    list
                )));
            }
        }

        if self.execution.thread_name_prefix.is_empty() {
            return Err(MemspaceError::InvalidConfig(
                "thread_name_prefix must not be empty".to_string(),
            ));
        }

        if let Some(size) = self.execution.stack_size {
            if size < 64 * 1024 {
                return Err(MemspaceError::InvalidConfig(format!(
                    "stack_size {} is below the 64 KiB minimum",
                    size
                )));
            }
        }

        Ok(())
    }
}

/// Builder for [`MemspaceConfig`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: MemspaceConfig,
}

impl ConfigBuilder {
    /// Create a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the development preset.
    #[must_use]
    pub fn development() -> Self {
        Self {
            config: MemspaceConfig::development(),
        }
    }

    /// Start from the production preset.
    #[must_use]
    pub fn production() -> Self {
        Self {
            config: MemspaceConfig::production(),
        }
    }

    /// Set the worker id.
    #[must_use]
    pub fn with_worker(mut self, worker: WorkerId) -> Self {
        self.config.worker = worker;
        self
    }

    /// Set the node id.
    #[must_use]
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.config.node = NodeId::new(node);
        self
    }

    /// Set the driver backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Restrict device discovery.
    #[must_use]
    pub fn with_visible_devices(mut self, devices: Vec<usize>) -> Self {
        self.config.registry.visible_devices = Some(devices);
        self
    }

    /// Enable or disable shared-memory transfers.
    #[must_use]
    pub fn with_ipc(mut self, enabled: bool) -> Self {
        self.config.transfer.enable_ipc = enabled;
        self
    }

    /// Enable or disable the device sync after uploads.
    #[must_use]
    pub fn with_sync_after_upload(mut self, enabled: bool) -> Self {
        self.config.transfer.sync_after_upload = enabled;
        self
    }

    /// Enable or disable affinity mismatch warnings.
    #[must_use]
    pub fn with_affinity_warnings(mut self, enabled: bool) -> Self {
        self.config.transfer.warn_on_affinity_mismatch = enabled;
        self
    }

    /// Set the task thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.execution.thread_name_prefix = prefix.into();
        self
    }

    /// Set the task thread stack size.
    #[must_use]
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.config.execution.stack_size = Some(bytes);
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<MemspaceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
