//! CPU Backend for memspace
//!
//! Simulated accelerators in host memory. Used for testing and as the
//! fallback when no GPU backend is available.
//!
//! # Model
//!
//! - A [`SimNode`] is one physical machine with a fixed set of devices
//! - A [`CpuDriver`] is one worker process's view of a node's devices
//! - Streams are OS threads draining an operation queue
//! - IPC handles resolve only inside the node that exported them
//!
//! # Example
//!
//! ```ignore
//! use memspace_cpu::{CpuDriver, CpuDriverConfig, SimNode};
//!
//! let node = SimNode::new("node-a", 2);
//! let worker0 = CpuDriver::on_node(&node, &[0, 1], CpuDriverConfig::default())?;
//! let worker1 = CpuDriver::on_node(&node, &[1, 0], CpuDriverConfig::default())?;
//! ```

#![warn(missing_docs)]

mod driver;
mod node;
mod stream;

pub use driver::{CpuDriver, CpuDriverConfig, CpuDriverStats};
pub use node::{PhysicalDevice, SimNode};
