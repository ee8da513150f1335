//! Producer/consumer ordering between device streams.
//!
//! Within one device, work on the single registry stream is ordered by
//! issue order. Across devices of one worker, ordering is an event edge:
//! record on the producer stream, wait on the consumer stream. Across
//! workers there is no shared event, so the producer device is drained.

use std::sync::Arc;

use crate::context::activate;
use crate::descriptor::{Location, MemorySpace};
use crate::driver::DeviceDriver;
use crate::error::Result;
use crate::registry::DeviceRegistry;
use crate::types::{EventHandle, StreamHandle};

/// A recorded stream event, destroyed on drop.
pub struct StreamEvent {
    driver: Arc<dyn DeviceDriver>,
    event: EventHandle,
}

impl StreamEvent {
    /// Record an event capturing all work enqueued on `stream` so far.
    pub fn record(driver: &Arc<dyn DeviceDriver>, stream: StreamHandle) -> Result<Self> {
        let event = driver.record_event(stream)?;
        Ok(Self {
            driver: driver.clone(),
            event,
        })
    }

    /// Make later work on `stream` wait for this event.
    pub fn wait_on(&self, stream: StreamHandle) -> Result<()> {
        self.driver.stream_wait_event(stream, self.event)
    }

    /// Native handle.
    pub fn handle(&self) -> EventHandle {
        self.event
    }
}

impl Drop for StreamEvent {
    fn drop(&mut self) {
        if let Err(e) = self.driver.destroy_event(self.event) {
            tracing::warn!(event = %self.event, error = %e, "Failed to destroy stream event");
        }
    }
}

/// Block until all outstanding work on `target`'s device has completed.
///
/// Host locations and devices owned by other workers are a no-op.
pub fn sync_local(registry: &DeviceRegistry, target: &Location) -> Result<()> {
    let space = match target {
        Location::Device(space) if space.owner == registry.worker() => space,
        _ => return Ok(()),
    };

    let guard = activate(registry, *space)?;
    tracing::trace!(device = %space.device, "Synchronizing device");
    registry.driver().synchronize_context(guard.activation().context)
}

/// Make work later issued on `to`'s stream observe all work already issued
/// on `from`'s stream.
///
/// Same device: nothing to do. Two devices of this worker: event edge,
/// recorded under `from`'s context and awaited under `to`'s, never holding
/// both at once. Different workers: drain `from`.
pub fn sync_cross(registry: &DeviceRegistry, from: &Location, to: &Location) -> Result<()> {
    let (src, dst) = match (from, to) {
        (Location::Device(src), Location::Device(dst)) => (src, dst),
        (Location::Device(_), Location::Host(_)) => return sync_local(registry, from),
        _ => return Ok(()),
    };

    let local = registry.worker();
    if src.owner != local || dst.owner != local {
        return sync_local(registry, from);
    }
    if src == dst {
        return Ok(());
    }

    event_edge(registry, src, dst)
}

fn event_edge(registry: &DeviceRegistry, src: &MemorySpace, dst: &MemorySpace) -> Result<()> {
    let event = {
        let guard = activate(registry, *src)?;
        StreamEvent::record(registry.driver(), guard.stream())?
    };

    let guard = activate(registry, *dst)?;
    event.wait_on(guard.stream())?;
    tracing::trace!(from = %src.device, to = %dst.device, event = %event.handle(), "Stream event edge");
    Ok(())
}
