//! Thread-local device activation.
//!
//! Device work is issued against whichever context and stream are active
//! on the calling thread. [`activate`] switches them and returns a
//! [`ContextGuard`] that restores the previous activation when dropped,
//! including during unwinding. Guards nest and restore in LIFO order.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::descriptor::AsDevice;
use crate::driver::DeviceDriver;
use crate::error::Result;
use crate::registry::DeviceRegistry;
use crate::types::{ContextHandle, DeviceId, RegistryId, StreamHandle, WorkerId};

/// The device context and stream active on a thread.
#[derive(Clone)]
pub struct Activation {
    /// Registry the device belongs to.
    pub registry: RegistryId,
    /// Worker owning the device.
    pub worker: WorkerId,
    /// Active device.
    pub device: DeviceId,
    /// Active context.
    pub context: ContextHandle,
    /// Active stream.
    pub stream: StreamHandle,
    driver: Arc<dyn DeviceDriver>,
}

impl Activation {
    fn is_same(&self, other: &Activation) -> bool {
        self.registry == other.registry && self.device == other.device
    }
}

impl fmt::Debug for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activation")
            .field("registry", &self.registry)
            .field("worker", &self.worker)
            .field("device", &self.device)
            .field("context", &self.context)
            .field("stream", &self.stream)
            .finish()
    }
}

thread_local! {
    static ACTIVE: RefCell<Option<Activation>> = const { RefCell::new(None) };
}

/// The calling thread's activation.
pub fn current() -> Option<Activation> {
    ACTIVE.with(|a| a.borrow().clone())
}

/// The calling thread's active stream.
pub fn current_stream() -> Option<StreamHandle> {
    ACTIVE.with(|a| a.borrow().as_ref().map(|a| a.stream))
}

/// Restores the previous activation on drop.
#[must_use = "the device is deactivated as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Option<Activation>,
    installed: Activation,
    // Activation is per-thread; the guard must be dropped where it was made.
    _not_send: PhantomData<*const ()>,
}

impl ContextGuard {
    /// The activation this guard installed.
    pub fn activation(&self) -> &Activation {
        &self.installed
    }

    /// Stream made active by this guard.
    pub fn stream(&self) -> StreamHandle {
        self.installed.stream
    }
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("device", &self.installed.device)
            .field("stream", &self.installed.stream)
            .field("previous", &self.previous.as_ref().map(|p| p.device))
            .finish()
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let result = match &self.previous {
            Some(prev) if prev.is_same(&self.installed) => Ok(()),
            Some(prev) => prev.driver.set_current(Some(prev.context)),
            None => self.installed.driver.set_current(None),
        };
        if let Err(e) = result {
            tracing::warn!(device = %self.installed.device, error = %e, "Failed to restore device context");
        }

        tracing::trace!(
            device = %self.installed.device,
            restored = ?self.previous.as_ref().map(|p| p.device),
            "Context deactivated"
        );
        ACTIVE.with(|a| *a.borrow_mut() = self.previous.take());
    }
}

/// Make a device's context and stream active on the calling thread.
///
/// Fails with `ForeignDevice` if the target names another worker, and
/// `DeviceNotFound` if the registry does not know the device.
pub fn activate(registry: &DeviceRegistry, target: impl AsDevice) -> Result<ContextGuard> {
    let entry = registry.entry(target)?;
    let installed = Activation {
        registry: registry.id(),
        worker: registry.worker(),
        device: entry.device.id,
        context: entry.context,
        stream: entry.stream,
        driver: registry.driver().clone(),
    };

    let previous = current();
    let already_active = previous
        .as_ref()
        .map(|p| p.is_same(&installed))
        .unwrap_or(false);
    if !already_active {
        registry.driver().set_current(Some(installed.context))?;
    }

    tracing::trace!(worker = %installed.worker, device = %installed.device, "Context activated");
    ACTIVE.with(|a| *a.borrow_mut() = Some(installed.clone()));

    Ok(ContextGuard {
        previous,
        installed,
        _not_send: PhantomData,
    })
}

/// Run `f` with `target` active, restoring the previous activation on
/// every exit path.
pub fn with_context<R>(
    registry: &DeviceRegistry,
    target: impl AsDevice,
    f: impl FnOnce(&ContextGuard) -> R,
) -> Result<R> {
    let guard = activate(registry, target)?;
    Ok(f(&guard))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::error::MemspaceError;
    use crate::testing::MockDriver;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn registry(devices: usize) -> (Arc<MockDriver>, DeviceRegistry) {
        let driver = Arc::new(MockDriver::new(devices));
        let registry = DeviceRegistry::new(WorkerId(1), driver.clone(), &RegistryConfig::default());
        registry.init().unwrap();
        (driver, registry)
    }

    #[test]
    fn test_activate_sets_current() {
        let (driver, registry) = registry(2);
        let ctx1 = registry.context_for(DeviceId(1)).unwrap();

        assert!(current().is_none());
        {
            let guard = activate(&registry, DeviceId(1)).unwrap();
            assert_eq!(guard.activation().context, ctx1);
            assert_eq!(current_stream(), Some(registry.stream_for(DeviceId(1)).unwrap()));
            assert_eq!(driver.current_context(), Some(ctx1));
        }
        assert!(current().is_none());
        assert_eq!(driver.current_context(), None);
    }

    #[test]
    fn test_nested_guards_restore_lifo() {
        let (driver, registry) = registry(2);
        let ctx0 = registry.context_for(DeviceId(0)).unwrap();
        let ctx1 = registry.context_for(DeviceId(1)).unwrap();

        let outer = activate(&registry, DeviceId(0)).unwrap();
        with_context(&registry, DeviceId(1), |_| {
            assert_eq!(current().unwrap().device, DeviceId(1));
            assert_eq!(driver.current_context(), Some(ctx1));
        })
        .unwrap();
        assert_eq!(current().unwrap().device, DeviceId(0));
        assert_eq!(driver.current_context(), Some(ctx0));
        drop(outer);
        assert!(current().is_none());
    }

    #[test]
    fn test_restored_after_panic() {
        let (_driver, registry) = registry(2);
        let _outer = activate(&registry, DeviceId(0)).unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| {
            with_context(&registry, DeviceId(1), |_| panic!("boom")).unwrap();
        }));

        assert!(result.is_err());
        assert_eq!(current().unwrap().device, DeviceId(0));
    }

    #[test]
    fn test_foreign_processor_rejected() {
        let (_driver, registry) = registry(1);
        let mut proc = registry.processor(DeviceId(0)).unwrap();
        proc.owner = WorkerId(2);

        let err = activate(&registry, proc).unwrap_err();
        assert!(matches!(err, MemspaceError::ForeignDevice { .. }));
        assert!(current().is_none());
    }

    #[test]
    fn test_guard_debug_names_devices() {
        let (_driver, registry) = registry(2);
        let _outer = activate(&registry, DeviceId(0)).unwrap();
        let inner = activate(&registry, DeviceId(1)).unwrap();

        let text = format!("{:?}", inner);
        assert!(text.starts_with("ContextGuard"));
        assert!(text.contains(&format!("device: {:?}", DeviceId(1))));
        assert!(text.contains(&format!("previous: Some({:?})", DeviceId(0))));
    }

    #[test]
    fn test_reactivating_same_device_skips_driver() {
        let (driver, registry) = registry(1);
        let _outer = activate(&registry, DeviceId(0)).unwrap();
        driver.clear_ops();

        with_context(&registry, DeviceId(0), |_| ()).unwrap();
        assert!(driver.ops().is_empty());
    }
}
