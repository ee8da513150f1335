//! Asynchronous simulated command streams.
//!
//! Each stream is a dedicated OS thread draining a FIFO of operations, so
//! work enqueued on one stream runs in issue order while different streams
//! run concurrently, like hardware queues.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use memspace_core::error::{MemspaceError, Result};
use memspace_core::types::{ContextHandle, StreamHandle};

type Op = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Progress {
    pending: u64,
    fault: Option<String>,
}

/// A one-shot completion flag, the simulated counterpart of a device event.
#[derive(Default)]
pub(crate) struct SimEvent {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl SimEvent {
    pub(crate) fn fire(&self) {
        *self.fired.lock() = true;
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut fired = self.fired.lock();
        while !*fired {
            self.cond.wait(&mut fired);
        }
    }
}

pub(crate) struct SimStream {
    handle: StreamHandle,
    context: ContextHandle,
    latency: Option<Duration>,
    sender: Mutex<Option<mpsc::Sender<Op>>>,
    progress: Arc<(Mutex<Progress>, Condvar)>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimStream {
    pub(crate) fn spawn(
        handle: StreamHandle,
        context: ContextHandle,
        latency: Option<Duration>,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Op>();
        let worker = std::thread::Builder::new()
            .name(format!("memspace-sim-stream-{}", handle.raw()))
            .spawn(move || {
                for op in receiver {
                    op();
                }
            })
            .map_err(|e| MemspaceError::BackendError(format!("failed to spawn stream thread: {}", e)))?;

        Ok(Self {
            handle,
            context,
            latency,
            sender: Mutex::new(Some(sender)),
            progress: Arc::new((Mutex::new(Progress::default()), Condvar::new())),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub(crate) fn context(&self) -> ContextHandle {
        self.context
    }

    /// Append an operation. Returns immediately.
    pub(crate) fn enqueue(&self, op: impl FnOnce() + Send + 'static) -> Result<()> {
        let progress = self.progress.clone();
        let latency = self.latency;
        let stream = self.handle;

        let wrapped: Op = Box::new(move || {
            if let Some(latency) = latency {
                std::thread::sleep(latency);
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(op));

            let (lock, cond) = &*progress;
            let mut state = lock.lock();
            if let Err(payload) = outcome {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "stream operation panicked".to_string());
                error!(stream = %stream, error = %msg, "Stream operation faulted");
                state.fault.get_or_insert(msg);
            }
            state.pending -= 1;
            cond.notify_all();
        });

        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| MemspaceError::BackendError(format!("{} is destroyed", self.handle)))?;

        self.progress.0.lock().pending += 1;
        if sender.send(wrapped).is_err() {
            let (lock, cond) = &*self.progress;
            lock.lock().pending -= 1;
            cond.notify_all();
            return Err(MemspaceError::BackendError(format!("{} worker exited", self.handle)));
        }
        trace!(stream = %self.handle, "Operation enqueued");
        Ok(())
    }

    /// Block until every enqueued operation has run. A faulted stream
    /// reports its first fault on every later synchronization.
    pub(crate) fn synchronize(&self) -> Result<()> {
        let (lock, cond) = &*self.progress;
        let mut state = lock.lock();
        while state.pending > 0 {
            cond.wait(&mut state);
        }
        match &state.fault {
            Some(msg) => Err(MemspaceError::BackendError(format!(
                "{} faulted: {}",
                self.handle, msg
            ))),
            None => Ok(()),
        }
    }

    /// Drain outstanding work and stop the worker thread.
    pub(crate) fn shutdown(&self) {
        let _ = self.synchronize();
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SimStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stream() -> SimStream {
        SimStream::spawn(StreamHandle(1), ContextHandle(1), None).unwrap()
    }

    #[test]
    fn test_operations_run_in_issue_order() {
        let s = stream();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = log.clone();
            s.enqueue(move || log.lock().push(i)).unwrap();
        }
        s.synchronize().unwrap();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_enqueue_does_not_block() {
        let s = stream();
        let gate = Arc::new(SimEvent::default());
        let ran = Arc::new(AtomicUsize::new(0));

        let (g, r) = (gate.clone(), ran.clone());
        s.enqueue(move || {
            g.wait();
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        // The caller returns while the stream is still blocked on the gate.
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        gate.fire();
        s.synchronize().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fault_is_sticky() {
        let s = stream();
        s.enqueue(|| panic!("bad kernel")).unwrap();
        assert!(s.synchronize().is_err());
        s.enqueue(|| ()).unwrap();
        assert!(s.synchronize().is_err());
    }
}
