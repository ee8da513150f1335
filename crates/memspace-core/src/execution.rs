//! Running task closures on a device.
//!
//! The [`ExecutionAdapter`] runs a closure as a blocking unit of work with
//! the target processor's context active. The scheduler state the caller
//! wants the task to observe is passed in explicitly and moved into the
//! worker thread; nothing is read from the caller's thread-locals.
//!
//! Failures keep their cause. A returned error is boxed and can be
//! downcast again; a panic keeps its message, source location and the
//! backtrace captured at the panic site.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};

use crate::config::ExecutionConfig;
use crate::context::activate;
use crate::descriptor::Processor;
use crate::error::{MemspaceError, Result};
use crate::registry::DeviceRegistry;
use crate::types::StreamHandle;

/// Boxed error returned by a task closure.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// What a running task sees.
#[derive(Debug)]
pub struct TaskContext<S> {
    state: S,
    processor: Processor,
    stream: StreamHandle,
}

impl<S> TaskContext<S> {
    /// Scheduler state captured from the submitting thread.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Processor the task runs on.
    pub fn processor(&self) -> Processor {
        self.processor
    }

    /// Active device stream.
    pub fn stream(&self) -> StreamHandle {
        self.stream
    }
}

/// Original cause of a task failure.
#[derive(Debug)]
pub enum FailureCause {
    /// The closure returned an error.
    Error(BoxError),
    /// The closure panicked with this message.
    Panic(String),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Error(e) => write!(f, "{}", e),
            FailureCause::Panic(msg) => write!(f, "panicked: {}", msg),
        }
    }
}

/// A failed task: where it ran, why it failed, and where.
#[derive(Debug)]
pub struct TaskFailure {
    processor: Processor,
    cause: FailureCause,
    location: Option<String>,
    backtrace: Backtrace,
}

impl TaskFailure {
    /// Processor the task ran on.
    pub fn processor(&self) -> Processor {
        self.processor
    }

    /// Original cause.
    pub fn cause(&self) -> &FailureCause {
        &self.cause
    }

    /// Whether the task panicked.
    pub fn is_panic(&self) -> bool {
        matches!(self.cause, FailureCause::Panic(_))
    }

    /// Panic message, if the task panicked.
    pub fn panic_message(&self) -> Option<&str> {
        match &self.cause {
            FailureCause::Panic(msg) => Some(msg),
            FailureCause::Error(_) => None,
        }
    }

    /// Source location of the panic.
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// Backtrace captured at the failure site.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// The returned error, if it has type `E`.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match &self.cause {
            FailureCause::Error(e) => e.downcast_ref::<E>(),
            FailureCause::Panic(_) => None,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task on {} failed: {}", self.processor, self.cause)?;
        if let Some(location) = &self.location {
            write!(f, " at {}", location)?;
        }
        Ok(())
    }
}

struct PanicSite {
    message: String,
    location: Option<String>,
    backtrace: Backtrace,
}

thread_local! {
    static IN_TASK: Cell<bool> = const { Cell::new(false) };
    static PANIC_SITE: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Chain a hook in front of the current panic hook that records the panic
/// site of task threads. Installed once per process.
fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if IN_TASK.with(Cell::get) {
                let site = PanicSite {
                    message: payload_message(info.payload()),
                    location: info.location().map(|l| l.to_string()),
                    backtrace: Backtrace::force_capture(),
                };
                PANIC_SITE.with(|s| *s.borrow_mut() = Some(site));
            }
            previous(info);
        }));
    });
}

struct TaskScope;

impl TaskScope {
    fn enter() -> Self {
        IN_TASK.with(|t| t.set(true));
        PANIC_SITE.with(|s| s.borrow_mut().take());
        TaskScope
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        IN_TASK.with(|t| t.set(false));
    }
}

fn run_task<S, A, R, E, F>(
    registry: &DeviceRegistry,
    processor: Processor,
    state: S,
    f: F,
    args: A,
) -> Result<R>
where
    E: Into<BoxError>,
    F: FnOnce(&TaskContext<S>, A) -> std::result::Result<R, E>,
{
    let guard = activate(registry, processor)?;
    let ctx = TaskContext {
        state,
        processor,
        stream: guard.stream(),
    };

    let outcome = {
        let _scope = TaskScope::enter();
        panic::catch_unwind(AssertUnwindSafe(|| f(&ctx, args)))
    };

    let failure = match outcome {
        Ok(Ok(result)) => return Ok(result),
        Ok(Err(e)) => TaskFailure {
            processor,
            cause: FailureCause::Error(e.into()),
            location: None,
            backtrace: Backtrace::force_capture(),
        },
        Err(payload) => match PANIC_SITE.with(|s| s.borrow_mut().take()) {
            Some(site) => TaskFailure {
                processor,
                cause: FailureCause::Panic(site.message),
                location: site.location,
                backtrace: site.backtrace,
            },
            None => TaskFailure {
                processor,
                cause: FailureCause::Panic(payload_message(payload.as_ref())),
                location: None,
                backtrace: Backtrace::force_capture(),
            },
        },
    };

    tracing::debug!(processor = %processor, failure = %failure, "Task failed");
    Err(MemspaceError::TaskFailed(Box::new(failure)))
}

/// Runs task closures on the processors of one worker.
pub struct ExecutionAdapter {
    registry: Arc<DeviceRegistry>,
    config: ExecutionConfig,
    spawned: AtomicU64,
}

impl ExecutionAdapter {
    /// Create an adapter for the registry's worker.
    pub fn new(registry: Arc<DeviceRegistry>, config: ExecutionConfig) -> Self {
        install_panic_hook();
        Self {
            registry,
            config,
            spawned: AtomicU64::new(0),
        }
    }

    /// Registry the adapter executes against.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Number of tasks submitted so far.
    pub fn tasks_spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    fn check_owner(&self, processor: &Processor) -> Result<()> {
        if processor.owner != self.registry.worker() {
            return Err(MemspaceError::ForeignDevice {
                device: processor.device,
                owner: processor.owner,
                local: self.registry.worker(),
            });
        }
        Ok(())
    }

    /// Run `f(ctx, args)` on a blocking worker thread with `processor`
    /// active and await its result.
    ///
    /// Result buffers are not synchronized; whoever reads them next does.
    pub async fn execute<S, A, R, E, F>(
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
        self.check_owner(&processor)?;
        let task = self.spawned.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(processor = %processor, task, "Submitting task");

        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || run_task(&registry, processor, state, f, args))
            .await
            .map_err(|e| MemspaceError::InvalidState(format!("task {} did not complete: {}", task, e)))?
    }

    /// Like [`execute`](Self::execute), on a dedicated named thread that is
    /// joined before returning.
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
        self.check_owner(&processor)?;
        let task = self.spawned.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(processor = %processor, task, "Submitting task");

        let mut builder = std::thread::Builder::new()
            .name(format!("{}-{}", self.config.thread_name_prefix, task));
        if let Some(size) = self.config.stack_size {
            builder = builder.stack_size(size);
        }

        let registry = self.registry.clone();
        let handle = builder
            .spawn(move || run_task(&registry, processor, state, f, args))
            .map_err(|e| MemspaceError::BackendError(format!("failed to spawn task thread: {}", e)))?;
        handle
            .join()
            .map_err(|_| MemspaceError::InvalidState(format!("task {} thread aborted", task)))?
    }
}

impl fmt::Debug for ExecutionAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionAdapter")
            .field("worker", &self.registry.worker())
            .field("config", &self.config)
            .field("spawned", &self.tasks_spawned())
            .finish()
    }
}
