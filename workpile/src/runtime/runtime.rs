use crate::context::{self, Core};
use crate::runtime::pool::{ThreadPool, WorkerInit};
use crate::runtime::scheduler::{Handle, Scheduler};
use crate::runtime::worker;
use crate::task::{AFFINITY_ANY, NUM_PRIORITIES};
use anyhow::{Result, anyhow};
use crossbeam_deque::Worker as StealDeque;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Rounds of victim probing before a worker gives up and parks.
const MAX_STEAL_RETRIES: usize = 4;

/// Bounded park. A push can slip into the window between a worker's failed
/// queue scan and its sleep; the timeout caps what that race can cost.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn(u16) -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    ThreadNameFn(Arc::new(|worker_index| format!("workpile-{}", worker_index)))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The closure itself isn't printable; print a placeholder.
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and starts a [`Runtime`].
#[derive(Debug)]
pub struct Builder {
    /// Total worker count, including the initiating thread (worker 0).
    ///
    /// Defaults to one worker per CPU core.
    worker_threads: Option<usize>,

    /// Name fn for threads spawned by the runtime.
    thread_name: ThreadNameFn,

    /// Stack size for threads spawned by the runtime.
    thread_stack_size: Option<usize>,

    max_steal_retries: usize,

    park_timeout: Duration,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            max_steal_retries: MAX_STEAL_RETRIES,
            park_timeout: PARK_TIMEOUT,
        }
    }

    /// Total number of workers, the initiating thread included: `n` means
    /// this thread plus `n - 1` spawned threads.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets the name of threads spawned by the runtime.
    ///
    /// The default name is "workpile-{worker_index}".
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move |_| val.clone()));
        self
    }

    /// Sets a function from worker index to thread name.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(u16) -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for spawned worker threads.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// How many rounds of victim probing a worker attempts before parking.
    #[track_caller]
    pub fn max_steal_retries(mut self, val: usize) -> Self {
        assert!(val > 0, "max steal retries cannot be set to 0");
        self.max_steal_retries = val;
        self
    }

    /// Upper bound on one parked sleep. Smaller values trade idle wakeups
    /// for scheduling latency in the park race window.
    pub fn park_timeout(mut self, val: Duration) -> Self {
        self.park_timeout = val;
        self
    }

    /// Starts the configured runtime: registers the calling thread as
    /// worker 0 and spawns the remaining workers. Tasks may be created and
    /// scheduled from this thread as soon as this returns.
    ///
    /// At most one runtime may be active in the process at a time.
    pub fn try_build(self) -> Result<Runtime> {
        let cfg: RuntimeConfig = self.try_into()?;

        let mut active = ACTIVE.lock();
        if active.is_some() {
            return Err(anyhow!("a runtime is already active in this process"));
        }

        // Build every worker's deques up front; the stealers cross-connect
        // them before any thread starts.
        let deques = (0..cfg.worker_threads)
            .map(|_| std::array::from_fn(|_| StealDeque::new_lifo()))
            .collect::<Vec<[StealDeque<_>; NUM_PRIORITIES]>>();
        let stealers = deques
            .iter()
            .map(|per_priority| {
                std::array::from_fn(|priority| per_priority[priority].stealer())
            })
            .collect::<Vec<_>>();

        let handle = Scheduler::new(cfg.clone()).into_handle();

        let mut inits = deques
            .into_iter()
            .enumerate()
            .map(|(index, deques)| WorkerInit {
                worker_index: index as u16,
                deques,
                // Each worker sees every *other* worker's stealers.
                steal_order: stealers
                    .iter()
                    .enumerate()
                    .filter(|(victim, _)| *victim != index)
                    .map(|(_, stealers)| stealers.clone())
                    .collect(),
            })
            .collect::<Vec<_>>();

        // Worker 0 is this thread.
        let init = inits.remove(0);
        context::init(Core::new(0, handle.clone(), init.deques, init.steal_order));

        let pool = match ThreadPool::new(&handle, inits) {
            Ok(pool) => pool,
            Err(e) => {
                context::clear();
                return Err(e);
            }
        };

        *active = Some(handle.clone());
        drop(active);

        tracing::debug!(workers = cfg.worker_threads, "runtime started");
        Ok(Runtime { handle, pool, ended: false })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

/// The active runtime's scheduler, if any. Set by `try_build`, cleared by
/// `end`; this is what makes the interrupt entry points callable from any
/// thread.
static ACTIVE: Mutex<Option<Handle>> = Mutex::new(None);

pub(crate) fn active_handle() -> Option<Handle> {
    ACTIVE.lock().clone()
}

/// A running worker pool. Build one with [`Builder`]; tear it down with
/// [`Runtime::end`] (or by dropping it).
pub struct Runtime {
    handle: Handle,
    pool: ThreadPool,
    ended: bool,
}

impl Runtime {
    /// The initiating thread joins the pool as worker 0 and runs the
    /// scheduling loop until [`crate::interrupt_main`] (or
    /// [`crate::interrupt`]) fires. Must be called from the thread that
    /// built the runtime.
    pub fn enter(&self) {
        let worker_index = context::with_core(|core| core.worker_index);
        debug_assert_eq!(worker_index, 0, "enter must be called from the initiating thread");

        worker::run(&self.handle, worker_index);
    }

    /// Signal every worker to stop at its next loop boundary. Cooperative:
    /// running bodies complete first.
    pub fn interrupt(&self) {
        self.handle.interrupt();
    }

    /// Signal only worker 0, so [`Runtime::enter`] returns.
    pub fn interrupt_main(&self) {
        self.handle.interrupt_main();
    }

    /// Tear the pool down: interrupt every worker, join them, and release
    /// the process-wide registration. Queued tasks that never ran are
    /// dropped.
    pub fn end(mut self) -> Result<()> {
        self.end_inner()
    }

    fn end_inner(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;

        self.handle.interrupt();
        let res = self.pool.join_all();

        *ACTIVE.lock() = None;

        // Dropping worker 0's context drops its deques, releasing any tasks
        // still queued there; the spawned workers already did the same on
        // exit. Pinned queues die with the scheduler.
        context::clear();

        tracing::debug!("runtime ended");
        res
    }
}

// Test-only helpers
#[cfg(test)]
impl Runtime {
    pub(crate) fn scheduler_handle(&self) -> Handle {
        self.handle.clone()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let _ = self.end_inner();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.handle.cfg.worker_threads)
            .finish()
    }
}

/// Validated configuration, cloned into every worker.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) max_steal_retries: usize,
    pub(crate) park_timeout: Duration,
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        // The affinity field reserves one sentinel value.
        if self.worker_threads >= AFFINITY_ANY as usize {
            return Err(anyhow!(
                "worker_threads must be below {}",
                AFFINITY_ANY,
            ));
        }

        if self.park_timeout.is_zero() {
            return Err(anyhow!("park_timeout must be non-zero"));
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn for_tests(worker_threads: usize) -> RuntimeConfig {
        RuntimeConfig {
            worker_threads,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            max_steal_retries: MAX_STEAL_RETRIES,
            park_timeout: PARK_TIMEOUT,
        }
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(val) => val,
            None => thread::available_parallelism()?.get(),
        };

        let cfg = RuntimeConfig {
            worker_threads,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            max_steal_retries: builder.max_steal_retries,
            park_timeout: builder.park_timeout,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    // The config is cloned and sent into each spawned worker.
    assert_impl_all!(RuntimeConfig: Send, Sync, Clone);

    #[test]
    fn test_config_rejects_zero_park_timeout() {
        let res: Result<RuntimeConfig> = Builder::new()
            .worker_threads(1)
            .park_timeout(Duration::ZERO)
            .try_into();
        assert!(res.is_err());
    }

    #[test]
    #[should_panic(expected = "worker threads cannot be set to 0")]
    fn test_zero_workers_panics() {
        let _ = Builder::new().worker_threads(0);
    }
}
