use crate::context::{self, Core};
use crate::runtime::scheduler::Handle;
use crate::runtime::worker;
use crate::task::{NUM_PRIORITIES, Ready};
use anyhow::{Result, anyhow};
use crossbeam_deque::{Stealer, Worker as StealDeque};
use parking_lot::Mutex;
use std::thread;

/// Startup bundle moved into a spawned worker thread: the owner side of its
/// deques and its view of everybody else's stealers.
pub(crate) struct WorkerInit {
    pub(crate) worker_index: u16,
    pub(crate) deques: [StealDeque<Ready>; NUM_PRIORITIES],
    pub(crate) steal_order: Vec<[Stealer<Ready>; NUM_PRIORITIES]>,
}

/// The spawned side of the pool: workers 1..N. The initiating thread is
/// worker 0 and joins through `Runtime::enter`.
pub(crate) struct ThreadPool {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawn one thread per init. On spawn failure the already-running
    /// workers are interrupted and joined before the error is surfaced;
    /// startup either completes or leaves nothing behind.
    pub(crate) fn new(scheduler: &Handle, inits: Vec<WorkerInit>) -> Result<Self> {
        let mut handles = Vec::with_capacity(inits.len());

        for init in inits {
            match spawn_worker_thread(scheduler.clone(), init) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    scheduler.interrupt();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self { handles: Mutex::new(handles) })
    }

    pub(crate) fn join_all(&self) -> Result<()> {
        let mut handles = self.handles.lock();

        let panicked = handles
            .drain(..)
            .map(|handle| handle.join())
            .filter(|joined| joined.is_err())
            .count();

        if panicked == 0 {
            Ok(())
        } else {
            Err(anyhow!("{} worker thread(s) panicked", panicked))
        }
    }
}

fn spawn_worker_thread(
    scheduler: Handle,
    init: WorkerInit,
) -> Result<thread::JoinHandle<()>> {
    let mut builder = thread::Builder::new().name(scheduler.cfg.thread_name.0(init.worker_index));

    if let Some(stack_size) = scheduler.cfg.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    let worker_index = init.worker_index;
    builder
        .spawn(move || {
            context::init(Core::new(
                worker_index,
                scheduler.clone(),
                init.deques,
                init.steal_order,
            ));

            worker::run(&scheduler, worker_index);

            context::clear();
        })
        .map_err(|e| anyhow!("failed to spawn worker {}: {}", worker_index, e))
}
