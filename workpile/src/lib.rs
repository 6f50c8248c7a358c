//! A tasking system: schedule functions to run asynchronously on a pool of
//! system threads, with a few things a plain thread pool does not give you:
//!
//! 1. *Dependencies* between tasks. A task can require others to have ended
//!    before it starts, or before it is itself considered ended, which lets
//!    running tasks unfold a DAG on the fly.
//! 2. *Priorities*. A higher priority task is more likely to run next;
//!    ordering is approximate by design, enforced locally at every queue.
//! 3. *Affinities*. A task can be pinned to one specific worker, for
//!    anything that depends on a thread-bound context.
//!
//! Scheduling is distributed: each worker owns a work-stealing deque per
//! priority (depth first for the owner, breadth first for thieves) plus a
//! FIFO per priority for pinned tasks. A task body may return another task,
//! which runs immediately on the same worker, bypassing every queue.

pub mod runtime;
pub use runtime::{Builder, Runtime};

pub mod task;
pub use task::{Priority, Task, TaskSet};

pub(crate) mod arena;

pub(crate) mod context;

pub(crate) mod utils;

/// Signal every worker to stop at its next loop boundary. Thread-safe and
/// cooperative: running task bodies always complete. No-op when no runtime
/// is active.
pub fn interrupt() {
    if let Some(handle) = runtime::runtime::active_handle() {
        handle.interrupt();
    }
}

/// Signal only the initiating thread, so [`Runtime::enter`] returns while
/// the other workers keep draining tasks. Thread-safe. No-op when no
/// runtime is active.
pub fn interrupt_main() {
    if let Some(handle) = runtime::runtime::active_handle() {
        handle.interrupt_main();
    }
}

/// Run one ready task (and its continuation chain) on the calling thread,
/// right now. Returns whether anything was executed.
///
/// Meant to be called from inside a task body to overlap latency: a task
/// waiting on something external can keep its worker busy instead of
/// spinning. The executed task may itself call this, so mutually-waiting
/// bodies can recurse without bound; keep poll loops shallow.
///
/// # Panics
///
/// Panics when no runtime is active on this thread.
pub fn run_any_task() -> bool {
    let (handle, worker_index) =
        context::with_core(|core| (core.handle.clone(), core.worker_index));
    runtime::worker::run_one(&handle, worker_index)
}
