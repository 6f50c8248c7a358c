use crate::context::{self, Core, CurrentTaskGuard};
use crate::runtime::scheduler::Handle;
use crate::task::{Priority, Ready, Task, TaskState};
#[allow(unused)]
use crate::utils::tracker::{Call, Method};
use crossbeam_deque::Steal;
use std::iter;

/// The scheduling loop. Each pass multiplexes, in order: the continuation
/// slot, the worker's own pinned FIFOs, its own deques, then theft — the
/// first three and the victims' deques all scanned highest priority first.
/// Runs until an interrupt flag covering this worker is raised.
pub(crate) fn run(handle: &Handle, worker_index: u16) {
    tracing::debug!(worker = worker_index, "worker loop starting");

    let mut continuation: Option<Ready> = None;

    loop {
        if handle.should_exit(worker_index) {
            break;
        }

        // A returned continuation bypasses every queue: depth first, on the
        // worker that produced it.
        let next = continuation.take().or_else(|| find_task(handle, worker_index));

        match next {
            Some(ready) => continuation = run_task(handle, ready),
            None => handle.remotes[worker_index as usize]
                .parker
                .park(handle.cfg.park_timeout),
        }
    }

    tracing::debug!(worker = worker_index, "worker loop exited");
}

/// Run one queued task (and any continuation chain it produces) without
/// entering the loop. Backs the public `run_any_task`.
pub(crate) fn run_one(handle: &Handle, worker_index: u16) -> bool {
    let Some(ready) = find_task(handle, worker_index) else {
        return false;
    };

    let mut next = run_task(handle, ready);
    while let Some(ready) = next {
        next = run_task(handle, ready);
    }

    true
}

fn find_task(handle: &Handle, worker_index: u16) -> Option<Ready> {
    handle.remotes[worker_index as usize]
        .pop_pinned()
        .or_else(|| context::with_core(|core| pop_own(core).or_else(|| steal(handle, core))))
}

fn pop_own(core: &Core) -> Option<Ready> {
    Priority::ALL
        .iter()
        .find_map(|priority| core.deques[priority.index()].pop())
}

/// Probe victims in this worker's private order, each victim's deques
/// highest priority first. A round that only observed contention retries, up
/// to the configured bound.
fn steal(handle: &Handle, core: &Core) -> Option<Ready> {
    iter::repeat_with(|| {
        core.steal_order
            .iter()
            .map(|victim| victim.iter().map(|stealer| stealer.steal()).collect())
            // Collect stops at the first Success, so a hit on an early
            // victim never probes the rest.
            .collect::<Steal<Ready>>()
    })
    .take(handle.cfg.max_steal_retries)
    .find(|outcome| !outcome.is_retry())
    .and_then(|outcome| outcome.success())
    .map(|ready| {
        handle.track(
            Method::Steal,
            Call::Steal { id: ready.id(), thief: core.worker_index },
        );
        ready
    })
}

/// Execute one task: mark it RUNNING, invoke the body, settle the end
/// count, and hand back the continuation.
fn run_task(handle: &Handle, ready: Ready) -> Option<Ready> {
    let cell = ready.into_cell();
    cell.raw().transition(TaskState::Ready, TaskState::Running);

    let returned = {
        let _guard = CurrentTaskGuard::enter(cell.raw());
        // Safety: this worker owns the READY -> RUNNING transition, so it is
        // the single caller.
        unsafe { cell.raw().invoke() }
    };

    // The returned task was never `scheduled()`; perform that release here.
    // When it still has outstanding start dependencies, whichever
    // predecessor resolves last promotes it through the queues instead.
    let continuation = returned.and_then(Task::into_continuation);

    if cell.raw().end_dec() == 0 {
        handle.end_completion(cell);
    }

    continuation
}
