//! Thread-local worker state. Every thread that participates in the system
//! (the spawned workers and the initiating thread) carries a [`Core`]:
//! the owner side of its work-stealing deques, its arena free list, and the
//! task it is currently running.

use crate::arena::ARENA;
use crate::runtime::scheduler::Handle;
use crate::task::cell::RawCell;
use crate::task::{NUM_PRIORITIES, Ready};
use crossbeam_deque::{Stealer, Worker as StealDeque};
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::thread_local;

pub(crate) struct Core {
    pub(crate) worker_index: u16,

    pub(crate) handle: Handle,

    /// Owner side of this worker's deques, one per priority. Owner pushes
    /// and pops LIFO; other workers steal FIFO through the stealers.
    pub(crate) deques: [StealDeque<Ready>; NUM_PRIORITIES],

    /// Every other worker's stealers, in this worker's private probe order.
    pub(crate) steal_order: Vec<[Stealer<Ready>; NUM_PRIORITIES]>,

    /// Local arena free list. Spilled back to the global pool when the
    /// context is torn down.
    free_list: RefCell<Vec<NonNull<u8>>>,

    /// The task currently being run by this thread; the target of
    /// RUNNING-state dependencies.
    current_task: Cell<Option<RawCell>>,
}

impl Core {
    pub(crate) fn new(
        worker_index: u16,
        handle: Handle,
        deques: [StealDeque<Ready>; NUM_PRIORITIES],
        mut steal_order: Vec<[Stealer<Ready>; NUM_PRIORITIES]>,
    ) -> Core {
        // Shuffle so workers probe victims in different orders; this spreads
        // contention when many workers go hunting at once.
        fastrand::shuffle(&mut steal_order);

        Core {
            worker_index,
            handle,
            deques,
            steal_order,
            free_list: RefCell::new(Vec::new()),
            current_task: Cell::new(None),
        }
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<Core>> = const { RefCell::new(None) };
}

pub(crate) fn init(core: Core) {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        debug_assert!(ctx.is_none(), "context already initialized on this thread");
        *ctx = Some(core);
    });
}

/// Tear down this thread's context, spilling its arena free list back to the
/// global pool so the slots stay reusable.
pub(crate) fn clear() {
    let core = CONTEXT.with(|ctx| ctx.borrow_mut().take());
    if let Some(core) = core {
        ARENA.flush(core.free_list.into_inner().into_iter());
    }
}

#[track_caller]
pub(crate) fn with_core<F, R>(f: F) -> R
where
    F: FnOnce(&Core) -> R,
{
    try_with_core(f).expect("the tasking runtime is not running on this thread")
}

pub(crate) fn try_with_core<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Core) -> R,
{
    // try_with keeps this callable while the thread-local is being torn
    // down (a cell released from a dying thread falls back to the global
    // arena path).
    CONTEXT.try_with(|ctx| ctx.borrow().as_ref().map(f)).ok().flatten()
}

/// Arena entry points that route through the local free list when this
/// thread has one.
pub(crate) fn arena_allocate() -> NonNull<u8> {
    try_with_core(|core| ARENA.allocate(&mut core.free_list.borrow_mut()))
        .unwrap_or_else(|| ARENA.allocate_global())
}

pub(crate) fn arena_free(slot: NonNull<u8>) {
    try_with_core(|core| ARENA.free(slot, &mut core.free_list.borrow_mut()))
        .unwrap_or_else(|| ARENA.free_global(slot));
}

pub(crate) fn current_task() -> Option<RawCell> {
    try_with_core(|core| core.current_task.get()).flatten()
}

/// Marks the task being run by this thread for the duration of its body.
/// Restores the previous value on drop, so bodies that run other tasks
/// inline nest correctly.
pub(crate) struct CurrentTaskGuard {
    prev: Option<RawCell>,
}

impl CurrentTaskGuard {
    pub(crate) fn enter(task: RawCell) -> CurrentTaskGuard {
        CurrentTaskGuard {
            prev: with_core(|core| core.current_task.replace(Some(task))),
        }
    }
}

impl Drop for CurrentTaskGuard {
    fn drop(&mut self) {
        with_core(|core| core.current_task.set(self.prev));
    }
}
