use crate::context;
use crate::runtime::queues::Remote;
use crate::runtime::runtime::RuntimeConfig;
use crate::task::cell::CellRef;
use crate::task::{AFFINITY_ANY, Ready, TaskState};
#[allow(unused)]
use crate::utils::tracker::{Call, Method, Tracker};
use bitflags::bitflags;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Interrupts: u8 {
        /// Stop the initiating thread's loop only, so `enter` returns.
        const MAIN = 1;

        /// Stop every worker at its next park point.
        const ALL = 1 << 1;
    }
}

pub(crate) struct Scheduler {
    pub(crate) cfg: RuntimeConfig,

    /// Interrupt flag word, consumed cooperatively at loop boundaries.
    interrupts: AtomicU8,

    /// One record per worker, indexed by worker. Read-only after startup.
    pub(crate) remotes: Box<[Remote]>,

    #[cfg(test)]
    pub(crate) tracker: Tracker,
}

impl Scheduler {
    pub(crate) fn new(cfg: RuntimeConfig) -> Self {
        let remotes = (0..cfg.worker_threads).map(|_| Remote::new()).collect();

        Self {
            cfg,
            interrupts: AtomicU8::new(0),
            remotes,

            #[cfg(test)]
            tracker: Tracker::new(),
        }
    }

    pub(crate) fn into_handle(self) -> Handle {
        Handle(Arc::new(self))
    }

    pub(crate) fn interrupts(&self) -> Interrupts {
        Interrupts::from_bits_truncate(self.interrupts.load(Ordering::Acquire))
    }

    /// Whether the given worker's loop must exit.
    pub(crate) fn should_exit(&self, worker_index: u16) -> bool {
        let flags = self.interrupts();
        flags.contains(Interrupts::ALL)
            || (worker_index == 0 && flags.contains(Interrupts::MAIN))
    }

    fn raise(&self, flags: Interrupts) {
        self.interrupts.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    // Small price to pay to get introspection on scheduling decisions during
    // testing. No op in release builds.
    #[allow(unused)]
    #[inline(always)]
    pub(crate) fn track(&self, method: Method, call: Call) {
        #[cfg(test)]
        self.tracker.record(method, call);
    }
}

#[derive(Clone)]
pub(crate) struct Handle(Arc<Scheduler>);

impl Handle {
    /// Route a ready task to the queue selected by its affinity and
    /// priority: pinned tasks go to the target worker's FIFO, everything
    /// else to the current worker's own deque.
    pub(crate) fn push(&self, ready: Ready) {
        let affinity = ready.affinity();

        self.track(
            Method::Schedule,
            Call::Schedule {
                id: ready.id(),
                priority: ready.priority(),
                affinity: (affinity != AFFINITY_ANY).then_some(affinity),
            },
        );

        if affinity == AFFINITY_ANY {
            context::with_core(|core| {
                core.deques[ready.priority().index()].push(ready);
            });
            self.unpark_one();
        } else {
            debug_assert!(
                (affinity as usize) < self.remotes.len(),
                "affinity names a worker outside the pool",
            );
            self.remotes[affinity as usize].push_pinned(ready);
        }
    }

    /// A start dependency of `successor` resolved; promote it to the ready
    /// pool when none remain.
    pub(crate) fn promote_start(&self, successor: CellRef) {
        if successor.raw().start_dec() == 0 {
            self.track(Method::Promote, Call::Promote { id: successor.raw().id() });
            self.push(Ready::new(successor));
        }
    }

    /// A task's end count reached zero: mark it done, resolve its
    /// successors, and release the reference held by the caller. End chains
    /// are walked iteratively, so a long chain completing at once cannot
    /// overflow the stack.
    pub(crate) fn end_completion(&self, cell: CellRef) {
        let mut current = cell;
        loop {
            current.raw().transition(TaskState::Running, TaskState::Done);

            if let Some(successor) = current.raw().take_start_successor() {
                self.promote_start(successor);
            }

            let next = current.raw().take_end_successor();
            drop(current);

            match next {
                Some(successor) if successor.raw().end_dec() == 0 => current = successor,
                // Not the last end dependency (or no successor at all); the
                // slot reference drops here.
                _ => return,
            }
        }
    }

    /// Signal every worker to stop at its next loop boundary, then wake them
    /// all so none sleeps through it.
    pub(crate) fn interrupt(&self) {
        self.track(Method::Interrupt, Call::Interrupt { main_only: false });
        tracing::debug!("interrupting all workers");

        self.raise(Interrupts::ALL | Interrupts::MAIN);
        for remote in self.remotes.iter() {
            remote.parker.unpark();
        }
    }

    /// Signal only the initiating thread, so it may leave `enter`. Other
    /// workers keep running.
    pub(crate) fn interrupt_main(&self) {
        self.track(Method::Interrupt, Call::Interrupt { main_only: true });
        tracing::debug!("interrupting the initiating thread");

        self.raise(Interrupts::MAIN);
        self.remotes[0].parker.unpark();
    }

    /// Wake one parked worker, if any. Called after a push so new work does
    /// not sit in a queue while the pool sleeps.
    fn unpark_one(&self) {
        for remote in self.remotes.iter() {
            if remote.parker.is_parked() {
                remote.parker.unpark();
                return;
            }
        }
    }
}

#[doc(hidden)]
impl Deref for Handle {
    type Target = Arc<Scheduler>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Scheduler: Send, Sync);
    assert_impl_all!(Handle: Send, Sync, Clone);

    #[test]
    fn test_interrupt_flags_cover_workers() {
        let scheduler = Scheduler::new(RuntimeConfig::for_tests(2));

        assert!(!scheduler.should_exit(0));
        assert!(!scheduler.should_exit(1));

        scheduler.raise(Interrupts::MAIN);
        assert!(scheduler.should_exit(0));
        assert!(!scheduler.should_exit(1));

        scheduler.raise(Interrupts::ALL);
        assert!(scheduler.should_exit(1));
    }
}
