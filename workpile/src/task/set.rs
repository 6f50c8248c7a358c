use crate::context;
use crate::task::Task;
use crate::task::cell::Payload;
use crate::task::state::AFFINITY_ANY;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, Ordering};

/// Claim state shared by a set instance and its helpers.
pub(crate) struct SetState {
    /// Indices not yet claimed. Claims go through fetch_sub, so each index
    /// in `[0, n)` is observed by exactly one worker.
    remaining: AtomicIsize,
    body: Box<dyn Fn(usize) + Send + Sync + 'static>,
}

/// A task whose body runs `n` times, each invocation receiving a distinct
/// index in `[0, n)` — a parallel for in one allocation.
///
/// The first instance to run offers a helper task that idle workers can
/// steal; helpers ramp the same way, so a large set spreads across the pool
/// while a small one stays on a single worker. The set is not done until
/// every helper has drained.
///
/// Dependencies, priority and affinity are configured exactly like a plain
/// [`Task`].
pub struct TaskSet {
    task: Task,
}

impl TaskSet {
    pub fn new(n: usize, body: impl Fn(usize) + Send + Sync + 'static) -> TaskSet {
        TaskSet { task: Task::from_payload(None, Payload::Set(SetState::new(n, body))) }
    }

    pub fn with_name(
        name: &'static str,
        n: usize,
        body: impl Fn(usize) + Send + Sync + 'static,
    ) -> TaskSet {
        TaskSet { task: Task::from_payload(Some(name), Payload::Set(SetState::new(n, body))) }
    }

    /// Release the set to the scheduler. See [`Task::scheduled`].
    pub fn scheduled(self) {
        self.task.scheduled()
    }
}

impl SetState {
    fn new(n: usize, body: impl Fn(usize) + Send + Sync + 'static) -> Arc<SetState> {
        Arc::new(SetState {
            remaining: AtomicIsize::new(n as isize),
            body: Box::new(body),
        })
    }
}

impl Deref for TaskSet {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.task
    }
}

impl fmt::Debug for TaskSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskSet({:?})", self.task)
    }
}

/// Claim-and-run loop shared by the set instance and its helpers.
pub(crate) fn run_set(state: &Arc<SetState>) -> Option<Task> {
    // Offer one helper while more than one index remains so idle workers can
    // pitch in; helpers ramp the same way. The helper is an end-dependency
    // of the running instance: the chain of helpers keeps the set open until
    // the last one drains. A pinned set spawns no helpers — every index must
    // stay on the pinned worker.
    if state.remaining.load(Ordering::Relaxed) > 1
        && let Some(current) = context::current_task()
        && current.affinity() == AFFINITY_ANY
    {
        let helper = Task::from_payload(None, Payload::Set(Arc::clone(state)));
        helper.set_priority(current.priority());
        helper.ends_current();
        helper.scheduled();
    }

    loop {
        let prev = state.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            return None;
        }
        (state.body)((prev - 1) as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_set_claims_each_index_once() {
        let n = 100;
        let hits = Arc::new((0..n).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());

        let seen = Arc::clone(&hits);
        let state = SetState::new(n, move |i| {
            seen[i].fetch_add(1, Ordering::Relaxed);
        });

        // Drain the state from two plain threads; the claim loop alone must
        // guarantee exactly-once regardless of who participates.
        let a = Arc::clone(&state);
        let handle = std::thread::spawn(move || {
            loop {
                let prev = a.remaining.fetch_sub(1, Ordering::AcqRel);
                if prev <= 0 {
                    break;
                }
                (a.body)((prev - 1) as usize);
            }
        });
        loop {
            let prev = state.remaining.fetch_sub(1, Ordering::AcqRel);
            if prev <= 0 {
                break;
            }
            (state.body)((prev - 1) as usize);
        }
        handle.join().expect("claim thread panicked");

        for hit in hits.iter() {
            assert_eq!(hit.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn test_empty_set_never_calls_body() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let state = SetState::new(0, move |_| {
            seen.fetch_add(1, Ordering::Relaxed);
        });

        let prev = state.remaining.fetch_sub(1, Ordering::AcqRel);
        assert!(prev <= 0);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }
}
