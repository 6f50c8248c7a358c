use crate::runtime::parking::Parker;
use crate::task::{NUM_PRIORITIES, Priority, Ready};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Shared per-worker record: the parts of a worker other threads may touch.
/// The deques' owner sides live in the worker's thread-local core; what is
/// published here are the pinned-task FIFOs and the parker.
pub(crate) struct Remote {
    /// Strict FIFOs for tasks pinned to this worker, one per priority. Any
    /// thread pushes; only the owner pops. Pinned tasks are never stolen.
    affinity: [Mutex<VecDeque<Ready>>; NUM_PRIORITIES],

    pub(crate) parker: Parker,
}

impl Remote {
    pub(crate) fn new() -> Self {
        Self {
            affinity: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
            parker: Parker::new(),
        }
    }

    /// Queue a task pinned to this worker and wake it.
    pub(crate) fn push_pinned(&self, ready: Ready) {
        self.affinity[ready.priority().index()].lock().push_back(ready);
        self.parker.unpark();
    }

    /// Highest-priority pinned task, if any. Owner only.
    pub(crate) fn pop_pinned(&self) -> Option<Ready> {
        Priority::ALL
            .iter()
            .find_map(|priority| self.affinity[priority.index()].lock().pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn ready(priority: Priority) -> Ready {
        let task = Task::new(|| None);
        task.set_priority(priority);
        task.set_affinity(0);
        task.into_continuation().expect("no extra start dependencies")
    }

    #[test]
    fn test_pinned_is_fifo_within_priority() {
        let remote = Remote::new();
        let (a, b) = (ready(Priority::Normal), ready(Priority::Normal));
        let (a_id, b_id) = (a.id(), b.id());

        remote.push_pinned(a);
        remote.push_pinned(b);

        assert_eq!(remote.pop_pinned().map(|r| r.id()), Some(a_id));
        assert_eq!(remote.pop_pinned().map(|r| r.id()), Some(b_id));
        assert!(remote.pop_pinned().is_none());
    }

    #[test]
    fn test_pinned_priority_multiplexing() {
        let remote = Remote::new();
        let low = ready(Priority::Low);
        let critical = ready(Priority::Critical);
        let (low_id, critical_id) = (low.id(), critical.id());

        remote.push_pinned(low);
        remote.push_pinned(critical);

        assert_eq!(remote.pop_pinned().map(|r| r.id()), Some(critical_id));
        assert_eq!(remote.pop_pinned().map(|r| r.id()), Some(low_id));
    }
}
