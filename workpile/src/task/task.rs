use crate::context;
use crate::task::cell::{CellRef, Payload, TaskCell};
use crate::task::id::Id;
use crate::task::state::{AFFINITY_ANY, Priority, TaskState};
use std::fmt;

/// An owned handle to a task that has not been released to the scheduler
/// yet. While this handle exists the task is configurable: dependencies,
/// priority and affinity may still be set. `scheduled()` consumes the handle;
/// after that the task belongs to the scheduler and no configuration method
/// can be reached, which is what enforces the lifecycle statically.
///
/// A task is one deferred invocation of its body. The body may itself create
/// and schedule further tasks, unfolding a DAG on the fly, and may return a
/// task to be run immediately after it on the same worker.
pub struct Task {
    cell: CellRef,
}

impl Task {
    /// A task running `body` once. The optional task returned by the body is
    /// the continuation: the worker runs it next, bypassing every queue. Do
    /// not call `scheduled()` on a task you return — the worker performs that
    /// release itself.
    pub fn new(body: impl FnOnce() -> Option<Task> + Send + 'static) -> Task {
        Task::from_payload(None, Payload::Once(Some(Box::new(body))))
    }

    /// Same as [`Task::new`] with a debug name.
    pub fn with_name(
        name: &'static str,
        body: impl FnOnce() -> Option<Task> + Send + 'static,
    ) -> Task {
        Task::from_payload(Some(name), Payload::Once(Some(Box::new(body))))
    }

    pub(crate) fn from_payload(name: Option<&'static str>, payload: Payload) -> Task {
        let raw = TaskCell::allocate(name, payload);
        // Safety: allocate hands over the creator's reference.
        Task { cell: unsafe { CellRef::from_raw(raw) } }
    }

    /// Declare that this task must end before `other` may start: `other`
    /// gains one start dependency, resolved at this task's end-completion.
    ///
    /// A task has at most one start-successor; later calls are ignored.
    pub fn starts(&self, other: &Task) {
        debug_assert_eq!(other.cell.raw().state(), TaskState::New);
        if self.cell.raw().claim_start_successor(other.cell.raw()) {
            other.cell.raw().ref_inc();
            other.cell.raw().start_inc();
        }
    }

    /// Declare that this task must end before `other` may end: `other` gains
    /// one end dependency, resolved at this task's end-completion.
    ///
    /// A task has at most one end-successor; later calls are ignored.
    pub fn ends(&self, other: &Task) {
        debug_assert_eq!(other.cell.raw().state(), TaskState::New);
        if self.cell.raw().claim_end_successor(other.cell.raw()) {
            other.cell.raw().ref_inc();
            other.cell.raw().end_inc();
        }
    }

    /// [`Task::ends`] targeting the task currently running on this thread.
    /// This is how a task spawned from inside a body holds its parent open:
    /// the parent cannot end until this task has ended.
    ///
    /// # Panics
    ///
    /// Panics when called outside a running task body.
    pub fn ends_current(&self) {
        let current = context::current_task()
            .expect("ends_current called outside a running task");
        debug_assert_eq!(current.state(), TaskState::Running);
        if self.cell.raw().claim_end_successor(current) {
            current.ref_inc();
            current.end_inc();
        }
    }

    pub fn set_priority(&self, priority: Priority) {
        self.cell.raw().set_priority(priority);
    }

    pub fn priority(&self) -> Priority {
        self.cell.raw().priority()
    }

    /// Pin the task to a worker; only that worker will run it. Workers are
    /// indexed from 0 (the initiating thread) up to the configured count.
    pub fn set_affinity(&self, worker: u16) {
        self.cell.raw().set_affinity(worker);
    }

    /// The worker this task is pinned to, if any.
    pub fn affinity(&self) -> Option<u16> {
        let affinity = self.cell.raw().affinity();
        (affinity != AFFINITY_ANY).then_some(affinity)
    }

    /// Release the task to the scheduler: drop the start dependency held by
    /// the creator. When none remain, the task is pushed to the queue
    /// selected by its affinity and priority; otherwise the predecessor that
    /// resolves last will promote it.
    ///
    /// # Panics
    ///
    /// Panics when no runtime is active on this thread.
    pub fn scheduled(self) {
        let Task { cell } = self;
        if cell.raw().start_dec() == 0 {
            context::with_core(|core| core.handle.clone()).push(Ready::new(cell));
        }
        // A pending task stays alive through its predecessors' successor
        // slots; the creator's reference is released here.
    }

    /// Continuation hand-off: the worker performs the `scheduled` release and
    /// takes the task when it is ready to run right away.
    pub(crate) fn into_continuation(self) -> Option<Ready> {
        debug_assert_eq!(self.cell.raw().state(), TaskState::New);
        let Task { cell } = self;
        (cell.raw().start_dec() == 0).then(|| Ready::new(cell))
    }

    pub(crate) fn id(&self) -> Id {
        self.cell.raw().id()
    }

    #[cfg(test)]
    pub(crate) fn cell(&self) -> &CellRef {
        &self.cell
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cell.raw().name() {
            Some(name) => write!(f, "Task({}, id={})", name, self.id()),
            None => write!(f, "Task(id={})", self.id()),
        }
    }
}

/// A task whose start dependencies are all resolved, owned by a queue or a
/// worker until it runs.
pub(crate) struct Ready {
    cell: CellRef,
}

impl Ready {
    pub(crate) fn new(cell: CellRef) -> Ready {
        cell.raw().transition(TaskState::New, TaskState::Ready);
        Ready { cell }
    }

    pub(crate) fn into_cell(self) -> CellRef {
        self.cell
    }

    pub(crate) fn id(&self) -> Id {
        self.cell.raw().id()
    }

    pub(crate) fn priority(&self) -> Priority {
        self.cell.raw().priority()
    }

    pub(crate) fn affinity(&self) -> u16 {
        self.cell.raw().affinity()
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ready({:?})", self.cell.raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Task: Send, Sync);
    assert_impl_all!(Ready: Send, Sync);

    #[test]
    fn test_new_task_defaults() {
        let task = Task::with_name("defaults", || None);
        assert_eq!(task.priority(), Priority::Normal);
        assert_eq!(task.cell().raw().affinity(), AFFINITY_ANY);
        assert_eq!(task.cell().raw().state(), TaskState::New);
        assert_eq!(task.cell().raw().refs_count(), 1);
    }

    #[test]
    fn test_starts_adds_one_dependency() {
        let a = Task::new(|| None);
        let b = Task::new(|| None);

        a.starts(&b);
        assert_eq!(b.cell().raw().start_count(), 2);
        assert_eq!(b.cell().raw().refs_count(), 2);

        // Only one start-successor per task.
        let c = Task::new(|| None);
        a.starts(&c);
        assert_eq!(c.cell().raw().start_count(), 1);
        assert_eq!(c.cell().raw().refs_count(), 1);
    }

    #[test]
    fn test_ends_adds_one_dependency() {
        let a = Task::new(|| None);
        let b = Task::new(|| None);

        a.ends(&b);
        assert_eq!(b.cell().raw().end_count(), 2);

        let c = Task::new(|| None);
        a.ends(&c);
        assert_eq!(c.cell().raw().end_count(), 1);
    }

    #[test]
    fn test_configuration_sticks() {
        let task = Task::new(|| None);
        task.set_priority(Priority::Critical);
        task.set_affinity(3);
        assert_eq!(task.priority(), Priority::Critical);
        assert_eq!(task.cell().raw().affinity(), 3);
    }

    #[test]
    fn test_dropped_predecessor_releases_successor() {
        let a = Task::new(|| None);
        let b = Task::new(|| None);
        a.starts(&b);

        // Dropping `a` unschedules the edge; `b` keeps its inflated count
        // but loses the slot reference.
        drop(a);
        assert_eq!(b.cell().raw().refs_count(), 1);
        assert_eq!(b.cell().raw().start_count(), 2);
    }
}
