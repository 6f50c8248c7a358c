use crate::context;
use crate::task::Task;
use crate::task::id::Id;
use crate::task::set::SetState;
use crate::task::state::{AFFINITY_ANY, Priority, TaskState};
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU16, AtomicU32, Ordering, fence};

pub(crate) type BodyFn = Box<dyn FnOnce() -> Option<Task> + Send + 'static>;

/// What runs when the task is picked up.
pub(crate) enum Payload {
    /// A plain body, invoked exactly once.
    Once(Option<BodyFn>),
    /// A claim-and-run loop over a shared index counter.
    Set(Arc<SetState>),
}

/// Arena-allocated task storage, shared between the scheduler and any task
/// naming it as a successor.
///
/// Mutability rules: the counters and the reference count are atomic for the
/// whole lifetime; priority and affinity are written only while NEW;
/// successor slots are claimed while NEW (or RUNNING, for the end slot) and
/// taken exactly once at end-completion; the payload is touched only by the
/// worker that owns the READY -> RUNNING transition.
pub(crate) struct TaskCell {
    /// Shared-ownership count. Starts at 1 for the creator's handle, which
    /// becomes the queue entry once the task is ready; each predecessor
    /// holding this cell in a successor slot adds one.
    refs: AtomicU32,

    /// Must be zero before the task can start. The initial 1 is released by
    /// `scheduled()`.
    to_start: AtomicU32,

    /// Must be zero before the task can end. The initial 1 is released by
    /// the worker once the body has returned.
    to_end: AtomicU32,

    priority: AtomicU8,
    affinity: AtomicU16,

    /// Lifecycle witness; transitions are asserted in debug builds.
    state: AtomicU8,

    /// Triggered when this task ends: its start count is decremented.
    to_be_started: AtomicPtr<TaskCell>,

    /// Signaled when this task ends: its end count is decremented.
    to_be_ended: AtomicPtr<TaskCell>,

    payload: UnsafeCell<Payload>,

    id: Id,
    name: Option<&'static str>,
}

impl TaskCell {
    /// Carve a cell out of the arena. The returned pointer carries the
    /// creator's reference.
    pub(crate) fn allocate(name: Option<&'static str>, payload: Payload) -> RawCell {
        let slot = context::arena_allocate().cast::<TaskCell>();

        let cell = TaskCell {
            refs: AtomicU32::new(1),
            to_start: AtomicU32::new(1),
            to_end: AtomicU32::new(1),
            priority: AtomicU8::new(Priority::Normal as u8),
            affinity: AtomicU16::new(AFFINITY_ANY),
            state: AtomicU8::new(TaskState::New as u8),
            to_be_started: AtomicPtr::new(ptr::null_mut()),
            to_be_ended: AtomicPtr::new(ptr::null_mut()),
            payload: UnsafeCell::new(payload),
            id: Id::next(),
            name,
        };

        // Safety: the arena hands out slots sized and aligned for TaskCell.
        unsafe { slot.as_ptr().write(cell) };

        RawCell(slot)
    }
}

impl Drop for TaskCell {
    fn drop(&mut self) {
        // Release successor references still parked in the slots (the task
        // never completed, or its successors were never promoted).
        for slot in [self.to_be_started.get_mut(), self.to_be_ended.get_mut()] {
            if let Some(target) = NonNull::new(*slot) {
                // Safety: the slot owned one reference to the target.
                drop(unsafe { CellRef::from_raw(RawCell(target)) });
            }
        }
    }
}

/// Unowned pointer to a cell. Copyable; reference accounting is explicit.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawCell(NonNull<TaskCell>);

impl RawCell {
    fn cell(&self) -> &TaskCell {
        // Safety: callers hold or borrow a live reference.
        unsafe { self.0.as_ref() }
    }

    fn as_ptr(&self) -> *mut TaskCell {
        self.0.as_ptr()
    }

    pub(crate) fn id(&self) -> Id {
        self.cell().id
    }

    pub(crate) fn name(&self) -> Option<&'static str> {
        self.cell().name
    }

    pub(crate) fn priority(&self) -> Priority {
        Priority::from_u8(self.cell().priority.load(Ordering::Relaxed))
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        debug_assert_eq!(self.state(), TaskState::New, "priority is fixed once scheduled");
        self.cell().priority.store(priority as u8, Ordering::Relaxed);
    }

    pub(crate) fn affinity(&self) -> u16 {
        self.cell().affinity.load(Ordering::Relaxed)
    }

    pub(crate) fn set_affinity(&self, worker: u16) {
        debug_assert_eq!(self.state(), TaskState::New, "affinity is fixed once scheduled");
        self.cell().affinity.store(worker, Ordering::Relaxed);
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.cell().state.load(Ordering::Acquire))
    }

    pub(crate) fn transition(&self, from: TaskState, to: TaskState) {
        let prev = self.cell().state.swap(to as u8, Ordering::AcqRel);
        debug_assert_eq!(
            TaskState::from_u8(prev),
            from,
            "invalid state transition for task {}",
            self.id(),
        );
    }

    pub(crate) fn ref_inc(&self) {
        self.cell().refs.fetch_add(1, Ordering::Relaxed);
    }

    /// True when this released the final reference.
    fn ref_dec(&self) -> bool {
        if self.cell().refs.fetch_sub(1, Ordering::Release) != 1 {
            return false;
        }
        fence(Ordering::Acquire);
        true
    }

    pub(crate) fn start_inc(&self) {
        self.cell().to_start.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the remaining start count.
    pub(crate) fn start_dec(&self) -> u32 {
        let prev = self.cell().to_start.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "start count underflow on task {}", self.id());
        prev - 1
    }

    pub(crate) fn end_inc(&self) {
        self.cell().to_end.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the remaining end count.
    pub(crate) fn end_dec(&self) -> u32 {
        let prev = self.cell().to_end.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "end count underflow on task {}", self.id());
        prev - 1
    }

    /// Install `other` as the start-successor. False when a successor is
    /// already installed; the caller must then ignore the request without
    /// touching any counter.
    pub(crate) fn claim_start_successor(&self, other: RawCell) -> bool {
        self.cell()
            .to_be_started
            .compare_exchange(ptr::null_mut(), other.as_ptr(), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn claim_end_successor(&self, other: RawCell) -> bool {
        self.cell()
            .to_be_ended
            .compare_exchange(ptr::null_mut(), other.as_ptr(), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn take_start_successor(&self) -> Option<CellRef> {
        let ptr = self.cell().to_be_started.swap(ptr::null_mut(), Ordering::Acquire);
        // Safety: the slot owned one reference to the target.
        NonNull::new(ptr).map(|target| unsafe { CellRef::from_raw(RawCell(target)) })
    }

    pub(crate) fn take_end_successor(&self) -> Option<CellRef> {
        let ptr = self.cell().to_be_ended.swap(ptr::null_mut(), Ordering::Acquire);
        // Safety: as above.
        NonNull::new(ptr).map(|target| unsafe { CellRef::from_raw(RawCell(target)) })
    }

    /// Run the payload, handing back the optional continuation.
    ///
    /// # Safety
    ///
    /// Only the worker that owns the READY -> RUNNING transition may call
    /// this, exactly once.
    pub(crate) unsafe fn invoke(&self) -> Option<Task> {
        // Safety: exclusive access per the contract above.
        match unsafe { &mut *self.cell().payload.get() } {
            Payload::Once(body) => {
                let body = body.take().expect("task body already consumed");
                body()
            }
            Payload::Set(state) => crate::task::set::run_set(state),
        }
    }

    #[cfg(test)]
    pub(crate) fn refs_count(&self) -> u32 {
        self.cell().refs.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn start_count(&self) -> u32 {
        self.cell().to_start.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn end_count(&self) -> u32 {
        self.cell().to_end.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for RawCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskCell({:p}, id={})", self.as_ptr(), self.id())
    }
}

/// An owned reference to a cell, tracked by the reference count. The final
/// drop destroys the cell in place and returns its slot to the arena.
pub(crate) struct CellRef {
    raw: RawCell,
}

impl CellRef {
    /// # Safety
    ///
    /// Takes ownership of one counted reference to the cell.
    pub(crate) unsafe fn from_raw(raw: RawCell) -> CellRef {
        CellRef { raw }
    }

    pub(crate) fn raw(&self) -> RawCell {
        self.raw
    }

    pub(crate) fn clone_ref(&self) -> CellRef {
        self.raw.ref_inc();
        CellRef { raw: self.raw }
    }
}

impl Drop for CellRef {
    fn drop(&mut self) {
        if self.raw.ref_dec() {
            let ptr = self.raw.0;
            // Safety: final reference; nobody else can observe the cell.
            unsafe { ptr::drop_in_place(ptr.as_ptr()) };
            context::arena_free(ptr.cast());
        }
    }
}

// Safety: every shared field of TaskCell is atomic or guarded by the state
// protocol documented on the struct; payloads are Send.
unsafe impl Send for CellRef {}
unsafe impl Sync for CellRef {}

impl fmt::Debug for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellRef({:?})", self.raw)
    }
}
