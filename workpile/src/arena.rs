//! Distributed fixed-size pool backing task cell storage.
//!
//! One size class (a task cell), very high churn, frequent cross-thread
//! free: a cell allocated on one worker is routinely released on another.
//! Each context-carrying thread keeps a local free list; misses claim the
//! entire global recycle stack in one swap, then carve a fresh chunk from
//! the system allocator. The pool is monotonic: chunks are never returned.

use crate::task::cell::TaskCell;
use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Chunks carved from the system allocator. Large enough that refills are
/// rare, small enough that an idle pool stays cheap.
const CHUNK_SIZE: usize = 16 * 1024;

/// A local free list longer than this flushes half of itself to the global
/// recycle stack so slots freed here can be reused by other workers.
const LOCAL_FREE_HIGH_WATERMARK: usize = 64;

/// Free slots are linked through their own storage.
struct FreeNode {
    next: *mut FreeNode,
}

pub(crate) struct Arena {
    /// Treiber stack of recycled slots. Push is a single CAS of a pre-linked
    /// chain; the consuming side takes the whole stack with one swap, which
    /// sidesteps ABA entirely.
    recycle: AtomicPtr<FreeNode>,

    /// Number of chunks claimed so far. Growth is monotonic.
    chunks: AtomicUsize,
}

/// Process-wide pool. No constructor logic runs before first use; lifecycle
/// sequencing is owned by the runtime.
pub(crate) static ARENA: Arena = Arena::new();

impl Arena {
    const fn new() -> Self {
        Self {
            recycle: AtomicPtr::new(ptr::null_mut()),
            chunks: AtomicUsize::new(0),
        }
    }

    /// Layout of one slot. A free slot must also be able to hold the
    /// intrusive link.
    fn slot_layout() -> Layout {
        let size = size_of::<TaskCell>().max(size_of::<FreeNode>());
        let align = align_of::<TaskCell>().max(align_of::<FreeNode>());
        Layout::from_size_align(size.next_multiple_of(align), align)
            .expect("slot layout is valid")
    }

    /// Pop a slot, refilling the local list from the global stack or a fresh
    /// chunk on miss. Never blocks; the only failure is system OOM, which is
    /// fatal.
    pub(crate) fn allocate(&self, local: &mut Vec<NonNull<u8>>) -> NonNull<u8> {
        if let Some(slot) = local.pop() {
            return slot;
        }

        if !self.refill_from_recycle(local) {
            self.grow(local);
        }

        local.pop().expect("refilled free list is never empty")
    }

    /// Push a slot on the local list, flushing half of it past the high
    /// watermark.
    pub(crate) fn free(&self, slot: NonNull<u8>, local: &mut Vec<NonNull<u8>>) {
        local.push(slot);

        if local.len() > LOCAL_FREE_HIGH_WATERMARK {
            let keep = local.len() / 2;
            self.flush(local.drain(keep..));
        }
    }

    /// Slow path for threads that carry no local free list (a task handle
    /// dropped after the runtime ended, or before one was built).
    pub(crate) fn allocate_global(&self) -> NonNull<u8> {
        let mut scratch = Vec::new();
        let slot = self.allocate(&mut scratch);
        self.flush(scratch.drain(..));
        slot
    }

    /// Counterpart of [`Arena::allocate_global`].
    pub(crate) fn free_global(&self, slot: NonNull<u8>) {
        self.flush(std::iter::once(slot));
    }

    /// Link the given slots into a chain and publish it onto the recycle
    /// stack with a single CAS.
    pub(crate) fn flush(&self, slots: impl Iterator<Item = NonNull<u8>>) {
        let mut head: *mut FreeNode = ptr::null_mut();
        let mut tail: *mut FreeNode = ptr::null_mut();

        for slot in slots {
            let node = slot.cast::<FreeNode>().as_ptr();
            // Safety: the slot is unused and sized to hold a FreeNode.
            unsafe { (*node).next = head };
            if tail.is_null() {
                tail = node;
            }
            head = node;
        }

        if head.is_null() {
            return;
        }

        let mut current = self.recycle.load(Ordering::Acquire);
        loop {
            // Safety: tail is ours until the CAS below succeeds.
            unsafe { (*tail).next = current };

            match self.recycle.compare_exchange_weak(
                current,
                head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Take the entire recycle stack with one swap and spill it into the
    /// local list. Returns false when the stack was empty.
    fn refill_from_recycle(&self, local: &mut Vec<NonNull<u8>>) -> bool {
        let mut node = self.recycle.swap(ptr::null_mut(), Ordering::AcqRel);
        if node.is_null() {
            return false;
        }

        while !node.is_null() {
            // Safety: we own the whole chain after the swap.
            let next = unsafe { (*node).next };
            local.push(NonNull::new(node.cast()).expect("free list nodes are non-null"));
            node = next;
        }

        true
    }

    /// Carve a fresh chunk into the local list.
    fn grow(&self, local: &mut Vec<NonNull<u8>>) {
        let slot = Self::slot_layout();
        let layout = Layout::from_size_align(CHUNK_SIZE, slot.align())
            .expect("chunk layout is valid");

        // Safety: layout has non-zero size.
        let chunk = unsafe { alloc::alloc(layout) };
        let Some(chunk) = NonNull::new(chunk) else {
            alloc::handle_alloc_error(layout);
        };

        self.chunks.fetch_add(1, Ordering::Relaxed);

        let per_chunk = CHUNK_SIZE / slot.size();
        debug_assert!(per_chunk > 0, "task cell larger than a chunk");
        for i in 0..per_chunk {
            // Safety: i * slot.size() stays inside the chunk allocation.
            local.push(unsafe { chunk.add(i * slot.size()) });
        }
    }

    #[cfg(test)]
    pub(crate) fn num_chunks(&self) -> usize {
        self.chunks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_fits_cell_and_link() {
        let layout = Arena::slot_layout();
        assert!(layout.size() >= size_of::<TaskCell>());
        assert!(layout.size() >= size_of::<FreeNode>());
        assert_eq!(layout.size() % layout.align(), 0);
    }

    #[test]
    fn test_local_reuse_is_lifo() {
        let arena = Arena::new();
        let mut local = Vec::new();

        let slot = arena.allocate(&mut local);
        arena.free(slot, &mut local);
        assert_eq!(arena.allocate(&mut local), slot);
    }

    #[test]
    fn test_watermark_flush_and_take_all_refill() {
        let arena = Arena::new();
        let mut local = Vec::new();

        let slots = (0..=LOCAL_FREE_HIGH_WATERMARK)
            .map(|_| arena.allocate(&mut local))
            .collect::<Vec<_>>();

        // Discard the carve leftovers so the local list holds only what the
        // frees below put there.
        arena.flush(local.drain(..));

        for slot in slots {
            arena.free(slot, &mut local);
        }

        // The last free tripped the watermark: half went global.
        assert_eq!(local.len(), (LOCAL_FREE_HIGH_WATERMARK + 1) / 2);

        // A fresh thread-local list drains the global stack before growing.
        let chunks_before = arena.num_chunks();
        let mut other = Vec::new();
        let _ = arena.allocate(&mut other);
        assert_eq!(arena.num_chunks(), chunks_before);
        assert!(!other.is_empty());
    }

    #[test]
    fn test_grow_claims_new_chunk_only_when_empty() {
        let arena = Arena::new();
        let mut local = Vec::new();

        let _ = arena.allocate(&mut local);
        assert_eq!(arena.num_chunks(), 1);

        // Everything after the first allocation is served from the carve.
        let per_chunk = CHUNK_SIZE / Arena::slot_layout().size();
        for _ in 1..per_chunk {
            let _ = arena.allocate(&mut local);
        }
        assert_eq!(arena.num_chunks(), 1);

        let _ = arena.allocate(&mut local);
        assert_eq!(arena.num_chunks(), 2);
    }

    #[test]
    fn test_global_fallback_round_trip() {
        let arena = Arena::new();

        let slot = arena.allocate_global();
        arena.free_global(slot);

        let mut local = Vec::new();
        let again = arena.allocate(&mut local);
        // The freed slot is on the global stack; take-all must find it.
        let mut found = again == slot;
        while !found {
            if local.is_empty() {
                break;
            }
            found = arena.allocate(&mut local) == slot;
        }
        assert!(found);
    }

    #[test]
    fn test_cross_thread_churn() {
        use std::sync::Arc;

        let arena = Arc::new(Arena::new());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let arena = Arc::clone(&arena);
            handles.push(std::thread::spawn(move || {
                let mut local = Vec::new();
                for _ in 0..1_000 {
                    let a = arena.allocate(&mut local);
                    let b = arena.allocate(&mut local);
                    arena.free(a, &mut local);
                    arena.free_global(b);
                }
                arena.flush(local.drain(..));
            }));
        }

        for handle in handles {
            handle.join().expect("arena churn thread panicked");
        }

        // 8 live slots at a time across 4 threads fits in very few chunks.
        assert!(arena.num_chunks() <= 8);
    }
}
