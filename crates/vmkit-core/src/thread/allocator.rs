//! Thread & stack allocator (spec.md 4.B).
//!
//! A singleton reserves a contiguous virtual region of
//! `n_slots * stack_size` bytes at process startup, aligned so the
//! thread-id mask isolates each slot. A free-bitmap guarded by a spin lock
//! tracks occupancy. Each slot carries a guard page just above its
//! alternate signal stack, so a stack-overflowing store traps before it
//! can corrupt the next slot.

use crate::sync::spin::SpinLock;
use crate::sys::{self, DEFAULT_STACK_SIZE, DEFAULT_THREAD_SLOTS};
use crate::thread::record::ThreadRecord;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of the alternate signal stack installed in every slot (spec.md 6:
/// "Alternate stack is the second page of each thread's reserved region").
const ALT_STACK_SIZE: usize = 64 * 1024;

/// Layout of one slot, lowest address first:
///
/// ```text
/// +------------------+  <- slot base (== thread_id_mask(sp))
/// | ThreadRecord      |
/// +------------------+
/// | alternate signal  |
/// | stack             |
/// +------------------+
/// | guard page (PROT_NONE)
/// +------------------+
/// | usable mutator    |
/// | stack (grows down)|
/// +------------------+  <- base_sp (slot base + stack_size)
/// ```
struct SlotLayout {
    stack_size: usize,
    guard_page_offset: usize,
    guard_page_len: usize,
    alt_stack_offset: usize,
    alt_stack_len: usize,
    usable_stack_offset: usize,
}

impl SlotLayout {
    fn new(stack_size: usize) -> Self {
        let record_len = sys::align_up(std::mem::size_of::<ThreadRecord>(), 16);
        let alt_stack_offset = record_len;
        let guard_page_offset = alt_stack_offset + ALT_STACK_SIZE;
        let guard_page_len = sys::page_size();
        let usable_stack_offset = guard_page_offset + guard_page_len;
        assert!(
            usable_stack_offset < stack_size,
            "stack_size too small to hold the thread record, alt stack, and guard page"
        );
        SlotLayout {
            stack_size,
            guard_page_offset,
            guard_page_len,
            alt_stack_offset,
            alt_stack_len: ALT_STACK_SIZE,
            usable_stack_offset,
        }
    }
}

/// A fixed-size free-list bitmap over the slots of a [`StackRegion`].
struct FreeBitmap {
    words: Vec<u64>,
    n_slots: usize,
}

impl FreeBitmap {
    fn new(n_slots: usize) -> Self {
        FreeBitmap {
            words: vec![u64::MAX; n_slots.div_ceil(64)],
            n_slots,
        }
    }

    /// Finds and claims the first free slot, returning its index.
    fn alloc(&mut self) -> Option<usize> {
        for (word_idx, word) in self.words.iter_mut().enumerate() {
            if *word == 0 {
                continue;
            }
            let bit = word.trailing_zeros() as usize;
            let idx = word_idx * 64 + bit;
            if idx >= self.n_slots {
                return None;
            }
            *word &= !(1u64 << bit);
            return Some(idx);
        }
        None
    }

    fn free(&mut self, idx: usize) {
        let word_idx = idx / 64;
        let bit = idx % 64;
        debug_assert_eq!(self.words[word_idx] & (1u64 << bit), 0, "double free of thread slot");
        self.words[word_idx] |= 1u64 << bit;
    }
}

/// The process-wide reserved virtual region thread stacks are carved from.
pub struct StackRegion {
    base: usize,
    layout: SlotLayout,
    n_slots: usize,
    free: SpinLock<FreeBitmap>,
    live_count: AtomicUsize,
}

/// Error allocating a thread slot. Exhaustion is the one case spec.md 4.B
/// calls out explicitly ("Failing to find a slot is a fatal error") — a
/// caller that wants to treat exhaustion as recoverable can still match on
/// this before deciding whether to escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StackAllocError {
    /// Every slot in the region is in use.
    #[error("thread slot region exhausted ({0} slots in use)")]
    Exhausted(usize),
}

impl StackRegion {
    /// Reserves a new region with `n_slots` slots of `stack_size` bytes
    /// each. `stack_size` must be a power of two.
    pub fn reserve(n_slots: usize, stack_size: usize) -> Self {
        assert!(stack_size.is_power_of_two(), "stack_size must be a power of two");
        let layout = SlotLayout::new(stack_size);
        let total = n_slots
            .checked_mul(stack_size)
            .expect("thread region size overflow");

        #[cfg(unix)]
        let base = unsafe {
            // Over-allocate by one slot so we can align the usable region up
            // to a stack_size boundary, then trim the overhang.
            let raw_len = total + stack_size;
            let raw = libc::mmap(
                std::ptr::null_mut(),
                raw_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if raw == libc::MAP_FAILED {
                crate::fatal!("mmap of thread-stack region failed");
            }
            let raw_addr = raw as usize;
            let aligned = sys::align_up(raw_addr, stack_size);
            let head_slack = aligned - raw_addr;
            let tail_slack = raw_len - head_slack - total;
            if head_slack > 0 {
                libc::munmap(raw, head_slack);
            }
            if tail_slack > 0 {
                libc::munmap((aligned + total) as *mut libc::c_void, tail_slack);
            }
            aligned
        };

        #[cfg(not(unix))]
        let base = {
            let _ = total;
            crate::fatal!("vmkit-core's thread/stack allocator requires a unix target");
        };

        StackRegion {
            base,
            layout,
            n_slots,
            free: SpinLock::new(FreeBitmap::new(n_slots)),
            live_count: AtomicUsize::new(0),
        }
    }

    /// Reserves a region sized with this crate's defaults.
    pub fn reserve_default() -> Self {
        Self::reserve(DEFAULT_THREAD_SLOTS, DEFAULT_STACK_SIZE)
    }

    /// The mask satisfying `(slot_base & mask) == slot_base` and
    /// `(sp & mask) == slot_base` for every `sp` within that slot.
    pub fn thread_id_mask(&self) -> usize {
        sys::thread_id_mask(self.layout.stack_size)
    }

    fn slot_base(&self, idx: usize) -> usize {
        self.base + idx * self.layout.stack_size
    }

    /// Allocates a slot: picks the first free index, zeroes its
    /// `ThreadRecord`, installs the guard page, and returns a pointer to
    /// the (uninitialized-beyond-zero) record along with the slot's
    /// `base_sp` (top of its usable stack).
    pub fn alloc_slot(&self) -> Result<(*mut ThreadRecord, usize, usize), StackAllocError> {
        let idx = {
            let mut free = self.free.lock();
            free.alloc()
        };
        let idx = idx.ok_or_else(|| StackAllocError::Exhausted(self.n_slots))?;
        let slot_base = self.slot_base(idx);

        #[cfg(unix)]
        unsafe {
            let usable_len = self.layout.stack_size - self.layout.usable_stack_offset;
            let record_region_len = self.layout.guard_page_offset; // record + alt stack
            // Make the record + alt-stack region read/write.
            if libc::mprotect(
                slot_base as *mut libc::c_void,
                record_region_len,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                crate::fatal!("mprotect(record+altstack) failed for thread slot {idx}");
            }
            // Guard page stays PROT_NONE (already the case from reservation).
            // Usable stack is read/write.
            if libc::mprotect(
                (slot_base + self.layout.usable_stack_offset) as *mut libc::c_void,
                usable_len,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                crate::fatal!("mprotect(usable stack) failed for thread slot {idx}");
            }
            std::ptr::write_bytes(slot_base as *mut u8, 0, record_region_len);
        }

        self.live_count.fetch_add(1, Ordering::AcqRel);
        let base_sp = slot_base + self.layout.stack_size;
        Ok((slot_base as *mut ThreadRecord, base_sp, idx))
    }

    /// Releases a slot back to the free-bitmap. The caller must have
    /// already joined the underlying OS thread (spec.md 4.B: "On release:
    /// wait for the OS thread to terminate (join), clear the bit").
    pub fn free_slot(&self, idx: usize) {
        let mut free = self.free.lock();
        free.free(idx);
        self.live_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Address of the alternate signal stack for the slot at `slot_base`.
    pub fn alt_stack_for(&self, slot_base: usize) -> (*mut libc::c_void, usize) {
        (
            (slot_base + self.layout.alt_stack_offset) as *mut libc::c_void,
            self.layout.alt_stack_len,
        )
    }

    /// Address range `[start, end)` of the guard page for the slot at
    /// `slot_base`, used by the signal bridge to classify a fault address
    /// as a stack overflow (spec.md 4.G).
    pub fn guard_page_range(&self, slot_base: usize) -> (usize, usize) {
        let start = slot_base + self.layout.guard_page_offset;
        (start, start + self.layout.guard_page_len)
    }

    /// Number of slots currently in use.
    pub fn live_count(&self) -> usize {
        self.live_count.load(Ordering::Acquire)
    }

    /// Total slot capacity of this region.
    pub fn capacity(&self) -> usize {
        self.n_slots
    }

    /// True if `addr` falls within this region's reserved address range,
    /// i.e. belongs to some thread slot (whether currently allocated or
    /// not). Used to tell a thread spawned through [`crate::thread::spawn`]
    /// (whose stack lives inside a slot, so `current_thread()`'s
    /// `sp & thread_id_mask` trick is sound) apart from an arbitrary OS
    /// thread this crate does not manage.
    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.n_slots * self.layout.stack_size
    }
}

// SAFETY: the region is a plain reserved memory range; all mutation goes
// through the spin-locked bitmap or atomics inside `ThreadRecord`.
unsafe impl Send for StackRegion {}
unsafe impl Sync for StackRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_base_satisfies_thread_id_mask_invariant() {
        let region = StackRegion::reserve(8, 1 << 20);
        let mask = region.thread_id_mask();
        let (ptr, base_sp, idx) = region.alloc_slot().unwrap();
        let slot_base = ptr as usize;
        assert_eq!(slot_base & mask, slot_base);
        assert_eq!(base_sp & mask, slot_base);
        region.free_slot(idx);
    }

    #[test]
    fn alloc_and_free_round_trip_through_every_slot() {
        let region = StackRegion::reserve(4, 1 << 20);
        let mut slots = Vec::new();
        for _ in 0..4 {
            slots.push(region.alloc_slot().unwrap());
        }
        assert!(region.alloc_slot().is_err());
        assert_eq!(region.live_count(), 4);

        for (_, _, idx) in slots {
            region.free_slot(idx);
        }
        assert_eq!(region.live_count(), 0);
        assert!(region.alloc_slot().is_ok());
    }

    #[test]
    fn distinct_slots_do_not_overlap() {
        let region = StackRegion::reserve(4, 1 << 20);
        let mut bases = Vec::new();
        for _ in 0..4 {
            let (ptr, _, _) = region.alloc_slot().unwrap();
            bases.push(ptr as usize);
        }
        bases.sort_unstable();
        for pair in bases.windows(2) {
            assert!(pair[1] - pair[0] >= 1 << 20);
        }
    }
}
