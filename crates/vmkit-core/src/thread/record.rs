//! The fixed-size per-thread record (spec.md 3, "Thread record").
//!
//! An instance of [`ThreadRecord`] sits at the base (lowest address) of
//! every reserved stack slot, so that `sp & thread_id_mask` always lands on
//! one. Nothing here touches OS TLS.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

/// A stack marker bridging a region of native code that has no registered
/// frame info (spec.md 3, "Known frame"). Must be stack-allocated by the
/// caller and nest like the stack: pushed on entry to a bridging call,
/// popped on return.
#[derive(Debug)]
pub struct KnownFrame {
    /// Previous head of the known-frame list (for popping).
    pub previous: *mut KnownFrame,
    /// Frame pointer this marker bridges to.
    pub current_fp: usize,
    /// Return address at `current_fp`, or 0 if this is a pure bridging
    /// marker with no associated IP (an "unknown frame" push records the
    /// real caller IP instead; see ctthread.cpp's `startUnknownFrame`).
    pub current_ip: usize,
}

impl KnownFrame {
    /// An empty marker, to be filled in by [`crate::thread::Thread::start_known_frame`].
    pub const fn empty() -> Self {
        KnownFrame {
            previous: std::ptr::null_mut(),
            current_fp: 0,
            current_ip: 0,
        }
    }
}

/// One node in the per-thread exception-unwind chain (spec.md 3,
/// "last_exception_buffer"; supplemented from `ExceptionBuffer` in
/// `ctthread.cpp`). Each node records the handler to jump to and the
/// isolate that installed it, so unwinding can refuse to cross an isolate
/// boundary it does not own.
#[derive(Debug)]
pub struct ExceptionBuffer {
    /// Previous head of the chain (restored on pop).
    pub previous: *mut ExceptionBuffer,
    /// Return address of the handler this buffer protects.
    pub handler_ip: usize,
    /// Isolate/tenant id that installed this handler.
    pub handler_isolate_id: u64,
}

/// Per-thread bump-pointer allocation buffer state (GC-plan-opaque; the
/// plan owns the actual bytes, this just remembers where the thread's
/// current chunk is so `mutator_allocate` has a fast path without going
/// through the plan on every allocation). Matches spec.md 3's "per-thread
/// allocator state".
#[derive(Debug, Default)]
pub struct Tlab {
    /// Next free byte in the current chunk.
    pub cursor: AtomicUsize,
    /// One past the last usable byte of the current chunk.
    pub limit: AtomicUsize,
}

/// Coarse lifecycle state of a thread record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    /// An ordinary mutator thread running managed code.
    Mutator,
    /// The finalizer service thread (spec.md 4.H).
    Finalizer,
    /// The reference-enqueue service thread (spec.md 4.H).
    ReferenceEnqueue,
}

/// The fixed-size thread record (spec.md 3).
///
/// Lives at the base of a [`crate::thread::allocator::StackRegion`] slot.
/// Every field that the collector or the signal handler may touch from a
/// different thread (or from a signal handler running on this thread) is
/// represented with an atomic or a raw pointer guarded by the rendezvous
/// protocol — never behind a `Mutex`, since a mutex is not signal-safe.
#[repr(C)]
pub struct ThreadRecord {
    /// Index of this slot within the reserved region; doubles as a stable
    /// thread identity.
    pub id: usize,

    /// Role this thread plays (mutator vs. service thread).
    pub role: ThreadRole,

    /// Raw OS thread handle (`pthread_t` on unix), filled in once the
    /// thread is actually running.
    pub os_handle: AtomicU64,

    /// Stack pointer captured when the thread started. The stack walker's
    /// stopping condition is `current_fp == base_sp`.
    pub base_sp: AtomicUsize,

    /// Nonzero when this thread has parked in uncooperative code at a known
    /// stack pointer (spec.md 3: "a conservative safepoint"). Zero means
    /// the thread is cooperative and must be walked only while it has
    /// joined a rendezvous via a safepoint poll.
    pub last_sp: AtomicUsize,

    /// Set by the rendezvous initiator; observed by this thread's next
    /// safepoint poll.
    pub do_yield: AtomicBool,

    /// Set once this thread has acknowledged the in-progress rendezvous.
    pub joined_rv: AtomicBool,

    /// Re-entrancy guard: true while this thread is inside rendezvous
    /// handling. A SIGSEGV arriving while `in_rv` is already true is a
    /// double fault and aborts rather than recursing.
    pub in_rv: AtomicBool,

    /// Head of the known-frame bridge list.
    pub last_known_frame: AtomicPtr<KnownFrame>,

    /// Head of the exception-unwind chain.
    pub last_exception_buffer: AtomicPtr<ExceptionBuffer>,

    /// Isolate/tenant id this thread is currently running under.
    pub isolate_id: AtomicI64,

    /// True from thread-start until the thread has been joined and its
    /// slot released.
    pub alive: AtomicBool,

    /// Per-thread bump allocator state.
    pub tlab: Tlab,
}

impl ThreadRecord {
    /// Resets a freshly allocated (zeroed) slot into a valid, unattached
    /// thread record. Called by the allocator immediately after carving out
    /// a slot and before handing it to the owning OS thread.
    ///
    /// # Safety
    /// `this` must point at a zeroed, exclusively-owned `ThreadRecord`-sized
    /// region within a reserved [`crate::thread::allocator::StackRegion`] slot.
    pub unsafe fn init(this: *mut ThreadRecord, id: usize, role: ThreadRole) {
        this.write(ThreadRecord {
            id,
            role,
            os_handle: AtomicU64::new(0),
            base_sp: AtomicUsize::new(0),
            last_sp: AtomicUsize::new(0),
            do_yield: AtomicBool::new(false),
            joined_rv: AtomicBool::new(false),
            in_rv: AtomicBool::new(false),
            last_known_frame: AtomicPtr::new(std::ptr::null_mut()),
            last_exception_buffer: AtomicPtr::new(std::ptr::null_mut()),
            isolate_id: AtomicI64::new(-1),
            alive: AtomicBool::new(true),
            tlab: Tlab::default(),
        });
    }

    /// Reads `last_sp` (spec.md 8: `publish_last_sp(sp); read_last_sp() == sp`
    /// until `clear_last_sp()`).
    #[inline]
    pub fn last_sp(&self) -> usize {
        self.last_sp.load(Ordering::Acquire)
    }

    /// Publishes `last_sp`. Uses `SeqCst` so the store and the immediately
    /// following read of `do_yield` (in `join_before_uncooperative`) act as
    /// a full barrier — spec.md 4.F's ordering guarantee requires the two
    /// to be mutually visible, which a plain Release store does not give
    /// against an Acquire load on a *different* location.
    #[inline]
    pub fn publish_last_sp(&self, sp: usize) {
        self.last_sp.store(sp, Ordering::SeqCst);
    }

    /// Clears `last_sp`, returning to cooperative mode.
    #[inline]
    pub fn clear_last_sp(&self) {
        self.last_sp.store(0, Ordering::Release);
    }

    /// True while this thread is parked in uncooperative code.
    #[inline]
    pub fn is_uncooperative(&self) -> bool {
        self.last_sp() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    fn fresh_record(id: usize) -> Box<MaybeUninit<ThreadRecord>> {
        let mut slot: Box<MaybeUninit<ThreadRecord>> = Box::new(MaybeUninit::zeroed());
        unsafe { ThreadRecord::init(slot.as_mut_ptr(), id, ThreadRole::Mutator) };
        slot
    }

    #[test]
    fn fresh_record_is_cooperative_and_has_no_pending_rendezvous() {
        let slot = fresh_record(3);
        let rec = unsafe { &*slot.as_ptr() };
        assert_eq!(rec.id, 3);
        assert_eq!(rec.last_sp(), 0);
        assert!(!rec.is_uncooperative());
        assert!(!rec.do_yield.load(Ordering::Relaxed));
        assert!(!rec.joined_rv.load(Ordering::Relaxed));
        assert!(!rec.in_rv.load(Ordering::Relaxed));
        assert!(rec.alive.load(Ordering::Relaxed));
    }

    #[test]
    fn publish_and_clear_last_sp_round_trips() {
        let slot = fresh_record(0);
        let rec = unsafe { &*slot.as_ptr() };
        rec.publish_last_sp(0x1000);
        assert_eq!(rec.last_sp(), 0x1000);
        assert!(rec.is_uncooperative());
        rec.clear_last_sp();
        assert_eq!(rec.last_sp(), 0);
        assert!(!rec.is_uncooperative());
    }
}
