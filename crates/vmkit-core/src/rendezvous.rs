//! Collection rendezvous (spec.md 4.F).
//!
//! A stop-the-world protocol between a single initiator (the thread driving
//! a collection) and every other live mutator. Cooperative threads join by
//! polling a safepoint; uncooperative threads (already parked with a
//! published `last_sp`) are scooped up directly by the initiator. Translated
//! from `lib/vmkit/CommonThread/CollectionRV.cpp` — the CAS-as-barrier
//! comments in that file ("The CAS is not necessary but it does a memory
//! barrier") are preserved as `SeqCst` orderings here rather than literal
//! compare-and-swaps, since Rust's `SeqCst` gives the same total-order
//! guarantee without a pointless read-modify-write.
//!
//! No timeouts, no cancellation: a mutator that never reaches a safepoint or
//! never leaves uncooperative code is a VM bug, not a condition this layer
//! is responsible for recovering from (spec.md 5, 9).

use crate::sync::cond::Cond;
use crate::sync::lock::Lock;
use crate::thread::record::ThreadRecord;
use crate::thread::registry::ThreadRegistry;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Coordinates a single in-flight stop-the-world rendezvous across every
/// thread registered in a [`ThreadRegistry`].
pub struct Rendezvous {
    registry: Arc<ThreadRegistry>,
    /// Guards `nb_joined` and orders `cond_initiator`/`cond_end_rv`.
    lock_rv: Lock,
    cond_initiator: Cond,
    cond_end_rv: Cond,
    nb_joined: AtomicUsize,
    /// True while a rendezvous is in flight; used only for debug assertions.
    in_progress: AtomicBool,
}

impl Rendezvous {
    /// Builds a rendezvous coordinator over `registry`.
    pub fn new(registry: Arc<ThreadRegistry>) -> Self {
        Rendezvous {
            registry,
            lock_rv: Lock::new_normal(),
            cond_initiator: Cond::new(),
            cond_end_rv: Cond::new(),
            nb_joined: AtomicUsize::new(0),
            in_progress: AtomicBool::new(false),
        }
    }

    /// Called by the initiator to stop every other mutator. Blocks until
    /// every thread has either joined cooperatively or was already parked
    /// in uncooperative code. Must be paired with [`Rendezvous::finish_rv`].
    pub fn synchronize(&self, self_record: &ThreadRecord) {
        debug_assert_eq!(self.nb_joined.load(Ordering::Relaxed), 0);

        // Lock the thread registry so membership can't change mid-rendezvous;
        // released in finish_rv, mirroring threadLock in CollectionRV.cpp.
        self.registry.lock_membership();
        self.in_progress.store(true, Ordering::Release);

        for t in self.registry.iter_all() {
            t.do_yield.store(true, Ordering::Release);
            debug_assert!(!t.joined_rv.load(Ordering::Relaxed) || std::ptr::eq(t, self_record));
        }

        // Full barrier: publish do_yield to every thread before we start
        // counting who has already joined.
        self_record.joined_rv.store(true, Ordering::SeqCst);

        let mut joined = 0usize;
        for t in self.registry.iter_all() {
            if std::ptr::eq(t, self_record) {
                continue;
            }
            if t.is_uncooperative() {
                joined += 1;
                t.joined_rv.store(true, Ordering::Release);
            }
        }
        self.nb_joined.fetch_add(joined + 1, Ordering::AcqRel);

        self.wait_rv();
        self.lock_rv.unlock();
    }

    fn wait_rv(&self) {
        let total = self.registry.len();
        self.lock_rv.lock();
        while self.nb_joined.load(Ordering::Acquire) != total {
            self.cond_initiator.wait(&self.lock_rv);
        }
    }

    fn another_mark(&self, total: usize) {
        let prev = self.nb_joined.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev + 1 <= total);
        if prev + 1 == total {
            self.cond_initiator.broadcast();
        }
    }

    fn wait_end_rv(&self, self_record: &ThreadRecord) {
        while self_record.do_yield.load(Ordering::Acquire) {
            self.cond_end_rv.wait(&self.lock_rv);
        }
    }

    /// Called by a cooperative mutator at a safepoint poll. If a rendezvous
    /// is in flight, parks here until [`Rendezvous::finish_rv`] releases it.
    pub fn join(&self, self_record: &ThreadRecord) {
        debug_assert!(self_record.do_yield.load(Ordering::Relaxed));
        debug_assert_eq!(self_record.last_sp(), 0, "SP present in cooperative code");

        self_record.in_rv.store(true, Ordering::Release);
        self.lock_rv.lock();
        self_record.publish_last_sp(caller_sp());
        self_record.joined_rv.store(true, Ordering::Release);
        self.another_mark(self.registry.len());
        self.wait_end_rv(self_record);
        self_record.clear_last_sp();
        self.lock_rv.unlock();
        self_record.in_rv.store(false, Ordering::Release);
    }

    /// Called immediately before a mutator transitions into uncooperative
    /// (blocking/native) code, after it has already published `last_sp`.
    pub fn join_before_uncooperative(&self, self_record: &ThreadRecord) {
        debug_assert!(self_record.is_uncooperative(), "SP not set before entering uncooperative code");

        self_record.in_rv.store(true, Ordering::Release);
        self.lock_rv.lock();
        if self_record.do_yield.load(Ordering::Acquire) {
            if !self_record.joined_rv.swap(true, Ordering::AcqRel) {
                self.another_mark(self.registry.len());
            }
            self.wait_end_rv(self_record);
        }
        self.lock_rv.unlock();
        self_record.in_rv.store(false, Ordering::Release);
    }

    /// Called when a mutator returns from uncooperative code, passing the
    /// `sp` it had published on entry.
    pub fn join_after_uncooperative(&self, self_record: &ThreadRecord, sp: usize) {
        debug_assert_eq!(self_record.last_sp(), 0, "SP set after entering uncooperative code");

        self_record.in_rv.store(true, Ordering::Release);
        self.lock_rv.lock();
        if self_record.do_yield.load(Ordering::Acquire) {
            self_record.publish_last_sp(sp);
            if !self_record.joined_rv.swap(true, Ordering::AcqRel) {
                self.another_mark(self.registry.len());
            }
            self.wait_end_rv(self_record);
            self_record.clear_last_sp();
        }
        self.lock_rv.unlock();
        self_record.in_rv.store(false, Ordering::Release);
    }

    /// Called by the initiator once it has finished scanning every stopped
    /// thread, to release everyone back to mutator code.
    pub fn finish_rv(&self, self_record: &ThreadRecord) {
        self.lock_rv.lock();

        for t in self.registry.iter_all() {
            debug_assert!(t.do_yield.load(Ordering::Relaxed));
            debug_assert!(t.joined_rv.load(Ordering::Relaxed));
            t.do_yield.store(false, Ordering::Release);
            t.joined_rv.store(false, Ordering::Release);
        }

        debug_assert_eq!(self.nb_joined.load(Ordering::Relaxed), self.registry.len());
        self.nb_joined.store(0, Ordering::Release);
        self.registry.unlock_membership();
        self.cond_end_rv.broadcast();
        self.in_progress.store(false, Ordering::Release);
        self.lock_rv.unlock();
        self_record.in_rv.store(false, Ordering::Release);
    }
}

/// Busy-waits briefly, then falls back to yielding, until `record.last_sp()`
/// becomes nonzero. Mirrors `Thread::waitOnSP`'s tiered backoff: cheap for
/// the common case where the target thread publishes within a few
/// iterations, falling back to `yield_now` so we never spin unboundedly on
/// a thread stuck behind a long syscall.
pub fn wait_on_sp(record: &ThreadRecord) -> usize {
    let sp = record.last_sp();
    if sp != 0 {
        return sp;
    }
    for _ in 0..1000 {
        let sp = record.last_sp();
        if sp != 0 {
            return sp;
        }
        std::hint::spin_loop();
    }
    loop {
        let sp = record.last_sp();
        if sp != 0 {
            return sp;
        }
        std::thread::yield_now();
    }
}

/// Approximate current stack pointer, used as the "last SP" published when
/// a cooperative thread joins a rendezvous at a safepoint poll. The exact
/// value only needs to dominate every live frame above it; the address of a
/// local in the calling frame is sufficient since the stack walker starts
/// from the saved frame pointer chain, not from this value directly.
#[inline(never)]
pub(crate) fn caller_sp() -> usize {
    let probe: u8 = 0;
    std::ptr::addr_of!(probe) as usize
}
