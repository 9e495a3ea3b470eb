//! Safepoint-aware locks (spec.md 4.C).
//!
//! Translated from `lib/vmkit/CommonThread/ctlock.cpp`'s `LockNormal` and
//! `LockRecursive`. The mutator must announce "I am about to block" before
//! taking the underlying mutex, so a rendezvous initiator never waits on a
//! thread parked behind a lock — that announcement is `crate::thread`'s
//! `enter_uncooperative`/`leave_uncooperative` hooks, called here exactly
//! the way the original wraps `pthread_mutex_lock`.
//!
//! Built on `parking_lot::RawMutex` rather than `parking_lot::Mutex<T>`:
//! the original API is explicit lock/unlock pairs instead of a scope guard
//! (callers release across a condvar wait, or release all recursion levels
//! at once), which the raw mutex type expresses directly.

use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A small per-OS-thread identity independent of `crate::thread`'s
/// stack-mask-derived id. `Lock` is a primitive usable by code that never
/// attaches to the vmkit thread registry (e.g. the registry's own
/// `thread_lock`, or a standalone test), so it cannot assume
/// `crate::thread::current_id()` is callable.
fn current_thread_token() -> u64 {
    thread_local! {
        static TOKEN: Cell<u64> = const { Cell::new(0) };
    }
    static NEXT: AtomicU64 = AtomicU64::new(1);
    TOKEN.with(|cell| {
        let existing = cell.get();
        if existing != 0 {
            return existing;
        }
        let fresh = NEXT.fetch_add(1, Ordering::Relaxed);
        cell.set(fresh);
        fresh
    })
}

/// Whether a [`Lock`] allows the owning thread to reacquire it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Normal,
    Recursive,
}

/// A mutex that cooperates with the collection rendezvous: acquiring it
/// (when contended) always passes through an uncooperative-code region so a
/// stop-the-world pause never has to wait on a thread parked here.
pub struct Lock {
    raw: RawMutex,
    kind: Kind,
    /// 0 means unowned; otherwise `1 + thread id`, so id 0 is distinguishable.
    owner: AtomicU64,
    depth: AtomicUsize,
}

fn owner_token(id: u64) -> u64 {
    id + 1
}

impl Lock {
    /// A lock that a thread may not reacquire (matches `LockNormal`).
    pub fn new_normal() -> Self {
        Lock {
            raw: RawMutex::INIT,
            kind: Kind::Normal,
            owner: AtomicU64::new(0),
            depth: AtomicUsize::new(0),
        }
    }

    /// A lock the owning thread may reacquire any number of times (matches
    /// `LockRecursive`).
    pub fn new_recursive() -> Self {
        Lock {
            raw: RawMutex::INIT,
            kind: Kind::Recursive,
            owner: AtomicU64::new(0),
            depth: AtomicUsize::new(0),
        }
    }

    /// True if `thread_id` (or the calling thread, if `None`) currently
    /// holds this lock.
    pub fn self_owner(&self, thread_id: Option<u64>) -> bool {
        let id = thread_id.unwrap_or_else(current_thread_token);
        self.owner.load(Ordering::Acquire) == owner_token(id)
    }

    /// Blocks until the lock is acquired (or, for a recursive lock already
    /// owned by this thread, bumps the recursion depth and returns
    /// immediately).
    pub fn lock(&self) {
        if self.kind == Kind::Recursive && self.self_owner(None) {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return;
        }

        crate::thread::enter_uncooperative();
        self.raw.lock();
        crate::thread::leave_uncooperative();

        self.owner.store(owner_token(current_thread_token()), Ordering::Release);
        if self.kind == Kind::Recursive {
            self.depth.store(1, Ordering::Release);
        }
    }

    /// Non-blocking variant of [`Lock::lock`].
    pub fn try_lock(&self) -> bool {
        if self.kind == Kind::Recursive && self.self_owner(None) {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        if !self.raw.try_lock() {
            return false;
        }
        self.owner.store(owner_token(current_thread_token()), Ordering::Release);
        if self.kind == Kind::Recursive {
            self.depth.store(1, Ordering::Release);
        }
        true
    }

    /// Releases one level of ownership. Debug-asserts that the calling
    /// thread is the owner, matching the original's `assert(selfOwner(...))`.
    pub fn unlock(&self) {
        debug_assert!(self.self_owner(None), "not owner when unlocking");
        if self.kind == Kind::Recursive {
            let prev = self.depth.fetch_sub(1, Ordering::AcqRel);
            if prev > 1 {
                return;
            }
        }
        self.owner.store(0, Ordering::Release);
        // SAFETY: only called while `self_owner` holds, matching
        // `pthread_mutex_unlock`'s precondition.
        unsafe { self.raw.unlock() };
    }

    /// Releases every level of recursion at once, returning the depth that
    /// was held, or `None` if the calling thread does not own the lock.
    /// Mirrors `LockRecursive::unlockAll` — used by
    /// [`crate::sync::cond::Cond`] to fully release the lock before
    /// blocking on a condvar wait.
    pub fn unlock_all(&self) -> Option<usize> {
        if !self.self_owner(None) {
            return None;
        }
        let depth = self.depth.swap(0, Ordering::AcqRel).max(1);
        self.owner.store(0, Ordering::Release);
        unsafe { self.raw.unlock() };
        Some(depth)
    }

    /// Reacquires a lock released via [`Lock::unlock_all`], restoring
    /// `depth` levels of recursion. Mirrors `LockRecursive::lockAll`.
    pub fn lock_all(&self, depth: usize) {
        crate::thread::enter_uncooperative();
        self.raw.lock();
        crate::thread::leave_uncooperative();
        self.owner.store(owner_token(current_thread_token()), Ordering::Release);
        self.depth.store(depth.max(1), Ordering::Release);
    }

    pub(crate) fn raw(&self) -> &RawMutex {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn normal_lock_excludes_concurrent_access() {
        crate::thread::testing::ensure_installed();
        let lock = Arc::new(Lock::new_normal());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(crate::thread::spawn(
                format!("lock-test-{i}"),
                crate::thread::record::ThreadRole::Mutator,
                move || {
                    for _ in 0..100 {
                        lock.lock();
                        counter.fetch_add(1, Ordering::Relaxed);
                        lock.unlock();
                    }
                },
            ));
        }
        for h in handles {
            h.join();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 400);
    }

    #[test]
    fn recursive_lock_allows_reentry_and_unlock_all() {
        let lock = Lock::new_recursive();
        lock.lock();
        lock.lock();
        assert!(lock.self_owner(None));
        let depth = lock.unlock_all();
        assert_eq!(depth, Some(2));
        assert!(!lock.self_owner(None));
    }

    #[test]
    fn unlock_all_on_foreign_thread_returns_none() {
        let lock = Arc::new(Lock::new_recursive());
        lock.lock();
        let other = std::thread::spawn({
            let lock = lock.clone();
            move || lock.unlock_all()
        })
        .join()
        .unwrap();
        assert_eq!(other, None);
        lock.unlock();
    }
}
