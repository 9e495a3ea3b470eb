//! Safepoint-aware condition variables (spec.md 4.C).
//!
//! Translated from `lib/vmkit/CommonThread/ctlock.cpp`'s `Cond`. A wait
//! releases every level of the caller's [`Lock`] (recursive locks may be
//! held several times), blocks while the thread is marked uncooperative,
//! then reacquires the same depth on wakeup.
//!
//! `Lock` is built on a raw, guard-less mutex (so `unlock_all`/`lock_all`
//! can cross the wait), which means it can't hand `parking_lot::Condvar` the
//! `MutexGuard` it expects. Instead, `Cond` carries its own internal
//! `Mutex`/`Condvar` pair purely for the wait/notify signal, and holds that
//! internal mutex across the external lock's release so a `signal`/
//! `broadcast` that arrives between "release the external lock" and "start
//! waiting" is never lost.

use crate::error::WaitResult;
use crate::sync::lock::Lock;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A condition variable that pairs with a [`Lock`] rather than a specific
/// guard type, matching the original's `Cond::wait(Lock*)` signature.
pub struct Cond {
    gate: Mutex<()>,
    cv: Condvar,
}

impl Cond {
    /// Creates an unsignaled condition variable.
    pub fn new() -> Self {
        Cond {
            gate: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Releases `lock` (all recursion levels), waits for a signal or
    /// broadcast, then reacquires it to the same depth. The calling thread
    /// must already own `lock`.
    pub fn wait(&self, lock: &Lock) {
        let mut gate = self.gate.lock();
        let depth = lock.unlock_all().expect("Cond::wait: lock not held by caller");

        crate::thread::enter_uncooperative();
        self.cv.wait(&mut gate);
        crate::thread::leave_uncooperative();

        drop(gate);
        lock.lock_all(depth);
    }

    /// As [`Cond::wait`], but returns early if `timeout` elapses first.
    pub fn timed_wait(&self, lock: &Lock, timeout: Duration) -> WaitResult {
        let deadline = Instant::now() + timeout;
        let mut gate = self.gate.lock();
        let depth = lock.unlock_all().expect("Cond::timed_wait: lock not held by caller");

        crate::thread::enter_uncooperative();
        let remaining = deadline.saturating_duration_since(Instant::now());
        let timed_out = self.cv.wait_for(&mut gate, remaining).timed_out();
        crate::thread::leave_uncooperative();

        drop(gate);
        lock.lock_all(depth);

        if timed_out {
            WaitResult::Timeout
        } else {
            WaitResult::Notified
        }
    }

    /// Wakes exactly one waiter.
    pub fn signal(&self) {
        let _gate = self.gate.lock();
        self.cv.notify_one();
    }

    /// Wakes every waiter.
    pub fn broadcast(&self) {
        let _gate = self.gate.lock();
        self.cv.notify_all();
    }
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn broadcast_wakes_all_waiters() {
        let lock = Arc::new(Lock::new_normal());
        let cond = Arc::new(Cond::new());
        let ready = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let lock = lock.clone();
            let cond = cond.clone();
            let ready = ready.clone();
            handles.push(thread::spawn(move || {
                lock.lock();
                ready.fetch_add(1, Ordering::SeqCst);
                cond.wait(&lock);
                lock.unlock();
            }));
        }

        while ready.load(Ordering::SeqCst) < 3 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));

        cond.broadcast();

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn timed_wait_reports_timeout_with_no_signal() {
        let lock = Lock::new_normal();
        let cond = Cond::new();
        lock.lock();
        let result = cond.timed_wait(&lock, Duration::from_millis(10));
        lock.unlock();
        assert_eq!(result, WaitResult::Timeout);
    }
}
