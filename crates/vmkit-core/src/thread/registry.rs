//! The live-thread list (spec.md 3, `MyVM`'s thread list in the original).
//!
//! Two different kinds of exclusion are needed here, matching the
//! original's `VirtualMachine::threadLock`:
//!
//! - ordinary add/remove of a thread record uses a ctld `RwLock` for the
//!   backing `Vec`;
//! - [`ThreadRegistry::lock_membership`] is the *rendezvous* exclusivity
//!   lock — held by the initiator for the whole stop-the-world pause so no
//!   thread can attach or detach while a collection walks the list.

use crate::sync::lock::Lock;
use crate::thread::record::ThreadRecord;
use parking_lot::RwLock;

/// A `Send + Sync` handle to a [`ThreadRecord`] living in a reserved
/// [`crate::thread::allocator::StackRegion`] slot, which is valid for the
/// life of the process (or at least until the slot is released, which
/// cannot happen while the owning thread is still registered here).
#[derive(Clone, Copy)]
struct ThreadHandle {
    ptr: *const ThreadRecord,
}

unsafe impl Send for ThreadHandle {}
unsafe impl Sync for ThreadHandle {}

/// The set of currently-live thread records.
pub struct ThreadRegistry {
    thread_lock: Lock,
    threads: RwLock<Vec<ThreadHandle>>,
}

impl ThreadRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        ThreadRegistry {
            thread_lock: Lock::new_normal(),
            threads: RwLock::new(Vec::new()),
        }
    }

    /// Registers a newly attached thread. `record` must outlive its removal
    /// via [`ThreadRegistry::unregister`].
    pub fn register(&self, record: &ThreadRecord) {
        self.threads.write().push(ThreadHandle { ptr: record });
    }

    /// Removes a thread record, called once the owning thread has detached.
    pub fn unregister(&self, record: &ThreadRecord) {
        let ptr = record as *const ThreadRecord;
        self.threads.write().retain(|h| h.ptr != ptr);
    }

    /// Number of currently-registered threads.
    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    /// True if no thread is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of every registered thread record. Safe to call while
    /// holding [`ThreadRegistry::lock_membership`], since no thread can be
    /// added or removed until it is released.
    pub fn iter_all(&self) -> Vec<&'static ThreadRecord> {
        self.threads
            .read()
            .iter()
            // SAFETY: thread records live in a process-lifetime reserved
            // region; a record is only unregistered after its owning thread
            // has fully detached, and callers walking this snapshot do so
            // under `lock_membership`, which blocks concurrent detachment.
            .map(|h| unsafe { &*h.ptr })
            .collect()
    }

    /// Acquires rendezvous exclusivity: blocks thread add/remove until
    /// [`ThreadRegistry::unlock_membership`] is called. Mirrors the
    /// original's `self->MyVM->threadLock.lock()` in
    /// `CooperativeCollectionRV::synchronize`.
    pub fn lock_membership(&self) {
        self.thread_lock.lock();
    }

    /// Releases rendezvous exclusivity.
    pub fn unlock_membership(&self) {
        self.thread_lock.unlock();
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}
