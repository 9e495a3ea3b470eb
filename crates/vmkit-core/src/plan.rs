//! GC-plan interface (spec.md 4.J).
//!
//! The core makes no assumptions about marking, copying, or object layout
//! beyond the header contract in [`crate::object`] — every collection
//! decision is delegated to whichever [`GcPlan`] the embedder installs.
//! Resolves the "pick one GC-plan contract" open question from spec.md 9 by
//! expressing the contract as a trait rather than a concrete collector, so a
//! future marking, copying, or MMTk-backed plan can be swapped in without
//! touching the core.
//!
//! Ships [`MarkSweepPlan`], a minimal non-moving reference implementation
//! grounded in the teacher crate's `gc::collector::GarbageCollector`
//! (mark phase / sweep phase / growing threshold) — for testing and
//! demonstration, not a production collector.

use crate::object::{Closure, ObjectRef, VTable};
use once_cell::sync::OnceCell;

/// The contract exchanged between this crate's core and a garbage-collection
/// algorithm (spec.md 4.J).
pub trait GcPlan: Send + Sync {
    /// True if `obj` is currently reachable under the traversal state
    /// carried by `closure`.
    fn is_live(&self, obj: ObjectRef, closure: Closure) -> bool;

    /// Reports an outgoing reference discovered while tracing `obj` —
    /// called from a managed object's `tracer` vtable entry (spec.md 3), or
    /// by the collector reporting a stack root. The plan enqueues `obj` for
    /// further tracing if not already marked.
    fn scan_object(&self, obj: ObjectRef, closure: Closure);

    /// Makes `obj` live for this cycle because it is a finalization
    /// candidate (spec.md 4.H), returning its current (possibly forwarded)
    /// address.
    fn retain_for_finalize(&self, obj: ObjectRef, closure: Closure) -> ObjectRef;

    /// Makes `obj` live because a reference's retain policy requires it
    /// (e.g. a soft reference under memory pressure), returning its current
    /// (possibly forwarded) address.
    fn retain_referent(&self, obj: ObjectRef, closure: Closure) -> ObjectRef;

    /// The current address of `obj` after this cycle's moves, if any
    /// (identity for a non-moving plan).
    fn get_forwarded_object(&self, obj: ObjectRef) -> ObjectRef;

    /// As [`GcPlan::get_forwarded_object`], applied to a reference's
    /// referent specifically (spec.md 4.H `process_reference`).
    fn get_forwarded_referent(&self, obj: ObjectRef) -> ObjectRef;

    /// True if heap field stores must go through a write barrier.
    fn needs_write_barrier(&self) -> bool;

    /// True if stores to non-heap (global/static) slots must go through a
    /// write barrier.
    fn needs_non_heap_write_barrier(&self) -> bool;

    /// Notifies the plan that `src`'s field at byte offset `offset` now
    /// holds `value` (spec.md 4.I: a barrier must "notify the plan of the
    /// cross-region edge per its policy"). A plan with no remembered sets
    /// may no-op.
    fn record_write(&self, src: ObjectRef, offset: usize, value: Option<ObjectRef>);

    /// Runs one collection cycle. Called by
    /// [`crate::runtime::Runtime::collect`] once every mutator has been
    /// stopped and its roots reported via [`GcPlan::scan_object`].
    fn collect(&self);

    /// Allocates `size` bytes for an object whose vtable will be `vtable`,
    /// from the calling thread's allocation buffer. `None` on allocation
    /// failure — the caller triggers a collection and retries, or surfaces
    /// an `OutOfMemoryError` to the hosted language.
    fn mutator_allocate(&self, size: usize, vtable: *const VTable) -> Option<ObjectRef>;

    /// Initializes the plan with heap-size bounds and the raw `-X:gc:...`
    /// argument strings collected by [`crate::config::collect_gc_args`].
    fn boot(&self, min_heap: usize, max_heap: usize, args: &[String]);
}

static PLAN: OnceCell<Box<dyn GcPlan>> = OnceCell::new();

/// Installs the process-wide GC plan. Called once by
/// [`crate::runtime::Runtime::new`], before any mutator allocates.
pub(crate) fn install(plan: Box<dyn GcPlan>) {
    if PLAN.set(plan).is_err() {
        crate::fatal!("GC plan installed twice");
    }
}

/// The installed plan.
///
/// # Panics
/// Panics if called before [`crate::runtime::Runtime::new`].
pub fn active() -> &'static dyn GcPlan {
    PLAN.get().expect("GC plan not initialized: call Runtime::new first").as_ref()
}

mod mark_sweep {
    use super::*;
    use parking_lot::Mutex;
    use rustc_hash::{FxHashMap, FxHashSet};
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Allocation {
        layout: Layout,
    }

    /// Mark/allocation bookkeeping, guarded by a single lock — matching the
    /// teacher collector's single-threaded `&mut self` design, generalized
    /// to a shared reference since `GcPlan` methods take `&self`.
    struct State {
        allocations: FxHashMap<usize, Allocation>,
        marked: FxHashSet<usize>,
        worklist: Vec<usize>,
    }

    /// A minimal non-moving mark-sweep [`GcPlan`], grounded in the teacher
    /// crate's `gc::collector::GarbageCollector`: a growing byte threshold
    /// triggers `collect`, which marks from the worklist fed by
    /// [`GcPlan::scan_object`] then sweeps every unmarked allocation.
    ///
    /// Demonstration-grade: allocation is a raw `alloc_zeroed`/`dealloc`
    /// pair per object rather than a bump-pointer arena, and there is no
    /// remembered set (every collection rescans the full root set).
    pub struct MarkSweepPlan {
        state: Mutex<State>,
        allocated_bytes: AtomicUsize,
        threshold: AtomicUsize,
        collections: AtomicUsize,
    }

    impl MarkSweepPlan {
        /// A fresh plan with the teacher collector's 1 MiB initial
        /// threshold.
        pub fn new() -> Self {
            MarkSweepPlan {
                state: Mutex::new(State {
                    allocations: FxHashMap::default(),
                    marked: FxHashSet::default(),
                    worklist: Vec::new(),
                }),
                allocated_bytes: AtomicUsize::new(0),
                threshold: AtomicUsize::new(1024 * 1024),
                collections: AtomicUsize::new(0),
            }
        }

        /// Total collections run so far.
        pub fn collections(&self) -> usize {
            self.collections.load(Ordering::Relaxed)
        }

        /// Bytes currently live on the heap.
        pub fn allocated_bytes(&self) -> usize {
            self.allocated_bytes.load(Ordering::Relaxed)
        }

        /// True if the next allocation should trigger a collection first —
        /// callers of `mutator_allocate` in a real embedder check this
        /// before allocating; the plan itself never calls `collect`
        /// reentrantly.
        pub fn should_collect(&self) -> bool {
            self.allocated_bytes() > self.threshold.load(Ordering::Relaxed)
        }
    }

    impl Default for MarkSweepPlan {
        fn default() -> Self {
            Self::new()
        }
    }

    impl GcPlan for MarkSweepPlan {
        fn is_live(&self, obj: ObjectRef, _closure: Closure) -> bool {
            self.state.lock().marked.contains(&(obj.as_ptr() as usize))
        }

        fn scan_object(&self, obj: ObjectRef, _closure: Closure) {
            let addr = obj.as_ptr() as usize;
            let mut state = self.state.lock();
            if state.marked.insert(addr) {
                state.worklist.push(addr);
            }
        }

        fn retain_for_finalize(&self, obj: ObjectRef, closure: Closure) -> ObjectRef {
            self.scan_object(obj, closure);
            obj
        }

        fn retain_referent(&self, obj: ObjectRef, closure: Closure) -> ObjectRef {
            self.scan_object(obj, closure);
            obj
        }

        fn get_forwarded_object(&self, obj: ObjectRef) -> ObjectRef {
            obj
        }

        fn get_forwarded_referent(&self, obj: ObjectRef) -> ObjectRef {
            obj
        }

        fn needs_write_barrier(&self) -> bool {
            // Non-moving, single-generation: no remembered set to maintain.
            false
        }

        fn needs_non_heap_write_barrier(&self) -> bool {
            false
        }

        fn record_write(&self, _src: ObjectRef, _offset: usize, _value: Option<ObjectRef>) {}

        fn collect(&self) {
            let this = self as *const Self as Closure;
            loop {
                let addr = {
                    let mut state = self.state.lock();
                    state.worklist.pop()
                };
                let Some(addr) = addr else { break };
                // SAFETY: `addr` came from a live `ObjectRef` passed to
                // `scan_object`/allocation; the object is still in
                // `allocations` (not yet swept, since sweeping only runs
                // after the worklist drains).
                let obj = unsafe { ObjectRef::from_raw(addr as *mut u8) };
                let tracer = unsafe { (*obj.vtable()).tracer };
                unsafe { tracer(obj, this) };
            }

            let mut state = self.state.lock();
            let marked = std::mem::take(&mut state.marked);
            let dead: Vec<usize> = state
                .allocations
                .keys()
                .copied()
                .filter(|addr| !marked.contains(addr))
                .collect();
            for addr in dead {
                if let Some(alloc) = state.allocations.remove(&addr) {
                    self.allocated_bytes.fetch_sub(alloc.layout.size(), Ordering::Relaxed);
                    unsafe { dealloc(addr as *mut u8, alloc.layout) };
                }
            }
            drop(state);

            self.collections.fetch_add(1, Ordering::Relaxed);
            let usage = self.allocated_bytes();
            self.threshold.store((usage * 2).max(1024 * 1024), Ordering::Relaxed);
        }

        fn mutator_allocate(&self, size: usize, vtable: *const VTable) -> Option<ObjectRef> {
            let layout = Layout::from_size_align(size, std::mem::align_of::<usize>()).ok()?;
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return None;
            }
            unsafe { *(ptr as *mut *const VTable) = vtable };
            self.allocated_bytes.fetch_add(size, Ordering::Relaxed);
            self.state.lock().allocations.insert(ptr as usize, Allocation { layout });
            Some(unsafe { ObjectRef::from_raw(ptr) })
        }

        fn boot(&self, _min_heap: usize, _max_heap: usize, _args: &[String]) {
            // The reference plan ignores heap-size hints and `-X:gc:` args;
            // a production plan would size its arena from them here.
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        unsafe extern "C" fn no_refs_tracer(_obj: ObjectRef, _closure: Closure) {}

        fn leaf_vtable() -> VTable {
            VTable {
                destructor: crate::object::EMPTY_DESTRUCTOR,
                operator_delete: crate::object::EMPTY_DESTRUCTOR,
                tracer: no_refs_tracer,
            }
        }

        #[test]
        fn unmarked_allocation_is_swept() {
            let plan = MarkSweepPlan::new();
            let vt = leaf_vtable();
            let obj = plan.mutator_allocate(16, &vt as *const VTable).unwrap();
            assert!(plan.allocated_bytes() > 0);
            assert!(!plan.is_live(obj, 0));

            plan.collect();
            assert_eq!(plan.allocated_bytes(), 0);
            assert_eq!(plan.collections(), 1);
        }

        #[test]
        fn marked_allocation_survives_a_collection() {
            let plan = MarkSweepPlan::new();
            let vt = leaf_vtable();
            let obj = plan.mutator_allocate(16, &vt as *const VTable).unwrap();
            plan.scan_object(obj, 0);
            assert!(plan.is_live(obj, 0));

            plan.collect();
            assert!(plan.allocated_bytes() > 0);
        }

        #[test]
        fn tracer_is_invoked_for_marked_objects_children() {
            use std::sync::atomic::{AtomicUsize, Ordering};
            static TRACED: AtomicUsize = AtomicUsize::new(0);
            unsafe extern "C" fn counting_tracer(_obj: ObjectRef, _closure: Closure) {
                TRACED.fetch_add(1, Ordering::Relaxed);
            }
            let plan = MarkSweepPlan::new();
            let vt = VTable {
                destructor: crate::object::EMPTY_DESTRUCTOR,
                operator_delete: crate::object::EMPTY_DESTRUCTOR,
                tracer: counting_tracer,
            };
            let obj = plan.mutator_allocate(16, &vt as *const VTable).unwrap();
            plan.scan_object(obj, 0);
            plan.collect();
            assert_eq!(TRACED.load(Ordering::Relaxed), 1);
        }
    }
}

pub use mark_sweep::MarkSweepPlan;
