//! Reference & finalizer processing.
//!
//! Two service threads run for the life of the VM: a *finalizer* thread
//! draining `to_be_finalized`, and a *reference-enqueue* thread draining
//! `to_enqueue`. Both are spawned as ordinary named worker threads through
//! [`crate::thread::spawn`] so they themselves are ordinary, rendezvous-
//! visible mutators (a finalizer calling back into allocating language code
//! must be walkable like any other thread).

use crate::error::VmkitError;
use crate::object::ObjectRef;
use crate::plan::GcPlan;
use crate::sync::{Cond, Lock};
use crate::sys::WORD_SIZE;
use crate::thread::record::ThreadRole;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static PROCESSOR: OnceCell<Arc<ReferenceProcessor>> = OnceCell::new();

/// Installs the process-wide reference processor and starts its service
/// threads. Called once by [`crate::runtime::Runtime::new`].
pub(crate) fn install(processor: Arc<ReferenceProcessor>) {
    processor.spawn_service_threads();
    if PROCESSOR.set(processor).is_err() {
        crate::fatal!("reference processor installed twice");
    }
}

/// The installed reference processor, consulted by [`crate::barrier`]'s
/// allocation entry points to register finalization candidates.
pub fn active() -> &'static ReferenceProcessor {
    PROCESSOR.get().expect("reference processor not initialized: call Runtime::new first")
}

/// Byte offset of a reference object's referent field, relative to the
/// object's base (i.e. immediately after the vtable-pointer word). A fixed
/// convention rather than something the plan or caller can vary — every
/// reference object the language emits must place its referent here.
pub const REFERENT_OFFSET: usize = WORD_SIZE;

/// A growable, FIFO-ish buffer. `std::Vec` already grows by (approximately)
/// doubling; this wrapper only adds a `Result`-returning push in place of
/// aborting the process on exhaustion.
pub struct GrowQueue<T> {
    name: &'static str,
    items: Vec<T>,
}

impl<T> GrowQueue<T> {
    /// An empty queue, tagged with `name` for [`VmkitError::Oom`]
    /// diagnostics.
    pub fn new(name: &'static str) -> Self {
        GrowQueue { name, items: Vec::new() }
    }

    /// Appends `item`, growing the backing allocation if needed.
    pub fn push(&mut self, item: T) -> Result<(), VmkitError> {
        if self.items.len() == self.items.capacity() {
            let additional = self.items.capacity().max(4);
            self.items
                .try_reserve(additional)
                .map_err(|_| VmkitError::Oom { queue: self.name })?;
        }
        self.items.push(item);
        Ok(())
    }

    /// Removes and returns every item, leaving the queue empty.
    pub fn drain_all(&mut self) -> Vec<T> {
        std::mem::take(&mut self.items)
    }

    /// Keeps only the items for which `f` returns true.
    pub fn retain(&mut self, f: impl FnMut(&T) -> bool) {
        self.items.retain(f);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Which of the three semantics a registered reference object follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// Referent cleared as soon as it is unreachable from strong roots.
    Weak,
    /// As weak, but the plan may retain the referent under memory pressure
    /// before clearing it.
    Soft,
    /// Referent is never handed back to language code; only the
    /// enqueue-on-death notification is delivered.
    Phantom,
}

/// Optional OSGi-style stale-reference correction: a three-mode scan
/// modeled on the newer `Incinerator` design rather than an eager bitmap.
/// Gated behind the `stale-refs` feature since most embedders never need it.
#[cfg(feature = "stale-refs")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleRefMode {
    /// No stale-reference correction.
    Disabled,
    /// Stale references reachable only from non-finalizable objects are
    /// queued for clearing.
    Inclusive,
    /// As inclusive, but a stale reference reachable from a finalizable
    /// object is un-queued instead, forcing a rescan next cycle.
    Exclusive,
}

/// Embedder hook for finalizer/enqueue service-thread callbacks into the
/// hosted language. This crate only defines the call boundary; the hosted
/// language's own finalizer/enqueue semantics live on the other side of it.
pub trait FinalizationHost: Send + Sync {
    /// Invokes the hosted language's `finalize()` method on `obj` (used
    /// when the object's vtable destructor is the empty-destructor
    /// sentinel but the language still defines a finalizer).
    fn invoke_language_finalizer(&self, obj: ObjectRef);
    /// Invokes the hosted language's `enqueue()` method on a reference
    /// object whose referent has died.
    fn invoke_enqueue(&self, ref_obj: ObjectRef);
}

/// Coordinates the three reference queues and the finalization queue, and
/// the two service threads that drain their respective pending buffers.
pub struct ReferenceProcessor {
    weak: Mutex<GrowQueue<ObjectRef>>,
    soft: Mutex<GrowQueue<ObjectRef>>,
    phantom: Mutex<GrowQueue<ObjectRef>>,
    to_enqueue: Mutex<GrowQueue<ObjectRef>>,
    finalization_queue: Mutex<GrowQueue<ObjectRef>>,
    to_be_finalized: Mutex<Vec<ObjectRef>>,

    finalization_lock: Lock,
    finalization_cond: Cond,
    enqueue_lock: Lock,
    enqueue_cond: Cond,

    host: Box<dyn FinalizationHost>,
    under_memory_pressure: AtomicBool,
    #[cfg(feature = "stale-refs")]
    stale_mode: parking_lot::Mutex<StaleRefMode>,
}

impl ReferenceProcessor {
    /// Builds an empty processor. Service threads are started separately by
    /// [`crate::runtime::Runtime::new`] via [`ReferenceProcessor::spawn_service_threads`].
    pub fn new(host: Box<dyn FinalizationHost>) -> Self {
        ReferenceProcessor {
            weak: Mutex::new(GrowQueue::new("weak reference queue")),
            soft: Mutex::new(GrowQueue::new("soft reference queue")),
            phantom: Mutex::new(GrowQueue::new("phantom reference queue")),
            to_enqueue: Mutex::new(GrowQueue::new("to_enqueue")),
            finalization_queue: Mutex::new(GrowQueue::new("finalization queue")),
            to_be_finalized: Mutex::new(Vec::new()),
            finalization_lock: Lock::new_normal(),
            finalization_cond: Cond::new(),
            enqueue_lock: Lock::new_normal(),
            enqueue_cond: Cond::new(),
            host,
            under_memory_pressure: AtomicBool::new(false),
            #[cfg(feature = "stale-refs")]
            stale_mode: parking_lot::Mutex::new(StaleRefMode::Disabled),
        }
    }

    /// Sets whether the plan is currently under memory pressure, consulted
    /// by the soft-reference retain policy in [`ReferenceProcessor::process_reference`].
    pub fn set_under_memory_pressure(&self, pressure: bool) {
        self.under_memory_pressure.store(pressure, Ordering::Release);
    }

    /// Configures the stale-reference correction mode.
    #[cfg(feature = "stale-refs")]
    pub fn set_stale_ref_mode(&self, mode: StaleRefMode) {
        *self.stale_mode.lock() = mode;
    }

    #[cfg(feature = "stale-refs")]
    fn stale_ref_mode(&self) -> StaleRefMode {
        *self.stale_mode.lock()
    }

    /// Registers a new reference object of the given kind. Called by the
    /// language runtime when a `WeakReference`/`SoftReference`/
    /// `PhantomReference` is constructed.
    pub fn register_reference(&self, ref_obj: ObjectRef, kind: ReferenceKind) -> Result<(), VmkitError> {
        match kind {
            ReferenceKind::Weak => self.weak.lock().push(ref_obj),
            ReferenceKind::Soft => self.soft.lock().push(ref_obj),
            ReferenceKind::Phantom => self.phantom.lock().push(ref_obj),
        }
    }

    /// Registers `obj` as a finalization candidate — called at allocation
    /// time for any object whose vtable destructor is not the empty
    /// sentinel.
    pub fn register_finalization_candidate(&self, obj: ObjectRef) -> Result<(), VmkitError> {
        self.finalization_queue.lock().push(obj)
    }

    /// Finalization-queue scan, called by the collector once per cycle
    /// after roots have been traced. For each registered
    /// candidate: if still live, keep scanning it next cycle; otherwise ask
    /// the plan to retain it for finalization and move it to
    /// `to_be_finalized`.
    pub fn scan_finalization_candidates(&self, plan: &dyn GcPlan, closure: crate::object::Closure) {
        let mut queue = self.finalization_queue.lock();
        let mut newly_dead = Vec::new();
        let mut still_tracked = Vec::new();

        for obj in queue.drain_all() {
            if plan.is_live(obj, closure) {
                still_tracked.push(plan.get_forwarded_object(obj));
            } else {
                let retained = plan.retain_for_finalize(obj, closure);
                newly_dead.push(retained);
            }
        }
        for obj in still_tracked {
            // Reinsertion after drain cannot hit the Oom path in practice
            // (the queue never grows past what it held a moment ago), but
            // honor the same fallible contract rather than special-casing.
            let _ = queue.push(obj);
        }
        drop(queue);

        if newly_dead.is_empty() {
            return;
        }
        let mut pending = self.to_be_finalized.lock();
        pending.extend(newly_dead);
        drop(pending);
        self.finalization_cond.broadcast();
    }

    /// Decides whether a registered reference's referent survives this
    /// cycle, and if not, schedules the reference object for enqueue
    /// notification.
    fn process_reference(&self, ref_obj: ObjectRef, kind: ReferenceKind, plan: &dyn GcPlan, closure: crate::object::Closure) -> ProcessOutcome {
        if !plan.is_live(ref_obj, closure) {
            return ProcessOutcome::Drop;
        }
        let forwarded_ref = plan.get_forwarded_object(ref_obj);

        let Some(referent) = (unsafe { forwarded_ref.read_field(REFERENT_OFFSET) }) else {
            return ProcessOutcome::Keep(forwarded_ref);
        };

        let referent = if kind == ReferenceKind::Soft && self.under_memory_pressure.load(Ordering::Acquire) {
            plan.retain_referent(referent, closure)
        } else {
            referent
        };

        if plan.is_live(referent, closure) {
            let forwarded_referent = plan.get_forwarded_referent(referent);
            unsafe { forwarded_ref.write_field(REFERENT_OFFSET, Some(forwarded_referent)) };
            ProcessOutcome::Keep(forwarded_ref)
        } else {
            unsafe { forwarded_ref.write_field(REFERENT_OFFSET, None) };
            ProcessOutcome::Enqueue(forwarded_ref)
        }
    }

    /// Scans all three reference queues, called by the collector once per
    /// cycle after marking. Surviving entries are kept
    /// in their queue; dead ones move to `to_enqueue` and the enqueue
    /// thread is woken.
    pub fn scan_reference_queues(&self, plan: &dyn GcPlan, closure: crate::object::Closure) {
        let mut any_enqueued = false;
        for (queue, kind) in [
            (&self.weak, ReferenceKind::Weak),
            (&self.soft, ReferenceKind::Soft),
            (&self.phantom, ReferenceKind::Phantom),
        ] {
            let mut guard = queue.lock();
            let drained = guard.drain_all();
            let mut survivors = Vec::with_capacity(drained.len());
            let mut dead = Vec::new();
            for ref_obj in drained {
                match self.process_reference(ref_obj, kind, plan, closure) {
                    ProcessOutcome::Drop => {}
                    ProcessOutcome::Keep(r) => survivors.push(r),
                    ProcessOutcome::Enqueue(r) => dead.push(r),
                }
            }
            for r in survivors {
                let _ = guard.push(r);
            }
            drop(guard);

            if !dead.is_empty() {
                any_enqueued = true;
                let mut to_enqueue = self.to_enqueue.lock();
                for r in dead {
                    let _ = to_enqueue.push(r);
                }
            }
        }
        if any_enqueued {
            self.enqueue_cond.broadcast();
        }
    }

    /// Starts the finalizer and reference-enqueue service threads. Called
    /// once by [`crate::runtime::Runtime::new`].
    pub(crate) fn spawn_service_threads(self: &std::sync::Arc<Self>) {
        let finalizer = self.clone();
        crate::thread::spawn("vmkit-finalizer", ThreadRole::Finalizer, move || {
            finalizer.finalizer_loop();
        });
        let enqueuer = self.clone();
        crate::thread::spawn("vmkit-reference-enqueue", ThreadRole::ReferenceEnqueue, move || {
            enqueuer.enqueue_loop();
        });
    }

    /// Finalizer thread loop: wait for
    /// `to_be_finalized` to be non-empty, drain it LIFO, running each
    /// object's destructor (or the language-level finalizer, if the
    /// destructor is the empty sentinel). Exceptions are caught and
    /// discarded so one broken finalizer cannot wedge the thread.
    fn finalizer_loop(&self) {
        loop {
            self.finalization_lock.lock();
            let mut batch = loop {
                let mut pending = self.to_be_finalized.lock();
                if !pending.is_empty() {
                    break std::mem::take(&mut *pending);
                }
                drop(pending);
                self.finalization_cond.wait(&self.finalization_lock);
            };
            self.finalization_lock.unlock();

            while let Some(obj) = batch.pop() {
                self.finalize_one(obj);
            }
        }
    }

    fn finalize_one(&self, obj: ObjectRef) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            // SAFETY: `obj` was registered as a finalization candidate at
            // allocation time and is guaranteed live by `retain_for_finalize`.
            if unsafe { obj.has_destructor() } {
                let vt = unsafe { &*obj.vtable() };
                unsafe { (vt.destructor)(obj) };
            } else {
                self.host.invoke_language_finalizer(obj);
            }
        }));
        if let Err(payload) = result {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            eprintln!("vmkit: finalizer panicked: {message}");
        }
    }

    /// Enqueue thread loop: symmetric to the finalizer loop,
    /// drains `to_enqueue` and invokes the language-level `enqueue()`
    /// method on each reference.
    fn enqueue_loop(&self) {
        loop {
            self.enqueue_lock.lock();
            let mut batch = loop {
                let mut queue = self.to_enqueue.lock();
                if !queue.is_empty() {
                    break queue.drain_all();
                }
                drop(queue);
                self.enqueue_cond.wait(&self.enqueue_lock);
            };
            self.enqueue_lock.unlock();

            while let Some(ref_obj) = batch.pop() {
                let result = catch_unwind(AssertUnwindSafe(|| self.host.invoke_enqueue(ref_obj)));
                if let Err(payload) = result {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    eprintln!("vmkit: reference enqueue() panicked: {message}");
                }
            }
        }
    }
}

enum ProcessOutcome {
    /// The reference object itself is dead; drop it from the queue.
    Drop,
    /// The reference object survives; keep it in its queue (already
    /// forwarded).
    Keep(ObjectRef),
    /// The referent has died; the reference moves to `to_enqueue`.
    Enqueue(ObjectRef),
}
