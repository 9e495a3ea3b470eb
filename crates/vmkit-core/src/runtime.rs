//! Top-level wiring (spec.md 2, "Functional scope").
//!
//! `Runtime::new` installs the process-wide singletons every other module's
//! `install()`/`active()` pair depends on — thread region, frame registry,
//! GC plan, reference processor — in the one order that makes them safe to
//! use afterward. `Runtime::collect` then implements the end-to-end
//! collection control flow spec.md 2 and 8's scenario 1/2 describe:
//! rendezvous, scan every thread's roots, hand off to the plan, process
//! references and finalization candidates, release the rendezvous.

use crate::frame::FrameRegistry;
use crate::frame::{registry::FrameInfo, walker::StackWalker};
use crate::object::ObjectRef;
use crate::plan::GcPlan;
use crate::reference::{FinalizationHost, ReferenceProcessor};
use crate::signal::ExceptionHost;
use crate::thread::allocator::StackRegion;
use crate::thread::record::ThreadRecord;
use crate::thread::registry::ThreadRegistry;
use std::sync::Arc;

/// Everything [`Runtime::new`] needs to bring the core up. Each field is a
/// thing some later module's `install()` takes ownership of.
pub struct RuntimeConfig {
    /// Number of thread slots to reserve (spec.md 4.B).
    pub thread_slots: usize,
    /// Bytes per reserved stack slot; must be a power of two.
    pub stack_size: usize,
    /// Initial heap size hint, passed through to [`GcPlan::boot`].
    pub min_heap: usize,
    /// Maximum heap size hint, passed through to [`GcPlan::boot`].
    pub max_heap: usize,
    /// Raw `-X:gc:...` argument strings (spec.md 6), typically from
    /// [`crate::config::collect_gc_args_from_env`].
    pub gc_args: Vec<String>,
    /// The collection algorithm to install.
    pub plan: Box<dyn GcPlan>,
    /// The embedder's signal→exception bridge target.
    pub exception_host: Box<dyn ExceptionHost>,
    /// The embedder's finalizer/enqueue callback target.
    pub finalization_host: Box<dyn FinalizationHost>,
}

impl RuntimeConfig {
    /// A config using this crate's default region sizing
    /// ([`StackRegion::reserve_default`]'s parameters) and no GC arguments,
    /// for callers that only need to supply the three embedder hooks.
    pub fn with_hosts(
        plan: Box<dyn GcPlan>,
        exception_host: Box<dyn ExceptionHost>,
        finalization_host: Box<dyn FinalizationHost>,
    ) -> Self {
        RuntimeConfig {
            thread_slots: crate::sys::DEFAULT_THREAD_SLOTS,
            stack_size: crate::sys::DEFAULT_STACK_SIZE,
            min_heap: 0,
            max_heap: 0,
            gc_args: Vec::new(),
            plan,
            exception_host,
            finalization_host,
        }
    }
}

/// The running VM core: owns nothing mutators touch directly (that all
/// lives behind the per-module singletons), but holds the handles
/// [`Runtime::collect`] needs that aren't worth a fourth global `OnceCell`.
pub struct Runtime {
    frame_registry: Arc<FrameRegistry>,
    reference_processor: Arc<ReferenceProcessor>,
}

impl Runtime {
    /// Brings up the core: reserves the thread-stack region, installs the
    /// signal bridge, boots and installs the GC plan, and starts the
    /// reference-processor service threads. Must be called exactly once,
    /// before any thread is [`crate::thread::spawn`]ed.
    pub fn new(config: RuntimeConfig) -> Self {
        let region = StackRegion::reserve(config.thread_slots, config.stack_size);
        let thread_registry = Arc::new(ThreadRegistry::new());
        crate::thread::install(region, thread_registry);

        let frame_registry = Arc::new(FrameRegistry::new());
        crate::signal::install(frame_registry.clone(), config.exception_host);

        config.plan.boot(config.min_heap, config.max_heap, &config.gc_args);
        crate::plan::install(config.plan);

        let reference_processor = Arc::new(ReferenceProcessor::new(config.finalization_host));
        crate::reference::install(reference_processor.clone());

        Runtime {
            frame_registry,
            reference_processor,
        }
    }

    /// The process-wide frame registry, for registering a compilation
    /// unit's frame-info blob (spec.md 4.D) after JIT-compiling it.
    pub fn frame_registry(&self) -> &Arc<FrameRegistry> {
        &self.frame_registry
    }

    /// The process-wide reference processor, for registering new
    /// weak/soft/phantom reference objects (spec.md 4.H).
    pub fn reference_processor(&self) -> &Arc<ReferenceProcessor> {
        &self.reference_processor
    }

    /// Suggested number of mutator threads to run in parallel (spec.md 5,
    /// "Scheduling model: Parallel OS threads"). Mirrors the teacher
    /// scheduler's own `num_cpus::get()` worker-count default; this crate
    /// only offers the hint, since starting the actual mutator threads is
    /// the embedder's call via [`crate::thread::spawn`].
    pub fn default_parallelism() -> usize {
        num_cpus::get()
    }

    /// Runs one stop-the-world collection cycle (spec.md 2, 8 scenarios
    /// 1/2/4/5). Must be called from a thread attached via
    /// [`crate::thread::spawn`]. `self_starting_fp` is the calling thread's
    /// own frame pointer at the call site (spec.md 4.E: "obtained from a
    /// compiler builtin"), needed because the initiator is actively running
    /// rather than parked at a published `last_sp` like every other
    /// participant.
    pub fn collect(&self, self_starting_fp: usize) {
        let self_record = crate::thread::current();
        let registry = crate::thread::registry();
        let rendezvous = crate::thread::rendezvous();
        let plan = crate::plan::active();

        rendezvous.synchronize(self_record);

        for thread in registry.iter_all() {
            self.scan_thread_roots(thread, self_record, self_starting_fp, plan);
        }

        plan.collect();

        let closure = 0;
        self.reference_processor.scan_reference_queues(plan, closure);
        self.reference_processor.scan_finalization_candidates(plan, closure);

        rendezvous.finish_rv(self_record);
    }

    /// Walks one thread's stack, reporting every live reference slot in
    /// every frame to the plan via [`GcPlan::scan_object`] (spec.md 4.E,
    /// 4.J).
    fn scan_thread_roots(
        &self,
        thread: &'static ThreadRecord,
        self_record: &ThreadRecord,
        self_starting_fp: usize,
        plan: &dyn GcPlan,
    ) {
        let mut walker = if std::ptr::eq(thread, self_record) {
            StackWalker::for_self(&self.frame_registry, thread, self_starting_fp)
        } else if thread.is_uncooperative() {
            StackWalker::for_parked(&self.frame_registry, thread)
        } else {
            // Joined cooperatively at a safepoint poll: `last_sp` was
            // published by `Rendezvous::join` just like the uncooperative
            // case, so the same parked walker applies.
            StackWalker::for_parked(&self.frame_registry, thread)
        };

        while !walker.done() {
            let info = walker.current();
            let fp = walker.current_fp();
            for &offset in info.live_offsets.iter() {
                if FrameInfo::is_tagged_skip(offset) {
                    continue;
                }
                let addr = (fp as isize + offset as isize) as usize;
                // SAFETY: `offset` comes from a frame-info record registered
                // for this exact return address, guaranteeing it falls
                // within the frame at `fp`.
                let raw = unsafe { *(addr as *const usize) };
                if raw != 0 {
                    let obj = unsafe { ObjectRef::from_raw(raw as *mut u8) };
                    plan.scan_object(obj, 0);
                }
            }
            walker.advance_caller();
        }
    }
}
