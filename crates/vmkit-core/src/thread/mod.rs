//! Threads with no OS TLS (spec.md 3, 4.B).
//!
//! A thread started through [`spawn`] runs with its OS stack placed
//! directly inside a [`allocator::StackRegion`] slot (via
//! `pthread_attr_setstack`, mirroring `Thread::start` in `ctthread.cpp`), so
//! [`current`] can always recover the calling thread's
//! [`record::ThreadRecord`] from nothing but the stack pointer.

pub mod allocator;
pub mod record;
pub mod registry;

use crate::rendezvous::Rendezvous;
use crate::thread::allocator::StackRegion;
use crate::thread::record::{KnownFrame, ThreadRecord, ThreadRole};
use crate::thread::registry::ThreadRegistry;
use once_cell::sync::OnceCell;
use std::sync::atomic::Ordering;
use std::sync::Arc;

struct RuntimeHandles {
    region: StackRegion,
    registry: Arc<ThreadRegistry>,
    rendezvous: Rendezvous,
}

static HANDLES: OnceCell<RuntimeHandles> = OnceCell::new();

/// Wires up the process-wide region/registry/rendezvous singletons. Called
/// once by [`crate::runtime::Runtime::new`]; every other function in this
/// module panics if called before this.
pub(crate) fn install(region: StackRegion, registry: Arc<ThreadRegistry>) {
    let rendezvous = Rendezvous::new(registry.clone());
    HANDLES
        .set(RuntimeHandles {
            region,
            registry,
            rendezvous,
        })
        .unwrap_or_else(|_| crate::fatal!("vmkit runtime installed twice"));
}

fn handles() -> &'static RuntimeHandles {
    HANDLES.get().expect("vmkit runtime not initialized: call Runtime::new first")
}

pub(crate) fn region() -> &'static StackRegion {
    &handles().region
}

pub(crate) fn registry() -> &'static Arc<ThreadRegistry> {
    &handles().registry
}

pub(crate) fn rendezvous() -> &'static Rendezvous {
    &handles().rendezvous
}

/// True if the calling thread's stack pointer falls inside the installed
/// region, i.e. [`current`] is safe to call from here. False both when the
/// runtime hasn't been installed yet and when it has but this particular OS
/// thread was never [`spawn`]ed through it — the two no-runtime/unmanaged
/// cases `enter_uncooperative`/`leave_uncooperative` must no-op for.
#[inline]
fn on_managed_stack() -> bool {
    let Some(handles) = HANDLES.get() else {
        return false;
    };
    let probe: u8 = 0;
    let sp = std::ptr::addr_of!(probe) as usize;
    handles.region.contains(sp)
}

/// Recovers the calling thread's record purely from its stack pointer —
/// `thread_record = sp & thread_id_mask` (spec.md 3, "Invariant (TLS by
/// stack address)"). Must only be called from a thread started via
/// [`spawn`].
#[inline]
pub fn current() -> &'static ThreadRecord {
    let probe: u8 = 0;
    let sp = std::ptr::addr_of!(probe) as usize;
    let slot_base = sp & region().thread_id_mask();
    // SAFETY: every slot in the region starts with a live `ThreadRecord`
    // once `alloc_slot` has run, and `sp` masks down to the slot the
    // calling thread's pinned stack lives in.
    unsafe { &*(slot_base as *const ThreadRecord) }
}

/// Stable identity of the calling thread, used by
/// [`crate::sync::lock::Lock`] for ownership tracking.
#[inline]
pub fn current_id() -> u64 {
    current().id as u64
}

/// Announces that the calling thread is about to enter uncooperative
/// (blocking or native) code: publishes its stack pointer and, if a
/// rendezvous is in flight, joins it immediately. Mirrors
/// `Thread::enterUncooperativeCode` in `ctthread.cpp`.
///
/// A no-op if the runtime hasn't been installed yet (`Runtime::new` not yet
/// called) or the calling thread was never attached via [`spawn`] — `Lock`
/// and `Cond` are usable as plain, non-safepoint-aware primitives before a
/// VM exists or on a thread this crate does not manage. The latter check is
/// load-bearing, not just a convenience: an unmanaged thread's stack pointer
/// masked against `thread_id_mask` would land on an arbitrary, unrelated
/// address, and [`current`] would dereference it as a `ThreadRecord`.
pub fn enter_uncooperative() {
    if !on_managed_stack() {
        return;
    }
    let rec = current();
    if rec.in_rv.load(Ordering::Relaxed) {
        return;
    }
    debug_assert_eq!(rec.last_sp(), 0, "SP already set when entering uncooperative code");
    rec.publish_last_sp(crate::rendezvous::caller_sp());
    if rec.do_yield.load(Ordering::Acquire) {
        rendezvous().join_before_uncooperative(rec);
    }
}

/// Announces that the calling thread has returned to cooperative code.
/// Mirrors `Thread::leaveUncooperativeCode`. See [`enter_uncooperative`] for
/// the no-runtime/unmanaged-thread no-op case.
pub fn leave_uncooperative() {
    if !on_managed_stack() {
        return;
    }
    let rec = current();
    if rec.in_rv.load(Ordering::Relaxed) {
        return;
    }
    debug_assert!(rec.is_uncooperative(), "No last SP when leaving uncooperative code");
    let saved_sp = rec.last_sp();
    rec.clear_last_sp();
    if rec.do_yield.load(Ordering::Acquire) {
        rendezvous().join_after_uncooperative(rec, saved_sp);
    }
}

/// Polls for an in-flight rendezvous, joining it if one is active. Call
/// sites are the JIT-emitted safepoint checks this crate's embedder wires
/// into loop back-edges and method prologues (spec.md 4.F).
pub fn safepoint_poll() {
    let rec = current();
    if rec.do_yield.load(Ordering::Acquire) {
        rendezvous().join(rec);
    }
}

/// Pushes `frame` onto the calling thread's known-frame bridge list.
///
/// A bridge across an opaque native region is two markers pushed back to
/// back, mirroring `Thread::startUnknownFrame`/`Thread::startKnownFrame` in
/// `ctthread.cpp`: first an "unknown frame" (`current_ip` the real return
/// address the walker should resume scanning at, `current_fp` the fp it
/// belongs to), then a "known frame" with `current_ip == 0` recording the fp
/// the walker will actually be sitting at when it reaches the wall. Both
/// calls use this same function; the marker pair is what makes
/// [`crate::frame::walker::StackWalker::advance_caller`] able to jump the
/// gap instead of dereferencing native stack memory as if it were a
/// disciplined JIT frame.
///
/// # Safety
/// `frame` must remain valid (typically stack-allocated in the caller) for
/// as long as it is linked; callers must pop it with [`end_known_frame`]
/// before it goes out of scope, in reverse order of pushing.
pub unsafe fn start_known_frame(frame: *mut KnownFrame, current_fp: usize, current_ip: usize) {
    let rec = current();
    let previous = rec.last_known_frame.load(Ordering::Acquire);
    (*frame).previous = previous;
    (*frame).current_fp = current_fp;
    (*frame).current_ip = current_ip;
    rec.last_known_frame.store(frame, Ordering::Release);
}

/// Pops the most recently pushed known-frame marker, restoring whatever was
/// linked before it.
///
/// # Safety
/// `frame` must be the same pointer most recently passed to
/// [`start_known_frame`] on this thread (markers nest like the stack).
pub unsafe fn end_known_frame(frame: *mut KnownFrame) {
    let rec = current();
    rec.last_known_frame.store((*frame).previous, Ordering::Release);
}

/// Handle to a spawned thread. Joins the underlying OS thread on
/// [`JoinHandle::join`] (or leaks it if dropped without joining, matching
/// `std::thread::JoinHandle`'s own contract).
pub struct JoinHandle {
    tid: libc::pthread_t,
}

impl JoinHandle {
    /// Blocks until the spawned thread has returned and its slot been
    /// released.
    pub fn join(self) {
        unsafe {
            libc::pthread_join(self.tid, std::ptr::null_mut());
        }
    }
}

/// Spawns a mutator (or service) thread whose OS stack lives inside a
/// region slot carved from the process-wide [`allocator::StackRegion`].
///
/// Grounded in `vm/scheduler/worker.rs`'s named-thread idiom, generalized
/// to pin the new thread's stack to a fixed address via
/// `pthread_attr_setstack` (`Thread::start` in `ctthread.cpp`) — `current`'s
/// stack-pointer mask depends on this placement, which
/// `std::thread::Builder` has no stable way to request.
pub fn spawn<F>(name: impl Into<String>, role: ThreadRole, f: F) -> JoinHandle
where
    F: FnOnce() + Send + 'static,
{
    let name = name.into();
    let (record_ptr, base_sp, slot_idx) = match region().alloc_slot() {
        Ok(v) => v,
        Err(e) => crate::fatal!("{e}"),
    };

    let tid = unsafe {
        unix::spawn_pinned(record_ptr, base_sp, slot_idx, role, region(), registry().clone(), name, f)
    };
    JoinHandle { tid }
}

fn run_on_slot<F>(
    record_ptr: *mut ThreadRecord,
    base_sp: usize,
    slot_idx: usize,
    role: ThreadRole,
    registry: &Arc<ThreadRegistry>,
    region: &'static StackRegion,
    name: String,
    f: F,
) where
    F: FnOnce(),
{
    let id = slot_idx;
    unsafe { ThreadRecord::init(record_ptr, id, role) };
    let rec = unsafe { &*record_ptr };
    rec.base_sp.store(base_sp, Ordering::Release);

    #[cfg(debug_assertions)]
    eprintln!("vmkit: thread '{name}' attached on slot {slot_idx}");
    #[cfg(not(debug_assertions))]
    let _ = name;

    registry.register(rec);
    f();
    registry.unregister(rec);

    rec.alive.store(false, Ordering::Release);
    region.free_slot(slot_idx);
}

/// Exact translation of `Thread::start`/`Thread::internalThreadStart`: a
/// `pthread_create` whose attributes pin the new thread's stack to a region
/// slot, so `current()`'s stack-pointer mask always resolves.
mod unix {
    use super::*;
    use std::ffi::c_void;

    struct SpawnArgs<F: FnOnce()> {
        record_ptr: *mut ThreadRecord,
        base_sp: usize,
        slot_idx: usize,
        role: ThreadRole,
        registry: Arc<ThreadRegistry>,
        region: &'static StackRegion,
        name: String,
        f: Option<F>,
    }

    extern "C" fn trampoline<F: FnOnce()>(arg: *mut c_void) -> *mut c_void {
        let mut args: Box<SpawnArgs<F>> = unsafe { Box::from_raw(arg as *mut SpawnArgs<F>) };
        let f = args.f.take().expect("trampoline invoked twice");
        crate::signal::install_handlers_on_current_thread(args.region, args.record_ptr as usize);
        super::run_on_slot(
            args.record_ptr,
            args.base_sp,
            args.slot_idx,
            args.role,
            &args.registry,
            args.region,
            std::mem::take(&mut args.name),
            f,
        );
        std::ptr::null_mut()
    }

    /// Spawns `f` on a pthread whose stack is the given region slot.
    ///
    /// # Safety
    /// Must be called with a slot freshly obtained from
    /// `StackRegion::alloc_slot`, not yet handed to any other thread.
    pub unsafe fn spawn_pinned<F>(
        record_ptr: *mut ThreadRecord,
        base_sp: usize,
        slot_idx: usize,
        role: ThreadRole,
        region: &'static StackRegion,
        registry: Arc<ThreadRegistry>,
        name: String,
        f: F,
    ) -> libc::pthread_t
    where
        F: FnOnce() + Send + 'static,
    {
        let args = Box::new(SpawnArgs {
            record_ptr,
            base_sp,
            slot_idx,
            role,
            registry,
            region,
            name,
            f: Some(f),
        });

        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        libc::pthread_attr_init(&mut attr);
        let stack_size = base_sp - (record_ptr as usize);
        if libc::pthread_attr_setstack(&mut attr, record_ptr as *mut c_void, stack_size) != 0 {
            crate::fatal!("pthread_attr_setstack failed");
        }

        let mut tid: libc::pthread_t = std::mem::zeroed();
        let res = libc::pthread_create(&mut tid, &attr, trampoline::<F>, Box::into_raw(args) as *mut c_void);
        libc::pthread_attr_destroy(&mut attr);
        if res != 0 {
            crate::fatal!("pthread_create failed with errno {res}");
        }
        tid
    }
}

/// Shared test-only bootstrap, used by this module's own tests and by
/// `sync::lock`/`sync::cond`'s tests, which need a fully installed runtime
/// to exercise the safepoint-cooperation hooks (`enter_uncooperative`/
/// `leave_uncooperative`) that real `Lock`/`Cond` usage goes through.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) fn ensure_installed() {
        if HANDLES.get().is_none() {
            let region = StackRegion::reserve(16, 1 << 20);
            let registry = Arc::new(ThreadRegistry::new());
            install(region, registry);
        }
    }
}
