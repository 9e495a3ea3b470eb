//! Signal → exception bridge (spec.md 4.G).
//!
//! Translated from `lib/vmkit/CommonThread/Sigsegv.cpp` and the
//! `Thread::internalThreadStart` alternate-stack/`sigaction` setup in
//! `ctthread.cpp`. A `SIGSEGV`/`SIGBUS` landing on the guard page is a
//! stack overflow; any other address is treated as a null-pointer fault.
//! Either way the handler rewrites the saved program counter so the kernel
//! resumes execution inside a trampoline — `ThrowStackOverflowError`/
//! `ThrowNullPointerException` — rather than back at the faulting
//! instruction, turning a hardware trap into a normal language-level
//! exception throw.

pub mod context;

use crate::frame::FrameRegistry;
use crate::thread::allocator::StackRegion;
use once_cell::sync::OnceCell;
use std::ffi::c_void;
use std::sync::Arc;

/// Embedder hook invoked once a trapping address has been classified and
/// matched against a registered managed frame. Implementations perform
/// whatever the hosted language's exception-unwind mechanism is; per
/// spec.md 1 ("Non-goals: defining the bytecode semantics of any hosted
/// language") this crate does not implement that mechanism itself.
pub trait ExceptionHost: Send + Sync {
    /// A managed null-pointer dereference at `ip`. Never returns: the host
    /// unwinds through the thread's exception-buffer chain.
    fn null_pointer_exception(&self, ip: usize) -> !;
    /// A managed stack overflow at `ip`. Never returns.
    fn stack_overflow_error(&self, ip: usize) -> !;
}

static FRAME_REGISTRY: OnceCell<Arc<FrameRegistry>> = OnceCell::new();
static EXCEPTION_HOST: OnceCell<Box<dyn ExceptionHost>> = OnceCell::new();

/// Wires up the process-wide frame registry and exception host. Called
/// once by [`crate::runtime::Runtime::new`], before any thread installs
/// its handlers.
pub(crate) fn install(registry: Arc<FrameRegistry>, host: Box<dyn ExceptionHost>) {
    FRAME_REGISTRY
        .set(registry)
        .unwrap_or_else(|_| crate::fatal!("signal bridge installed twice"));
    EXCEPTION_HOST
        .set(host)
        .unwrap_or_else(|_| crate::fatal!("signal bridge installed twice"));
}

fn frame_registry() -> &'static FrameRegistry {
    FRAME_REGISTRY.get().expect("signal bridge not initialized: call Runtime::new first")
}

fn exception_host() -> &'static dyn ExceptionHost {
    EXCEPTION_HOST
        .get()
        .expect("signal bridge not initialized: call Runtime::new first")
        .as_ref()
}

/// Installs the alternate signal stack and `SIGSEGV`/`SIGBUS` handlers for
/// the calling thread. Called from the thread trampoline
/// (`thread::unix::trampoline`) immediately after the OS thread starts,
/// mirroring `Thread::internalThreadStart`'s `sigaltstack`/`sigaction`
/// pair. `slot_base` is the calling thread's region-slot base address
/// (`sp & thread_id_mask`).
pub fn install_handlers_on_current_thread(region: &StackRegion, slot_base: usize) {
    #[cfg(unix)]
    unsafe {
        let (alt_sp, alt_len) = region.alt_stack_for(slot_base);
        let st = libc::stack_t {
            ss_sp: alt_sp,
            ss_flags: 0,
            ss_size: alt_len,
        };
        if libc::sigaltstack(&st, std::ptr::null_mut()) != 0 {
            crate::fatal!("sigaltstack failed");
        }

        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        sa.sa_sigaction = sigsegv_handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(libc::SIGSEGV, &sa, std::ptr::null_mut()) != 0 {
            crate::fatal!("sigaction(SIGSEGV) failed");
        }
        if libc::sigaction(libc::SIGBUS, &sa, std::ptr::null_mut()) != 0 {
            crate::fatal!("sigaction(SIGBUS) failed");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (region, slot_base);
    }
}

/// The installed `SA_SIGINFO` handler for `SIGSEGV`/`SIGBUS`. Runs on the
/// faulting thread's alternate stack.
extern "C" fn sigsegv_handler(_signum: i32, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    let rec = crate::thread::current();
    if rec.in_rv.load(std::sync::atomic::Ordering::Acquire) {
        eprintln!(
            "vmkit: SIGSEGV while thread {} was already handling a rendezvous \
             (double fault). Aborting...",
            rec.id
        );
        std::process::abort();
    }
    let fault_addr = unsafe { (*info).si_addr() as usize };
    // `rec` sits at the base of its own slot, so this is the calling
    // thread's slot base regardless of which slot `fault_addr` falls in.
    let slot_base = rec as *const _ as usize;

    let (guard_start, guard_end) = crate::thread::region().guard_page_range(slot_base);
    let is_stack_overflow = fault_addr >= guard_start && fault_addr < guard_end;

    let ip = unsafe { context::fault_pc(ctx) };

    if is_stack_overflow {
        if context::SUPPORTED {
            unsafe { context::rewrite_for_stack_overflow(ctx, throw_stack_overflow_error as usize, ip) };
        } else {
            eprintln!(
                "vmkit: stack overflow in VM code or native code. The bottom of the \
                 stack must always be available when entering managed code; this is a \
                 VM bug, not a recoverable condition. Aborting..."
            );
            std::process::abort();
        }
    } else if context::SUPPORTED {
        unsafe { context::rewrite_for_npe(ctx, throw_null_pointer_exception as usize, ip) };
    } else {
        eprintln!(
            "vmkit: thread received a SIGSEGV: either the VM code or an external \
             native method is bogus. Aborting..."
        );
        std::process::abort();
    }
}

/// Resumption target spliced in for a stack-overflow fault (spec.md 4.G,
/// 6). Looks up `ip` in the frame registry: an unmanaged frame means the
/// fault came from VM-internal or foreign native code, which is a VM bug;
/// a managed frame hands off to the embedder's exception host.
extern "C" fn throw_stack_overflow_error(ip: usize) {
    let info = frame_registry().lookup(ip);
    if !info.is_managed() {
        eprintln!(
            "vmkit: thread received a SIGSEGV at ip {ip:#x}: either the VM code or an \
             external native method is bogus. Aborting..."
        );
        std::process::abort();
    }
    exception_host().stack_overflow_error(ip);
}

/// Resumption target spliced in for a non-stack-overflow fault (spec.md
/// 4.G, 6). Same frame-info gate as [`throw_stack_overflow_error`].
extern "C" fn throw_null_pointer_exception(ip: usize) {
    let info = frame_registry().lookup(ip);
    if !info.is_managed() {
        eprintln!(
            "vmkit: thread received a SIGSEGV at ip {ip:#x}: either the VM code or an \
             external native method is bogus. Aborting..."
        );
        std::process::abort();
    }
    exception_host().null_pointer_exception(ip);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::registry::FrameInfo;

    #[test]
    fn unmanaged_frame_fails_the_abort_gate() {
        // `throw_stack_overflow_error`/`throw_null_pointer_exception` abort
        // rather than call into the exception host when the faulting ip
        // has no registered managed frame; this is the condition they
        // check before doing so.
        let registry = Arc::new(FrameRegistry::new());
        registry.register_one(
            0x1000,
            FrameInfo {
                frame_size: 16,
                live_offsets: Arc::from([]),
                metadata: Some(Arc::from("m")),
            },
        );
        assert!(registry.lookup(0x1000).is_managed());
        assert!(!registry.lookup(0x2000).is_managed());
    }
}
