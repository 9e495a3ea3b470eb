//! Per-`(arch, os)` signal-context rewriting (spec.md 4.G, 9).
//!
//! Each platform module exposes `fault_pc`/`fault_sp` (read the trapping
//! instruction/stack pointer out of the kernel-supplied `ucontext_t`) and
//! `rewrite_for_npe`/`rewrite_for_stack_overflow`, which redirect execution
//! to a trampoline as if it had been called with the original faulting IP
//! as its first argument — the same "fake call" technique as the original
//! `Sigsegv-linux-x64.inc`, reproduced here instead of `#include`d.

use std::ffi::c_void;

/// True when this build's `(arch, os)` has a context-rewriting module
/// wired in. Mirrors `System::SupportsHardwareNullCheck`/
/// `SupportsHardwareStackOverflow` (spec.md 4.A) — when false, the code
/// generator must emit explicit checks instead of relying on a hardware
/// trap.
pub const SUPPORTED: bool = crate::sys::supports_hardware_null_check();

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod platform {
    use super::c_void;

    pub unsafe fn fault_pc(ctx: *mut c_void) -> usize {
        let ctx = &*(ctx as *const libc::ucontext_t);
        ctx.uc_mcontext.gregs[libc::REG_RIP as usize] as usize
    }

    /// Redirects execution to `target(original_pc)`. `%rdi` carries the
    /// first argument per the SysV ABI; the stack pointer is nudged to an
    /// 8-mod-16 offset so `target`'s prologue sees the alignment it would
    /// have after a real `call`.
    pub unsafe fn rewrite_to_call(ctx: *mut c_void, target: usize, arg0: usize) {
        let ctx = &mut *(ctx as *mut libc::ucontext_t);
        let regs = &mut ctx.uc_mcontext.gregs;
        regs[libc::REG_RIP as usize] = target as i64;
        regs[libc::REG_RDI as usize] = arg0 as i64;
        if regs[libc::REG_RSP as usize] % 16 == 0 {
            regs[libc::REG_RSP as usize] -= 8;
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
mod platform {
    use super::c_void;

    pub unsafe fn fault_pc(ctx: *mut c_void) -> usize {
        let ctx = &*(ctx as *const libc::ucontext_t);
        ctx.uc_mcontext.pc as usize
    }

    /// `x0` carries the first argument per AAPCS64; aarch64 requires no
    /// stack-alignment fixup since the ABI mandates 16-byte alignment at
    /// every instruction boundary, not just at `bl` sites.
    pub unsafe fn rewrite_to_call(ctx: *mut c_void, target: usize, arg0: usize) {
        let ctx = &mut *(ctx as *mut libc::ucontext_t);
        ctx.uc_mcontext.pc = target as u64;
        ctx.uc_mcontext.regs[0] = arg0 as u64;
    }
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
mod platform {
    use super::c_void;

    pub unsafe fn fault_pc(ctx: *mut c_void) -> usize {
        let ctx = &*(ctx as *const libc::ucontext_t);
        (*ctx.uc_mcontext).__ss.__rip as usize
    }

    /// Same "fake call" technique as the Linux x86_64 module, against
    /// Darwin's nested `__darwin_mcontext64`/`__darwin_x86_thread_state64`
    /// layout (`__rip`/`__rdi`/`__rsp` instead of `gregs[...]`).
    pub unsafe fn rewrite_to_call(ctx: *mut c_void, target: usize, arg0: usize) {
        let ctx = &mut *(ctx as *mut libc::ucontext_t);
        (*ctx.uc_mcontext).__ss.__rip = target as u64;
        (*ctx.uc_mcontext).__ss.__rdi = arg0 as u64;
        if (*ctx.uc_mcontext).__ss.__rsp % 16 == 0 {
            (*ctx.uc_mcontext).__ss.__rsp -= 8;
        }
    }
}

#[cfg(not(any(
    all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
    all(target_os = "macos", target_arch = "x86_64"),
)))]
mod platform {
    use super::c_void;

    pub unsafe fn fault_pc(_ctx: *mut c_void) -> usize {
        unreachable!("no context-rewriting module for this target")
    }

    pub unsafe fn rewrite_to_call(_ctx: *mut c_void, _target: usize, _arg0: usize) {
        unreachable!("no context-rewriting module for this target")
    }
}

/// Program counter the signal was delivered at.
///
/// # Safety
/// `ctx` must be the third argument the kernel passed to a `SA_SIGINFO`
/// handler (a valid `ucontext_t*`).
pub unsafe fn fault_pc(ctx: *mut c_void) -> usize {
    platform::fault_pc(ctx)
}

/// Splices a call to `null_pointer trampoline` in place of the faulting
/// instruction, passing the original faulting `ip`.
///
/// # Safety
/// Same obligations as [`fault_pc`].
pub unsafe fn rewrite_for_npe(ctx: *mut c_void, trampoline: usize, ip: usize) {
    platform::rewrite_to_call(ctx, trampoline, ip);
}

/// Splices a call to the stack-overflow trampoline in place of the
/// faulting instruction, passing the original faulting `ip`.
///
/// # Safety
/// Same obligations as [`fault_pc`].
pub unsafe fn rewrite_for_stack_overflow(ctx: *mut c_void, trampoline: usize, ip: usize) {
    platform::rewrite_to_call(ctx, trampoline, ip);
}
