//! System primitives (spec.md 4.A).
//!
//! Page size, word alignment, the thread-id mask, and the capability probes
//! that decide whether the signal bridge (4.G) is wired up or whether the
//! code generator must emit explicit null/overflow checks instead.

/// Default size of one thread's reserved stack+record slot. Must be a power
/// of two: the rendezvous and stack-walker rely on `sp & !(STACK_SIZE - 1)`
/// landing exactly on the slot's base address.
pub const DEFAULT_STACK_SIZE: usize = 1 << 21; // 2 MiB

/// Default number of thread slots reserved at process start.
pub const DEFAULT_THREAD_SLOTS: usize = 1024;

/// Returns the OS page size, queried once and cached.
#[inline]
pub fn page_size() -> usize {
    static PAGE_SIZE: once_cell::sync::OnceCell<usize> = once_cell::sync::OnceCell::new();
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(unix)]
        {
            let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if sz > 0 {
                sz as usize
            } else {
                4096
            }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    })
}

/// Rounds `value` up to the next multiple of `align` (which must be a power
/// of two).
#[inline]
pub fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Rounds `value` down to the previous multiple of `align` (which must be a
/// power of two).
#[inline]
pub fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Size in bytes of one machine word (a GC reference slot).
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Mask applied to a stack pointer to recover the base address of the
/// thread slot (and hence the `ThreadRecord`) it belongs to.
///
/// This is the pillar of signal-safe, OS-TLS-free `current_thread()`
/// lookup (spec.md 3, "Invariant (TLS by stack address)"): every thread
/// record lives in a reserved virtual region sliced into slots of
/// `stack_size` bytes, naturally aligned, so `thread_record = sp & mask`.
#[inline]
pub const fn thread_id_mask(stack_size: usize) -> usize {
    !(stack_size - 1)
}

/// Whether this target can rely on a hardware trap (SIGSEGV on a null
/// dereference) instead of an explicit JIT-emitted null check.
///
/// True exactly for the `(arch, os)` pairs with a context-rewriting module
/// in [`crate::signal::context`] (spec.md 4.G: "initially x86_64-linux,
/// x86_64-macos"). When `false`, the code generator must emit the check
/// itself and call `ThrowNullPointerException` directly as the failure
/// target.
#[inline]
pub const fn supports_hardware_null_check() -> bool {
    cfg!(any(
        all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
        all(target_os = "macos", target_arch = "x86_64"),
    ))
}

/// Whether this target's guard page reliably traps a stack-overflowing
/// store, letting the signal bridge synthesize `StackOverflowError` instead
/// of the code generator emitting an explicit depth check. Same platform
/// set as [`supports_hardware_null_check`].
#[inline]
pub const fn supports_hardware_stack_overflow() -> bool {
    supports_hardware_null_check()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_nonzero_and_a_power_of_two() {
        let sz = page_size();
        assert!(sz > 0);
        assert!(sz.is_power_of_two());
    }

    #[test]
    fn align_up_rounds_to_next_boundary() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
    }

    #[test]
    fn align_down_rounds_to_previous_boundary() {
        assert_eq!(align_down(0, 16), 0);
        assert_eq!(align_down(15, 16), 0);
        assert_eq!(align_down(16, 16), 16);
        assert_eq!(align_down(31, 16), 16);
    }

    #[test]
    fn thread_id_mask_isolates_the_slot_base() {
        let mask = thread_id_mask(DEFAULT_STACK_SIZE);
        let base: usize = 4 * DEFAULT_STACK_SIZE;
        for offset in [0usize, 1, DEFAULT_STACK_SIZE - 1] {
            assert_eq!((base + offset) & mask, base);
        }
    }
}
