//! Recoverable error types.
//!
//! Fatal VM bugs (spec.md 7: SEGV outside any registered frame, SEGV while
//! already in a rendezvous, thread-slot exhaustion) are not represented
//! here — they go through [`crate::fatal`] and abort the process directly,
//! since nothing upstream could meaningfully recover from them.

use std::fmt;

/// Errors a mutator or the collector can recover from.
#[derive(Debug, thiserror::Error)]
pub enum VmkitError {
    /// A managed null-pointer dereference, rewritten from a SIGSEGV by the
    /// signal bridge (spec.md 4.G). Carries the original faulting IP so the
    /// hosted language can attach a backtrace.
    #[error("null pointer dereference at ip {ip:#x}")]
    NullPointer {
        /// Program counter of the faulting instruction.
        ip: usize,
    },

    /// A managed stack overflow, rewritten from a SIGSEGV on the guard page.
    #[error("stack overflow at ip {ip:#x}")]
    StackOverflow {
        /// Program counter of the faulting instruction.
        ip: usize,
    },

    /// A growable queue (reference queue, finalization queue, to-enqueue
    /// buffer) could not grow because the backing allocation failed.
    ///
    /// spec.md 7 notes the original VMKit aborts here; this is the
    /// acknowledged fix: surface it as a recoverable condition instead.
    #[error("out of memory growing {queue}")]
    Oom {
        /// Name of the queue that failed to grow, for diagnostics.
        queue: &'static str,
    },

    /// A finalizer or reference-enqueue callback panicked. Per spec.md 7,
    /// these are caught and discarded (logged, not propagated) so one
    /// broken finalizer cannot wedge the finalizer thread.
    #[error("finalizer for object panicked: {message}")]
    FinalizerPanic {
        /// Panic payload, downcast to a string where possible.
        message: String,
    },
}

/// Result of a condition-variable wait that may time out (spec.md 4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Woken by a `signal`/`broadcast` before the deadline.
    Notified,
    /// Deadline elapsed before any notification arrived.
    Timeout,
}

impl WaitResult {
    /// True if the wait ended due to the deadline rather than a notify.
    pub fn timed_out(self) -> bool {
        matches!(self, WaitResult::Timeout)
    }
}

impl fmt::Display for WaitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitResult::Notified => write!(f, "notified"),
            WaitResult::Timeout => write!(f, "timeout"),
        }
    }
}

/// Abort the process after printing a diagnostic, for conditions spec.md 7
/// classifies as a VM bug rather than a recoverable error. Mirrors the
/// original VMKit's `fprintf(stderr, ...); abort();` idiom at fault sites.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        eprintln!("vmkit: fatal: {}", format!($($arg)*));
        std::process::abort();
    }};
}
