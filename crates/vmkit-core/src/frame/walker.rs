//! Stack walker (spec.md 4.E).
//!
//! A cursor over a thread's call frames, walking the saved-frame-pointer
//! chain. Frame pointers and return addresses are read directly off the
//! stack (`[fp]` holds the caller's fp, `[fp + WORD_SIZE]` holds the return
//! address — the standard x86_64/aarch64 frame-pointer ABI), honoring the
//! thread's known-frame bridge list (spec.md 3) to skip over regions with
//! no registered frame info.

use crate::frame::registry::{FrameInfo, FrameRegistry};
use crate::sys::WORD_SIZE;
use crate::thread::record::{KnownFrame, ThreadRecord};

/// A cursor positioned at one call frame of a thread's stack.
pub struct StackWalker<'a> {
    registry: &'a FrameRegistry,
    thread: &'a ThreadRecord,
    current_fp: usize,
    /// Walk stops once `current_fp == base_sp`.
    base_sp: usize,
    /// Head of the thread's known-frame list at construction time, used to
    /// bridge opaque native regions.
    known_frame: *const KnownFrame,
}

impl<'a> StackWalker<'a> {
    /// Begins walking the *calling* thread's own stack, starting at
    /// `starting_fp` (the caller's frame pointer, typically obtained from a
    /// compiler builtin at the call site).
    pub fn for_self(registry: &'a FrameRegistry, thread: &'a ThreadRecord, starting_fp: usize) -> Self {
        StackWalker {
            registry,
            thread,
            current_fp: starting_fp,
            base_sp: thread.base_sp.load(std::sync::atomic::Ordering::Acquire),
            known_frame: thread.last_known_frame.load(std::sync::atomic::Ordering::Acquire),
        }
    }

    /// Begins walking another (parked) thread's stack, starting at its
    /// published `last_sp`. The caller must have already ensured the
    /// target is actually parked — e.g. via
    /// [`crate::rendezvous::wait_on_sp`].
    pub fn for_parked(registry: &'a FrameRegistry, thread: &'a ThreadRecord) -> Self {
        let sp = thread.last_sp();
        debug_assert_ne!(sp, 0, "target thread is not parked");
        StackWalker {
            registry,
            thread,
            current_fp: sp,
            base_sp: thread.base_sp.load(std::sync::atomic::Ordering::Acquire),
            known_frame: thread.last_known_frame.load(std::sync::atomic::Ordering::Acquire),
        }
    }

    /// True once the cursor has walked off the top of the stack.
    #[inline]
    pub fn done(&self) -> bool {
        self.current_fp == self.base_sp || self.current_fp == 0
    }

    /// Return address of the current frame.
    #[inline]
    pub fn return_address(&self) -> usize {
        debug_assert!(!self.done());
        unsafe { *((self.current_fp + WORD_SIZE) as *const usize) }
    }

    /// The frame-info record for the current frame's return address.
    /// Returns [`FrameInfo::empty`] if this frame has no registered info
    /// (e.g. a native frame under a known-frame bridge).
    pub fn current(&self) -> FrameInfo {
        if self.done() {
            return FrameInfo::empty();
        }
        self.registry.lookup(self.return_address())
    }

    /// The raw frame pointer the cursor is positioned at.
    #[inline]
    pub fn current_fp(&self) -> usize {
        self.current_fp
    }

    fn saved_fp(&self) -> usize {
        unsafe { *(self.current_fp as *const usize) }
    }

    /// Climbs to the caller's frame, following the known-frame bridge list
    /// across any opaque native region.
    ///
    /// A bridge is a pair of markers pushed back to back: an "unknown
    /// frame" recording the real frame pointer/return address to resume at
    /// (`current_ip != 0`), immediately followed by a "known frame" with
    /// `current_ip == 0` recording the fp the walker will naturally arrive
    /// at once it reaches the bridge point. When the cursor sits exactly at
    /// that fp, both markers are consumed in one step and `current_fp` jumps
    /// straight to the unknown frame's recorded fp, instead of dereferencing
    /// `[current_fp]` as if it were a disciplined JIT frame.
    pub fn advance_caller(&mut self) {
        if self.done() {
            return;
        }
        if !self.known_frame.is_null() {
            let head = unsafe { &*self.known_frame };
            if head.current_fp == self.current_fp {
                debug_assert_eq!(head.current_ip, 0, "known-frame head must be a bridging marker");
                let unknown_ptr = head.previous;
                debug_assert!(!unknown_ptr.is_null(), "bridging marker with no paired unknown frame");
                let unknown = unsafe { &*unknown_ptr };
                debug_assert_ne!(unknown.current_ip, 0, "paired marker must carry a real return address");
                self.current_fp = unknown.current_fp;
                self.known_frame = unknown.previous;
                return;
            }
        }
        self.current_fp = self.saved_fp();
    }

    /// As [`StackWalker::advance_caller`], but skips any frame with no
    /// language metadata (native frames), stopping at the next
    /// JIT-compiled managed frame or the stack base.
    pub fn advance_caller_metadata_only(&mut self) {
        loop {
            self.advance_caller();
            if self.done() || self.current().is_managed() {
                return;
            }
        }
    }

    /// Descends to the callee frame. Unlike `advance_caller`, this cannot
    /// be done incrementally from an arbitrary position — it rescans from
    /// the thread's base. Acceptable per spec.md 4.E: used rarely, for
    /// debugging/backtrace tools that walk in both directions.
    pub fn advance_callee(&mut self, thread: &'a ThreadRecord, starting_fp: usize) {
        let mut cursor = StackWalker::for_self(self.registry, thread, starting_fp);
        while !cursor.done() && cursor.saved_fp() != self.current_fp {
            cursor.advance_caller();
        }
        self.current_fp = cursor.current_fp;
    }

    /// Rewrites the return-address slot of the current frame, returning
    /// the value it held before. Used by the signal bridge to splice a
    /// synthetic exception-throwing frame in place of the faulting one
    /// (spec.md 4.G).
    ///
    /// # Safety
    /// The caller must ensure nothing else is concurrently reading or
    /// unwinding this frame (true for the thread rewriting its own
    /// just-faulted frame from a signal handler).
    pub unsafe fn update_return_address(&mut self, new: usize) -> usize {
        let slot = (self.current_fp + WORD_SIZE) as *mut usize;
        let old = *slot;
        *slot = new;
        old
    }

    /// Rewrites the saved frame-pointer slot of the current frame.
    ///
    /// # Safety
    /// Same caller obligations as [`StackWalker::update_return_address`].
    pub unsafe fn update_caller_frame(&mut self, new: usize) -> usize {
        let slot = self.current_fp as *mut usize;
        let old = *slot;
        *slot = new;
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::record::ThreadRole;
    use std::mem::MaybeUninit;
    use std::sync::atomic::Ordering;

    fn fresh_thread() -> Box<MaybeUninit<ThreadRecord>> {
        let mut slot: Box<MaybeUninit<ThreadRecord>> = Box::new(MaybeUninit::zeroed());
        unsafe { ThreadRecord::init(slot.as_mut_ptr(), 0, ThreadRole::Mutator) };
        slot
    }

    /// Builds a synthetic two-frame stack: `[ret_addr][saved_fp]` chains,
    /// laid out in a `Vec<usize>` acting as fabricated stack memory.
    fn build_fake_stack() -> (Vec<usize>, usize, usize) {
        // layout (low to high address), two word-pairs:
        // idx0: saved_fp (0, i.e. stack base) | idx1: return_address (0x2000)
        // idx2: saved_fp (&buf[0])            | idx3: return_address (0x1000)
        let mut buf = vec![0usize; 4];
        let base = buf.as_mut_ptr() as usize;
        buf[0] = 0; // frame0's saved fp == base_sp sentinel
        buf[1] = 0x2000;
        buf[2] = base; // frame1's saved fp points back to frame0
        buf[3] = 0x1000;
        let frame1_fp = base + 2 * WORD_SIZE;
        (buf, base, frame1_fp)
    }

    #[test]
    fn walks_caller_chain_to_base() {
        let registry = FrameRegistry::new();
        registry.register_one(
            0x1000,
            crate::frame::registry::FrameInfo {
                frame_size: 32,
                live_offsets: std::sync::Arc::from([0i16]),
                metadata: Some(std::sync::Arc::from("frame1")),
            },
        );
        registry.register_one(
            0x2000,
            crate::frame::registry::FrameInfo {
                frame_size: 16,
                live_offsets: std::sync::Arc::from([]),
                metadata: Some(std::sync::Arc::from("frame0")),
            },
        );

        let (_buf, base, frame1_fp) = build_fake_stack();
        let thread_slot = fresh_thread();
        let thread = unsafe { &*thread_slot.as_ptr() };
        thread.base_sp.store(base, Ordering::Release);

        let mut walker = StackWalker::for_self(®istry, thread, frame1_fp);
        assert!(!walker.done());
        assert_eq!(walker.return_address(), 0x1000);

        walker.advance_caller();
        assert!(!walker.done());
        assert_eq!(walker.return_address(), 0x2000);

        walker.advance_caller();
        assert!(walker.done());
    }

    /// A known-frame pair bridges an opaque native region: the walker must
    /// jump straight from the marker's recorded fp to the paired unknown
    /// frame's fp without ever dereferencing the bridge frame's own saved-fp
    /// slot (laid out here as unreadable garbage to prove it).
    #[test]
    fn bridges_opaque_native_region_via_known_frame_pair() {
        let registry = FrameRegistry::new();
        registry.register_one(
            0x1000,
            crate::frame::registry::FrameInfo {
                frame_size: 16,
                live_offsets: std::sync::Arc::from([]),
                metadata: Some(std::sync::Arc::from("managed_leaf")),
            },
        );
        registry.register_one(
            0x4000,
            crate::frame::registry::FrameInfo {
                frame_size: 16,
                live_offsets: std::sync::Arc::from([]),
                metadata: Some(std::sync::Arc::from("managed_resume")),
            },
        );

        // idx0: saved_fp = 0 (stack base)  | idx1: ret = 0x5000 (never read)
        // idx2: saved_fp = base            | idx3: ret = 0x4000 (resume frame)
        // idx4: garbage (never read)       | idx5: ret = 0x1000 (bridge frame)
        let mut buf = vec![0usize; 6];
        let base = buf.as_mut_ptr() as usize;
        buf[0] = 0;
        buf[1] = 0x5000;
        buf[2] = base;
        buf[3] = 0x4000;
        buf[4] = 0xdead_beef;
        buf[5] = 0x1000;
        let resume_fp = base + 2 * WORD_SIZE;
        let bridge_fp = base + 4 * WORD_SIZE;

        let mut unknown = KnownFrame {
            previous: std::ptr::null_mut(),
            current_fp: resume_fp,
            current_ip: 0x4000,
        };
        let known = KnownFrame {
            previous: &mut unknown as *mut KnownFrame,
            current_fp: bridge_fp,
            current_ip: 0,
        };

        let thread_slot = fresh_thread();
        let thread = unsafe { &*thread_slot.as_ptr() };
        thread.base_sp.store(base, Ordering::Release);
        thread
            .last_known_frame
            .store(&known as *const KnownFrame as *mut KnownFrame, Ordering::Release);

        let mut walker = StackWalker::for_self(®istry, thread, bridge_fp);
        assert!(!walker.done());
        assert_eq!(walker.return_address(), 0x1000);
        assert_eq!(walker.current().metadata.as_deref(), Some("managed_leaf"));

        walker.advance_caller();
        assert!(!walker.done());
        assert_eq!(walker.current_fp(), resume_fp);
        assert_eq!(walker.return_address(), 0x4000);
        assert_eq!(walker.current().metadata.as_deref(), Some("managed_resume"));

        walker.advance_caller();
        assert!(walker.done());
    }
}
