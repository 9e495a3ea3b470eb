//! Object header & virtual table layout (spec.md 3, 4.I).
//!
//! The only contract this crate imposes on a managed object's layout: its
//! first word is a pointer to a [`VTable`], whose first three words are the
//! destructor, operator-delete, and tracer entry points. Everything past
//! that is opaque to `vmkit-core` — the hosted language is free to extend
//! the layout with its own class/method-table fields.

use std::ptr::NonNull;

/// The GC-visible "closure" threaded through a trace/scan call: opaque state
/// owned by the collector for one traversal (spec.md 4.J).
pub type Closure = usize;

/// A virtual table. Every managed object's first word points at one of
/// these (spec.md 3, "Object header").
#[repr(C)]
pub struct VTable {
    /// Called by the finalizer thread for an object with a non-empty
    /// destructor (spec.md 4.H, finalizer thread loop).
    pub destructor: unsafe extern "C" fn(ObjectRef),
    /// Called to release any native resources the object owns beyond the
    /// GC-managed bytes themselves.
    pub operator_delete: unsafe extern "C" fn(ObjectRef),
    /// Called by the stack/heap scanner to report every outgoing reference
    /// this object holds, via repeated calls to `scan_object` on the active
    /// [`crate::plan::GcPlan`].
    pub tracer: unsafe extern "C" fn(ObjectRef, Closure),
}

unsafe extern "C" fn noop_destructor(_obj: ObjectRef) {}

/// Sentinel destructor entry marking "no destructor": an object whose
/// vtable's `destructor` pointer equals this is never registered as a
/// finalization candidate (spec.md 3, "A distinguished `empty_destructor`
/// address marks the 'no destructor' case").
pub const EMPTY_DESTRUCTOR: unsafe extern "C" fn(ObjectRef) = noop_destructor;

/// A non-null pointer to a managed object's first word. Cheap to copy,
/// opaque beyond the vtable-pointer contract above.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObjectRef(NonNull<u8>);

// An `ObjectRef` has no thread affinity of its own — it is a plain address
// into GC-managed memory, read and written by whichever thread currently
// holds it (the collector, a reference queue, a mutator). Same pattern as
// `thread::registry::ThreadHandle`.
unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    /// Wraps a raw pointer to a live managed object.
    ///
    /// # Safety
    /// `ptr` must be non-null and point at an object whose first word is a
    /// valid `*const VTable`.
    #[inline]
    pub unsafe fn from_raw(ptr: *mut u8) -> Self {
        debug_assert!(!ptr.is_null());
        ObjectRef(NonNull::new_unchecked(ptr))
    }

    /// The raw address of this object.
    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Reads this object's vtable pointer (the first word of the object).
    ///
    /// # Safety
    /// The object must still be live and its first word must genuinely be
    /// a vtable pointer (true for anything allocated through
    /// [`crate::plan::GcPlan::mutator_allocate`]).
    #[inline]
    pub unsafe fn vtable(self) -> *const VTable {
        *(self.as_ptr() as *const *const VTable)
    }

    /// True if this object's vtable declares a real destructor (spec.md
    /// 4.H: objects without one are never finalization candidates).
    ///
    /// # Safety
    /// Same obligations as [`ObjectRef::vtable`].
    #[inline]
    pub unsafe fn has_destructor(self) -> bool {
        let vt = &*self.vtable();
        !std::ptr::eq(vt.destructor as *const (), EMPTY_DESTRUCTOR as *const ())
    }

    /// Reads the reference stored at a byte offset from this object's
    /// base — used by barrier entry points and reference-queue processing
    /// to get at a field without the caller needing its own pointer
    /// arithmetic.
    ///
    /// # Safety
    /// `offset` must fall within the object and the word there must
    /// currently hold either a null pattern or a valid `ObjectRef`.
    #[inline]
    pub unsafe fn read_field(self, offset: usize) -> Option<ObjectRef> {
        let slot = self.as_ptr().add(offset) as *const usize;
        let raw = *slot;
        if raw == 0 {
            None
        } else {
            Some(ObjectRef::from_raw(raw as *mut u8))
        }
    }

    /// Writes (or clears, for `None`) the reference stored at a byte
    /// offset from this object's base.
    ///
    /// # Safety
    /// Same obligations as [`ObjectRef::read_field`]; the caller is
    /// responsible for any write-barrier bookkeeping (spec.md 4.I) —
    /// this performs the raw store only.
    #[inline]
    pub unsafe fn write_field(self, offset: usize, value: Option<ObjectRef>) {
        let slot = self.as_ptr().add(offset) as *mut usize;
        *slot = value.map_or(0, |v| v.as_ptr() as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn real_destructor(_obj: ObjectRef) {}

    fn vtable_with(destructor: unsafe extern "C" fn(ObjectRef)) -> VTable {
        VTable {
            destructor,
            operator_delete: noop_destructor,
            tracer: noop_destructor,
        }
    }

    #[test]
    fn empty_destructor_is_recognized() {
        let vt_empty = vtable_with(EMPTY_DESTRUCTOR);
        let vt_real = vtable_with(real_destructor);

        let mut storage_empty: [usize; 2] = [0; 2];
        storage_empty[0] = &vt_empty as *const VTable as usize;
        let obj_empty = unsafe { ObjectRef::from_raw(storage_empty.as_mut_ptr() as *mut u8) };
        assert!(!unsafe { obj_empty.has_destructor() });

        let mut storage_real: [usize; 2] = [0; 2];
        storage_real[0] = &vt_real as *const VTable as usize;
        let obj_real = unsafe { ObjectRef::from_raw(storage_real.as_mut_ptr() as *mut u8) };
        assert!(unsafe { obj_real.has_destructor() });
    }

    #[test]
    fn field_read_write_round_trips() {
        let vt = vtable_with(EMPTY_DESTRUCTOR);
        let mut storage: [usize; 3] = [0; 3];
        storage[0] = &vt as *const VTable as usize;
        let obj = unsafe { ObjectRef::from_raw(storage.as_mut_ptr() as *mut u8) };

        assert_eq!(unsafe { obj.read_field(8) }, None);

        let mut referent_storage: [usize; 1] = [0];
        referent_storage[0] = &vt as *const VTable as usize;
        let referent = unsafe { ObjectRef::from_raw(referent_storage.as_mut_ptr() as *mut u8) };

        unsafe { obj.write_field(8, Some(referent)) };
        assert_eq!(unsafe { obj.read_field(8) }, Some(referent));

        unsafe { obj.write_field(8, None) };
        assert_eq!(unsafe { obj.read_field(8) }, None);
    }
}
