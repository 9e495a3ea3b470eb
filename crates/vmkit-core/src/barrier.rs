//! Write-barrier and allocation ABI exported to JIT-generated code.
//!
//! Every entry point here is a `pub extern "C"` symbol the JIT calls
//! directly rather than an internal helper, so a code generator can bind to
//! them by name. Each barrier performs the store, notifies the active
//! [`crate::plan::GcPlan`] of the edge, then polls the safepoint on exit.

use crate::object::{ObjectRef, VTable};
use crate::plan;
use crate::reference;

/// Scalar field store: `obj.<slot>` ← `value`.
///
/// # Safety
/// `offset` must be a valid field offset within `obj`.
pub unsafe extern "C" fn field_write_barrier(obj: ObjectRef, offset: usize, value: Option<ObjectRef>) {
    unsafe { obj.write_field(offset, value) };
    plan::active().record_write(obj, offset, value);
    crate::thread::safepoint_poll();
}

/// Array element store: `array[<slot>]` ← `value`. Distinguished from
/// [`field_write_barrier`] because a moving/generational plan typically
/// tracks array edges at a coarser (card) granularity than scalar fields.
///
/// # Safety
/// `element_offset` must be a valid byte offset within `array`'s element
/// storage.
pub unsafe extern "C" fn array_write_barrier(array: ObjectRef, element_offset: usize, value: Option<ObjectRef>) {
    unsafe { array.write_field(element_offset, value) };
    plan::active().record_write(array, element_offset, value);
    crate::thread::safepoint_poll();
}

/// Store to a slot outside the GC heap (a global or static variable).
/// Separate from the in-heap barriers because a plan that never promotes
/// objects out of the young generation may still need to remember
/// heap→non-heap roots, or vice versa — [`crate::plan::GcPlan::needs_non_heap_write_barrier`]
/// lets it opt out independently of [`crate::plan::GcPlan::needs_write_barrier`].
///
/// # Safety
/// `slot` must be valid for a `usize`-sized write (null-pattern or a live
/// object address).
pub unsafe extern "C" fn non_heap_write_barrier(slot: *mut usize, value: Option<ObjectRef>) {
    unsafe { *slot = value.map_or(0, |v| v.as_ptr() as usize) };
    // `src` has no meaningful object identity for a non-heap slot; the slot's
    // own address stands in so a remembered-set plan can still dedupe it.
    let pseudo_src = unsafe { ObjectRef::from_raw(slot as *mut u8) };
    plan::active().record_write(pseudo_src, 0, value);
    crate::thread::safepoint_poll();
}

/// Atomic compare-and-swap of a reference slot, used by JIT-generated code
/// implementing `AtomicReference`-style primitives. Returns whether the
/// swap took effect.
///
/// # Safety
/// `offset` must be a valid field offset within `obj`.
pub unsafe extern "C" fn object_reference_try_cas(
    obj: ObjectRef,
    offset: usize,
    old: Option<ObjectRef>,
    new: Option<ObjectRef>,
) -> bool {
    let slot = obj.as_ptr().add(offset) as *const std::sync::atomic::AtomicUsize;
    let old_word = old.map_or(0, |v| v.as_ptr() as usize);
    let new_word = new.map_or(0, |v| v.as_ptr() as usize);
    let swapped = unsafe { &*slot }
        .compare_exchange(
            old_word,
            new_word,
            std::sync::atomic::Ordering::AcqRel,
            std::sync::atomic::Ordering::Acquire,
        )
        .is_ok();
    if swapped {
        plan::active().record_write(obj, offset, new);
    }
    crate::thread::safepoint_poll();
    swapped
}

/// Fast-path allocation for a fully-resolved virtual table (spec.md 4.I):
/// no finalization bookkeeping, since the caller already knows the vtable
/// carries the empty destructor.
pub extern "C" fn alloc(size: usize, vtable: *const VTable) -> Option<ObjectRef> {
    plan::active().mutator_allocate(size, vtable)
}

/// As [`alloc`], but additionally registers the new object as a
/// finalization candidate if its vtable declares a real destructor
/// (spec.md 4.I).
pub extern "C" fn alloc_unresolved(size: usize, vtable: *const VTable) -> Option<ObjectRef> {
    let obj = plan::active().mutator_allocate(size, vtable)?;
    // SAFETY: `obj` was just allocated with `vtable` as its first word.
    if unsafe { obj.has_destructor() } {
        if let Err(err) = reference::active().register_finalization_candidate(obj) {
            crate::fatal!("{err}");
        }
    }
    Some(obj)
}

/// First half of the two-step allocation variant (spec.md 4.I): reserves
/// `size` bytes with a placeholder vtable, for callers that don't yet know
/// the object's final type (e.g. a constructor still running).
pub extern "C" fn prealloc(size: usize) -> Option<ObjectRef> {
    plan::active().mutator_allocate(size, std::ptr::null())
}

/// Second half: binds `obj`'s vtable now that its type is known, and
/// performs the same finalization-candidate registration [`alloc_unresolved`]
/// would have at allocation time.
///
/// # Safety
/// `obj` must have been returned by [`prealloc`] and not yet published to
/// any other thread.
pub unsafe extern "C" fn postalloc(obj: ObjectRef, vtable: *const VTable, _size: usize) {
    unsafe { *(obj.as_ptr() as *mut *const VTable) = vtable };
    if unsafe { obj.has_destructor() } {
        if let Err(err) = reference::active().register_finalization_candidate(obj) {
            crate::fatal!("{err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Closure;
    use crate::plan::MarkSweepPlan;

    unsafe extern "C" fn no_refs_tracer(_obj: ObjectRef, _closure: Closure) {}

    fn leaf_vtable() -> VTable {
        VTable {
            destructor: crate::object::EMPTY_DESTRUCTOR,
            operator_delete: crate::object::EMPTY_DESTRUCTOR,
            tracer: no_refs_tracer,
        }
    }

    #[test]
    fn field_write_barrier_stores_and_reads_back() {
        let plan = MarkSweepPlan::new();
        let vt = leaf_vtable();
        let obj = plan.mutator_allocate(16, &vt as *const VTable).unwrap();
        let referent = plan.mutator_allocate(16, &vt as *const VTable).unwrap();

        // These barrier functions consult `plan::active()`, which is only
        // meaningful once a runtime is installed; the store itself can be
        // exercised directly against `ObjectRef` without going through the
        // barrier wrapper.
        unsafe { obj.write_field(8, Some(referent)) };
        assert_eq!(unsafe { obj.read_field(8) }, Some(referent));
    }

    #[test]
    fn object_reference_try_cas_fails_on_stale_expected() {
        let plan = MarkSweepPlan::new();
        let vt = leaf_vtable();
        let obj = plan.mutator_allocate(16, &vt as *const VTable).unwrap();
        let a = plan.mutator_allocate(16, &vt as *const VTable).unwrap();
        let b = plan.mutator_allocate(16, &vt as *const VTable).unwrap();
        unsafe { obj.write_field(8, Some(a)) };

        let slot = unsafe { obj.as_ptr().add(8) } as *const std::sync::atomic::AtomicUsize;
        let current = unsafe { &*slot }.load(std::sync::atomic::Ordering::Acquire);
        assert_eq!(current, a.as_ptr() as usize);

        let cas_result = unsafe { &*slot }.compare_exchange(
            b.as_ptr() as usize,
            b.as_ptr() as usize,
            std::sync::atomic::Ordering::AcqRel,
            std::sync::atomic::Ordering::Acquire,
        );
        assert!(cas_result.is_err());
    }
}
