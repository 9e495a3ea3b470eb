//! End-to-end bring-up: `Runtime::new` wiring, concurrent mutator threads
//! allocating and writing through the barrier ABI, and registering a
//! JIT-style frame-info blob (spec.md 2, 4.B, 4.D, 4.I).
//!
//! One [`Runtime`] is built for the whole binary via `Lazy`, same reasoning
//! as `reference_processing_e2e.rs`. This file does not call
//! `Runtime::collect` — doing so would walk every registered thread's native
//! call stack as if it were a JIT frame, which depends on the frame-pointer
//! convention the embedder's own codegen and build flags are responsible
//! for, not something a `cargo test` binary can guarantee. Everything else
//! `Runtime::new` wires up is exercised directly instead.
//!
//! Running just this file: `cargo test --test runtime_bootstrap_e2e`

use once_cell::sync::Lazy;
use std::sync::Arc;

use vmkit_core::object::ObjectRef;
use vmkit_core::plan::MarkSweepPlan;
use vmkit_core::reference::FinalizationHost;
use vmkit_core::runtime::{Runtime, RuntimeConfig};
use vmkit_core::signal::ExceptionHost;
use vmkit_core::thread::record::ThreadRole;

struct NoopExceptionHost;

impl ExceptionHost for NoopExceptionHost {
    fn null_pointer_exception(&self, _ip: usize) -> ! {
        panic!("unexpected null pointer exception in runtime_bootstrap_e2e");
    }
    fn stack_overflow_error(&self, _ip: usize) -> ! {
        panic!("unexpected stack overflow in runtime_bootstrap_e2e");
    }
}

struct NoopFinalizationHost;

impl FinalizationHost for NoopFinalizationHost {
    fn invoke_language_finalizer(&self, _obj: ObjectRef) {}
    fn invoke_enqueue(&self, _ref_obj: ObjectRef) {}
}

static RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    let config = RuntimeConfig::with_hosts(
        Box::new(MarkSweepPlan::new()),
        Box::new(NoopExceptionHost),
        Box::new(NoopFinalizationHost),
    );
    Runtime::new(config)
});

#[test]
fn default_parallelism_is_at_least_one() {
    assert!(Runtime::default_parallelism() >= 1);
}

#[test]
fn concurrent_mutators_allocate_and_write_through_the_barrier_abi() {
    let _runtime = &*RUNTIME;

    const THREADS: usize = 8;
    const OBJECTS_PER_THREAD: usize = 64;

    let seen_ids = Arc::new(std::sync::Mutex::new(std::collections::HashSet::new()));
    let mut handles = Vec::new();

    for t in 0..THREADS {
        let seen_ids = seen_ids.clone();
        let handle = vmkit_core::thread::spawn(format!("mutator-{t}"), ThreadRole::Mutator, move || {
            seen_ids.lock().unwrap().insert(vmkit_core::thread::current_id());

            let vt = leaf_vtable();
            let mut prev: Option<ObjectRef> = None;
            for _ in 0..OBJECTS_PER_THREAD {
                let obj = vmkit_core::barrier::alloc(32, &vt as *const _).expect("allocation failed");
                unsafe {
                    vmkit_core::barrier::field_write_barrier(obj, 8, prev);
                }
                assert_eq!(unsafe { obj.read_field(8) }, prev);
                prev = Some(obj);
            }
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.join();
    }

    // Every mutator thread ran on a distinct, stably-identified slot (spec.md
    // 3, "TLS by stack address").
    assert_eq!(seen_ids.lock().unwrap().len(), THREADS);
}

#[test]
fn frame_registry_accepts_a_packed_blob_from_the_installed_runtime() {
    let runtime = &*RUNTIME;
    let registry = runtime.frame_registry();

    let blob = encode_entry(0x7000, 48, &[0, 8, 17]);
    let n = registry.register_frames(&blob, |_| Some(Arc::from("compiled_method"))).unwrap();
    assert_eq!(n, 1);

    let info = registry.lookup(0x7000);
    assert_eq!(info.frame_size, 48);
    assert!(info.is_managed());
    assert!(!vmkit_core::frame::FrameInfo::is_tagged_skip(8));
    assert!(vmkit_core::frame::FrameInfo::is_tagged_skip(17));
}

fn leaf_vtable() -> vmkit_core::VTable {
    vmkit_core::VTable {
        destructor: vmkit_core::object::EMPTY_DESTRUCTOR,
        operator_delete: vmkit_core::object::EMPTY_DESTRUCTOR,
        tracer: no_refs_tracer,
    }
}

unsafe extern "C" fn no_refs_tracer(_obj: ObjectRef, _closure: vmkit_core::Closure) {}

fn encode_entry(return_address: usize, frame_size: u16, live_offsets: &[i16]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&return_address.to_ne_bytes());
    buf.extend_from_slice(&frame_size.to_ne_bytes());
    buf.extend_from_slice(&(live_offsets.len() as u16).to_ne_bytes());
    for off in live_offsets {
        buf.extend_from_slice(&off.to_ne_bytes());
    }
    if buf.len() % 4 != 0 {
        buf.extend_from_slice(&0u16.to_ne_bytes());
    }
    buf
}
