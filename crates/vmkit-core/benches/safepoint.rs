use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::mem::MaybeUninit;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use vmkit_core::rendezvous::Rendezvous;
use vmkit_core::sync::Lock;
use vmkit_core::thread::record::{ThreadRecord, ThreadRole};
use vmkit_core::thread::registry::ThreadRegistry;

fn fresh_record(id: usize) -> Box<MaybeUninit<ThreadRecord>> {
    let mut slot: Box<MaybeUninit<ThreadRecord>> = Box::new(MaybeUninit::zeroed());
    unsafe { ThreadRecord::init(slot.as_mut_ptr(), id, ThreadRole::Mutator) };
    slot
}

// Not a call through `thread::safepoint_poll` itself (that requires an
// installed runtime and a managed stack pointer) — exercises the same
// single-atomic-load fast path `do_yield == false` takes, which dominates
// real usage: a JIT-emitted poll at every loop back-edge and method
// prologue (spec.md 4.F) spends almost all its time here, not in `join()`.
fn bench_safepoint_poll_fastpath(c: &mut Criterion) {
    let slot = fresh_record(0);
    let rec = unsafe { &*slot.as_ptr() };

    c.bench_function("safepoint_poll_fastpath", |b| {
        b.iter(|| {
            let should_join = rec.do_yield.load(Ordering::Acquire);
            black_box(should_join)
        });
    });
}

// Uncontended lock/unlock with no runtime installed — `enter_uncooperative`/
// `leave_uncooperative` no-op on an unmanaged stack, so this isolates the
// `RawMutex` + owner-bookkeeping cost `sync::Lock` adds on top of a plain
// mutex (spec.md 4.C).
fn bench_lock_uncontended(c: &mut Criterion) {
    let lock = Lock::new_normal();
    c.bench_function("lock_uncontended_round_trip", |b| {
        b.iter(|| {
            lock.lock();
            lock.unlock();
        });
    });
}

// A single-thread rendezvous round trip: `synchronize` then `finish_rv`
// with exactly one registered thread (the caller acting as both initiator
// and sole mutator). Measures the registry-lock/membership-lock overhead
// of the stop-the-world protocol (spec.md 4.F) independent of how many
// other mutators would normally need to join.
fn bench_rendezvous_round_trip(c: &mut Criterion) {
    let registry = Arc::new(ThreadRegistry::new());
    let slot = fresh_record(0);
    let rec = unsafe { &*slot.as_ptr() };
    registry.register(rec);
    let rendezvous = Rendezvous::new(registry);

    c.bench_function("rendezvous_single_thread_round_trip", |b| {
        b.iter(|| {
            rendezvous.synchronize(rec);
            rendezvous.finish_rv(rec);
        });
    });
}

criterion_group!(
    benches,
    bench_safepoint_poll_fastpath,
    bench_lock_uncontended,
    bench_rendezvous_round_trip
);
criterion_main!(benches);
