//! Futex-backed mutex latency benchmarks

use criterion::{Criterion, criterion_group, criterion_main};
use rtcore_realtime::{Access, ProcessMutex, SharedMemorySegment};
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};

/// Lock/unlock round trip with no other user
fn bench_uncontended(c: &mut Criterion) {
    let mutex = ProcessMutex::new(0u64);

    c.bench_function("mutex_lock_unlock", |b| {
        b.iter(|| {
            *mutex.lock() += 1;
        });
    });

    c.bench_function("mutex_try_lock", |b| {
        b.iter(|| {
            black_box(mutex.try_lock().is_some());
        });
    });
}

/// Lock round trip through a shared memory mapping while another thread hammers the lock
fn bench_contended_shm(c: &mut Criterion) {
    let name = format!("/rtcore_bench_mutex_{}", std::process::id());
    let segment = SharedMemorySegment::create(&name, 4096).unwrap();
    let other = SharedMemorySegment::open(&name, Access::ReadWrite).unwrap();
    let mutex: &ProcessMutex<u64> = segment.place(0).unwrap();
    let stop = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            let mutex: &ProcessMutex<u64> = other.place(0).unwrap();
            while !stop.load(Ordering::Relaxed) {
                *mutex.lock() += 1;
            }
        });

        c.bench_function("mutex_lock_contended_shm", |b| {
            b.iter(|| {
                *mutex.lock() += 1;
            });
        });

        stop.store(true, Ordering::Relaxed);
    });
}

criterion_group!(benches, bench_uncontended, bench_contended_shm);
criterion_main!(benches);
