/*!
 * Handle Table Benchmarks
 *
 * Reserve/free churn, lookup fast path, and refcounted access
 */

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use foundation_core::{HandleTable, SpinConfig};
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread;

fn bench_reserve_free_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("reserve_free_cycle");

    for capacity in [64usize, 1024, 65_536] {
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &capacity,
            |b, &capacity| {
                let table = HandleTable::<u64>::new(capacity);
                b.iter(|| {
                    let handle = table.reserve().unwrap();
                    table.free(black_box(handle));
                });
            },
        );
    }

    group.finish();
}

fn bench_lookup_hit(c: &mut Criterion) {
    let table = HandleTable::<u64>::new(1024);
    let handle = table.reserve().unwrap();
    let object = NonNull::new(Box::into_raw(Box::new(42u64))).unwrap();
    table.set(handle, object).unwrap();

    c.bench_function("lookup_hit", |b| {
        b.iter(|| black_box(table.lookup(black_box(handle))));
    });

    table.free(handle);
    unsafe { drop(Box::from_raw(object.as_ptr())) };
}

fn bench_lookup_ref_cycle(c: &mut Criterion) {
    let table = HandleTable::<u64>::new(1024);
    let handle = table.reserve().unwrap();
    let object = NonNull::new(Box::into_raw(Box::new(42u64))).unwrap();
    table.set(handle, object).unwrap();

    c.bench_function("lookup_ref_unref", |b| {
        b.iter(|| {
            let ptr = table.lookup_ref(black_box(handle)).unwrap();
            black_box(ptr);
            table.lookup_unref(handle, |_| unreachable!("base ref still held"));
        });
    });

    table.free(handle);
    unsafe { drop(Box::from_raw(object.as_ptr())) };
}

fn bench_contended_reserve_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_reserve_free");
    group.sample_size(10);

    for threads in [2usize, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let table =
                        Arc::new(HandleTable::<u64>::with_spin(256, SpinConfig::default()));
                    let workers: Vec<_> = (0..threads)
                        .map(|_| {
                            let table = Arc::clone(&table);
                            thread::spawn(move || {
                                for _ in 0..1_000 {
                                    let handle = table.reserve().unwrap();
                                    table.free(handle);
                                }
                            })
                        })
                        .collect();
                    for worker in workers {
                        worker.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_reserve_free_cycle,
    bench_lookup_hit,
    bench_lookup_ref_cycle,
    bench_contended_reserve_free
);
criterion_main!(benches);
