//! Timing-wheel benchmarks
//!
//! The reactor refreshes one timer per dispatched event, so insert,
//! update-move and drain are hot paths. All runs use a 1ms tick to make
//! tick arithmetic the dominant cost rather than bucket scans.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use netplex_core::clock::MonotonicTime;
use netplex_core::wheel::TimingWheel;

fn bench_insert_remove(c: &mut Criterion) {
    c.bench_function("wheel_insert_remove", |b| {
        let mut wheel = TimingWheel::new(1, 4_096, MonotonicTime::ZERO);
        let id = wheel.alloc(0);
        let now = MonotonicTime::ZERO;
        b.iter(|| {
            wheel.insert(black_box(id), 500, now).unwrap();
            wheel.remove(black_box(id)).unwrap();
        });
    });
}

fn bench_update_move(c: &mut Criterion) {
    // Alternating delays force a bucket move on every refresh.
    c.bench_function("wheel_update_move", |b| {
        let mut wheel = TimingWheel::new(1, 4_096, MonotonicTime::ZERO);
        let id = wheel.alloc(0);
        let now = MonotonicTime::ZERO;
        wheel.insert(id, 500, now).unwrap();
        let mut flip = false;
        b.iter(|| {
            flip = !flip;
            let delay = if flip { 600 } else { 500 };
            wheel.update(black_box(id), delay, now).unwrap();
        });
    });
}

fn bench_update_same_tick(c: &mut Criterion) {
    // The common case: a busy connection refreshed within one tick.
    c.bench_function("wheel_update_same_tick", |b| {
        let mut wheel = TimingWheel::new(1, 4_096, MonotonicTime::ZERO);
        let id = wheel.alloc(0);
        let now = MonotonicTime::ZERO;
        wheel.insert(id, 500, now).unwrap();
        b.iter(|| {
            wheel.update(black_box(id), 500, now).unwrap();
        });
    });
}

fn bench_drain_1k(c: &mut Criterion) {
    c.bench_function("wheel_drain_1k", |b| {
        b.iter_batched(
            || {
                let mut wheel = TimingWheel::new(1, 4_096, MonotonicTime::ZERO);
                for i in 0..1_000u32 {
                    let id = wheel.alloc(i);
                    wheel.insert(id, 1 + (i % 2_000), MonotonicTime::ZERO).unwrap();
                }
                wheel
            },
            |mut wheel| {
                let deadline = MonotonicTime::from_millis(2_100);
                let mut n = 0;
                while let Some(id) = wheel.next_expired(deadline) {
                    black_box(id);
                    n += 1;
                }
                assert_eq!(n, 1_000);
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_insert_remove,
    bench_update_move,
    bench_update_same_tick,
    bench_drain_1k
);
criterion_main!(benches);
