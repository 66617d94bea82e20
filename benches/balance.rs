//! Benchmarks for the range balancer

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use shard_rs::scheduler::{rebalance, ScheduleState};

fn bench_rebalance_small(c: &mut Criterion) {
    c.bench_function("rebalance_2_devices", |b| {
        let mut state = ScheduleState::new(2);
        state.init_equal(1 << 20, 256);
        state.record_benchmark(0, 4.0);
        state.record_benchmark(1, 12.0);

        b.iter(|| {
            rebalance(&mut state, black_box(1 << 20), 256, true);
            black_box(state.ranges()[0])
        })
    });
}

fn bench_rebalance_wide(c: &mut Criterion) {
    c.bench_function("rebalance_16_devices", |b| {
        let mut state = ScheduleState::new(16);
        state.init_equal(1 << 24, 1024);
        for d in 0..16 {
            state.record_benchmark(d, 1.0 + d as f64);
        }

        b.iter(|| {
            rebalance(&mut state, black_box(1 << 24), 1024, true);
            black_box(state.ranges()[0])
        })
    });
}

fn bench_init_equal(c: &mut Criterion) {
    c.bench_function("init_equal_8_devices", |b| {
        b.iter(|| {
            let mut state = ScheduleState::new(8);
            state.init_equal(black_box(1 << 22), 256);
            black_box(state.ranges()[0])
        })
    });
}

criterion_group!(
    benches,
    bench_rebalance_small,
    bench_rebalance_wide,
    bench_init_equal
);
criterion_main!(benches);
