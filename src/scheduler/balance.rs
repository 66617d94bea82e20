//! Iterative range reallocation from measured latencies.

use super::{BenchSample, ScheduleState};

/// Reallocate `global_range` across the devices of `state`.
///
/// Device weight is measured throughput, workitems per ms. With smoothing
/// each history entry contributes the throughput it was measured at, which
/// dampens OS hiccups without letting a stale latency chase a share that has
/// since moved. Each resulting share is a non-negative multiple of
/// `alignment`; the total is exactly `global_range`, with any sub-alignment
/// tail assigned to device 0. Devices whose share would fall below one
/// alignment unit sit out this call with a zero share; the leftover
/// distribution guarantees at least one device keeps work.
pub fn rebalance(state: &mut ScheduleState, global_range: u64, alignment: u64, smooth: bool) {
    let devices = state.device_count();
    if devices == 0 || global_range == 0 {
        return;
    }

    // A zeroed device gets one alignment unit of virtual work so it can win
    // its way back in.
    let effective_range =
        |range: u64| -> u64 { if range == 0 { alignment } else { range } };

    let weights: Vec<f64> = if smooth {
        let row: Vec<BenchSample> = (0..devices)
            .map(|d| BenchSample {
                latency_ms: state.benchmarks()[d],
                range: effective_range(state.ranges()[d]),
            })
            .collect();
        state.push_history(row);
        (0..devices)
            .map(|d| state.smoothed_throughput(d, alignment))
            .collect()
    } else {
        (0..devices)
            .map(|d| {
                let bench = state.benchmarks()[d];
                let latency = if bench > 0.0 { bench } else { super::BENCH_SEED_MS };
                effective_range(state.ranges()[d]) as f64 / latency
            })
            .collect()
    };

    let total_weight: f64 = weights.iter().sum();
    if !(total_weight.is_finite()) || total_weight <= 0.0 {
        state.init_equal(global_range, alignment);
        return;
    }

    let mut snapped = vec![0u64; devices];
    let mut loss = vec![0f64; devices];
    for d in 0..devices {
        let raw = weights[d] / total_weight * global_range as f64;
        snapped[d] = (raw as u64 / alignment) * alignment;
        loss[d] = raw - snapped[d] as f64;
    }

    let assigned: u64 = snapped.iter().sum();
    let leftover = global_range - assigned;
    let mut units = leftover / alignment;
    let tail = leftover % alignment;

    while units > 0 {
        // largest fractional loss wins, lower index breaks ties
        let mut best = 0usize;
        for d in 1..devices {
            if loss[d] > loss[best] {
                best = d;
            }
        }
        snapped[best] += alignment;
        loss[best] -= alignment as f64;
        units -= 1;
    }

    snapped[0] += tail;

    // snapping plus leftover distribution always leaves someone with work
    debug_assert!(snapped.iter().any(|&r| r != 0));

    state.set_ranges(snapped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{ScheduleState, BENCH_SEED_MS};

    fn balanced(state: &mut ScheduleState, global: u64, alignment: u64, smooth: bool) -> Vec<u64> {
        rebalance(state, global, alignment, smooth);
        state.ranges().to_vec()
    }

    #[test]
    fn test_sum_is_exact_and_aligned() {
        let mut state = ScheduleState::new(3);
        state.init_equal(4096, 64);
        state.record_benchmark(0, 5.0);
        state.record_benchmark(1, 10.0);
        state.record_benchmark(2, 20.0);

        let ranges = balanced(&mut state, 4096, 64, false);
        assert_eq!(ranges.iter().sum::<u64>(), 4096);
        for r in &ranges {
            assert_eq!(r % 64, 0);
        }
    }

    #[test]
    fn test_faster_device_gains_share() {
        let mut state = ScheduleState::new(2);
        state.init_equal(4096, 64);
        // device 0 runs its half 3x faster than device 1
        state.record_benchmark(0, 10.0);
        state.record_benchmark(1, 30.0);

        let ranges = balanced(&mut state, 4096, 64, false);
        assert!(ranges[0] > ranges[1]);
        assert_eq!(ranges.iter().sum::<u64>(), 4096);
    }

    #[test]
    fn test_convergence_to_capacity_ratio() {
        // Two devices with true capacities 3:1; latency follows the share.
        let capacities = [3.0f64, 1.0f64];
        let global = 4096u64;
        let mut state = ScheduleState::new(2);
        state.init_equal(global, 64);

        for _ in 0..10 {
            for d in 0..2 {
                let range = state.ranges()[d];
                if range > 0 {
                    state.record_benchmark(d, range as f64 / capacities[d]);
                }
            }
            rebalance(&mut state, global, 64, true);
        }

        // expected 3:1 split within one alignment unit
        let r = state.ranges();
        assert!((r[0] as i64 - 3072).unsigned_abs() <= 64, "ranges = {:?}", r);
        assert!((r[1] as i64 - 1024).unsigned_abs() <= 64, "ranges = {:?}", r);
        assert_eq!(r[0] + r[1], global);
    }

    #[test]
    fn test_starved_device_can_return() {
        let mut state = ScheduleState::new(2);
        state.set_ranges(vec![4096, 0]);
        // the zeroed device now benches much faster than the loaded one
        state.record_benchmark(0, 100.0);
        state.record_benchmark(1, 0.1);

        let ranges = balanced(&mut state, 4096, 64, false);
        assert!(ranges[1] > 0, "starved device stayed locked out: {:?}", ranges);
    }

    #[test]
    fn test_sub_alignment_share_sits_out() {
        let mut state = ScheduleState::new(2);
        state.init_equal(256, 64);
        // device 1 is ~100x slower; its proportional share is < 64 items
        state.record_benchmark(0, 1.0);
        state.record_benchmark(1, 100.0);

        let ranges = balanced(&mut state, 256, 64, false);
        assert_eq!(ranges[1], 0);
        assert_eq!(ranges[0], 256);
    }

    #[test]
    fn test_unaligned_global_tail_to_device_zero() {
        let mut state = ScheduleState::new(1);
        state.init_equal(100, 64);
        state.record_benchmark(0, 2.0);

        let ranges = balanced(&mut state, 100, 64, false);
        assert_eq!(ranges, vec![100]);
    }

    #[test]
    fn test_seed_benchmarks_balance_evenly() {
        let mut state = ScheduleState::new(4);
        state.init_equal(8192, 64);
        assert_eq!(state.benchmarks(), &[BENCH_SEED_MS; 4]);

        let ranges = balanced(&mut state, 8192, 64, false);
        assert_eq!(ranges, vec![2048; 4]);
    }

    #[test]
    fn test_smoothing_dampens_spike() {
        let mut state = ScheduleState::new(2);
        state.init_equal(4096, 64);

        // several equal rounds, then one wild outlier on device 0
        for _ in 0..5 {
            state.record_benchmark(0, 10.0);
            state.record_benchmark(1, 10.0);
            rebalance(&mut state, 4096, 64, true);
        }
        let before = state.ranges().to_vec();

        state.record_benchmark(0, 1000.0);
        state.record_benchmark(1, 10.0);
        rebalance(&mut state, 4096, 64, true);
        let smoothed = state.ranges().to_vec();

        // smoothing keeps the spike from flipping the whole partition
        assert!(smoothed[0] > 0);
        assert!(
            (smoothed[0] as i64 - before[0] as i64).abs() < 2048,
            "spike over-rotated the partition: {:?} -> {:?}",
            before,
            smoothed
        );
    }

    #[test]
    fn test_pipeline_alignment_unit() {
        // alignment = stages * local_range
        let mut state = ScheduleState::new(2);
        state.init_equal(8192, 8 * 64);
        state.record_benchmark(0, 4.0);
        state.record_benchmark(1, 12.0);

        let ranges = balanced(&mut state, 8192, 8 * 64, false);
        assert_eq!(ranges.iter().sum::<u64>(), 8192);
        for r in &ranges {
            assert_eq!(r % (8 * 64), 0);
        }
    }
}
