//! Adaptive range scheduling.
//!
//! Every compute-id owns a [`ScheduleState`]: the current partition of the
//! global index range across devices, the latest per-device latencies, and a
//! short latency history used for smoothing. [`balance`] reallocates the
//! partition from measured throughput.

pub mod balance;

pub use balance::rebalance;

use std::collections::VecDeque;

/// Depth of the per-device latency history ring.
pub const HISTORY_DEPTH: usize = 10;

/// Latency seeded for a device that has never been measured, in ms.
pub const BENCH_SEED_MS: f64 = 10.0;

/// One latency measurement and the share that produced it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BenchSample {
    pub latency_ms: f64,
    pub range: u64,
}

/// Scheduling state for one compute-id.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    ranges: Vec<u64>,
    references: Vec<u64>,
    benchmarks: Vec<f64>,
    history: VecDeque<Vec<BenchSample>>,
    initialized: bool,
}

impl ScheduleState {
    /// Fresh state for `devices` devices; ranges are assigned on the first
    /// call that references this compute-id.
    pub fn new(devices: usize) -> Self {
        Self {
            ranges: vec![0; devices],
            references: vec![0; devices],
            benchmarks: vec![BENCH_SEED_MS; devices],
            history: VecDeque::with_capacity(HISTORY_DEPTH),
            initialized: false,
        }
    }

    /// Number of devices in the partition.
    pub fn device_count(&self) -> usize {
        self.ranges.len()
    }

    /// Whether ranges have been assigned yet.
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// Current workitem shares.
    pub fn ranges(&self) -> &[u64] {
        &self.ranges
    }

    /// Starting global offset of each device's share.
    pub fn references(&self) -> &[u64] {
        &self.references
    }

    /// Latest measured latencies in ms.
    pub fn benchmarks(&self) -> &[f64] {
        &self.benchmarks
    }

    /// Latency history, newest first. At most [`HISTORY_DEPTH`] rows.
    pub fn history(&self) -> Vec<Vec<f64>> {
        self.history
            .iter()
            .map(|row| row.iter().map(|s| s.latency_ms).collect())
            .collect()
    }

    /// Record a measured latency for device `device`.
    pub fn record_benchmark(&mut self, device: usize, ms: f64) {
        if ms > 0.0 {
            self.benchmarks[device] = ms;
        }
    }

    /// Assign equal shares, snapped down to `alignment`; any remainder goes
    /// to device 0 before snapping takes effect on the others.
    pub fn init_equal(&mut self, global_range: u64, alignment: u64) {
        let devices = self.ranges.len() as u64;
        let base = if devices == 0 {
            0
        } else {
            (global_range / devices / alignment) * alignment
        };

        for r in self.ranges.iter_mut() {
            *r = base;
        }
        let assigned = base * devices;
        if !self.ranges.is_empty() {
            self.ranges[0] += global_range - assigned;
        }
        self.initialized = true;
    }

    /// Rebuild the reference offsets as prefix sums starting at
    /// `global_offset`.
    pub fn update_references(&mut self, global_offset: u64) {
        let mut acc = global_offset;
        for (reference, range) in self.references.iter_mut().zip(self.ranges.iter()) {
            *reference = acc;
            acc += *range;
        }
    }

    pub(crate) fn set_ranges(&mut self, ranges: Vec<u64>) {
        debug_assert_eq!(ranges.len(), self.ranges.len());
        self.ranges = ranges;
        self.initialized = true;
    }

    pub(crate) fn push_history(&mut self, row: Vec<BenchSample>) {
        self.history.push_front(row);
        self.history.truncate(HISTORY_DEPTH);
    }

    /// Smoothed throughput for one device in workitems per ms: mean over
    /// the non-zero history entries of the share each measurement was taken
    /// at divided by that measurement. Falls back to one `fallback_range`
    /// at the seed latency when no samples exist.
    pub(crate) fn smoothed_throughput(&self, device: usize, fallback_range: u64) -> f64 {
        let mut sum = 0.0;
        let mut n = 0usize;
        for row in &self.history {
            let sample = row[device];
            if sample.latency_ms > 0.0 {
                sum += sample.range as f64 / sample.latency_ms;
                n += 1;
            }
        }
        if n == 0 {
            fallback_range as f64 / BENCH_SEED_MS
        } else {
            sum / n as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_seeded() {
        let state = ScheduleState::new(3);
        assert!(!state.initialized());
        assert_eq!(state.benchmarks(), &[BENCH_SEED_MS; 3]);
        assert!(state.history().is_empty());
    }

    #[test]
    fn test_init_equal_exact() {
        let mut state = ScheduleState::new(4);
        state.init_equal(4096, 64);
        assert_eq!(state.ranges(), &[1024, 1024, 1024, 1024]);
        assert_eq!(state.ranges().iter().sum::<u64>(), 4096);
    }

    #[test]
    fn test_init_equal_remainder_to_device_zero() {
        let mut state = ScheduleState::new(3);
        state.init_equal(4096, 64);
        // 4096/3 = 1365 -> snapped 1344 each, device 0 takes the rest
        assert_eq!(state.ranges()[1], 1344);
        assert_eq!(state.ranges()[2], 1344);
        assert_eq!(state.ranges().iter().sum::<u64>(), 4096);
    }

    #[test]
    fn test_references_prefix_sum() {
        let mut state = ScheduleState::new(3);
        state.init_equal(3072, 64);
        state.update_references(100);
        let refs = state.references();
        assert_eq!(refs[0], 100);
        assert_eq!(refs[1], 100 + state.ranges()[0]);
        assert_eq!(refs[2], refs[1] + state.ranges()[1]);
    }

    #[test]
    fn test_history_ring_depth() {
        let mut state = ScheduleState::new(1);
        for i in 0..15 {
            state.push_history(vec![BenchSample {
                latency_ms: i as f64,
                range: 64,
            }]);
        }
        let history = state.history();
        assert_eq!(history.len(), HISTORY_DEPTH);
        // newest first
        assert_eq!(history[0][0], 14.0);
    }

    #[test]
    fn test_smoothed_throughput_ignores_unmeasured() {
        let mut state = ScheduleState::new(1);
        state.push_history(vec![BenchSample {
            latency_ms: 0.0,
            range: 64,
        }]);
        state.push_history(vec![BenchSample {
            latency_ms: 4.0,
            range: 64,
        }]);
        state.push_history(vec![BenchSample {
            latency_ms: 8.0,
            range: 64,
        }]);
        assert_eq!(state.smoothed_throughput(0, 64), (64.0 / 4.0 + 64.0 / 8.0) / 2.0);
    }

    #[test]
    fn test_smoothed_throughput_seed_fallback() {
        let state = ScheduleState::new(1);
        assert_eq!(state.smoothed_throughput(0, 64), 64.0 / BENCH_SEED_MS);
    }
}
