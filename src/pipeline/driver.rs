//! Driver-scheduled pipeline discipline.
//!
//! No explicit events: segment k lands entirely on auxiliary queue
//! `1 + (k mod 16)` as the ordered triple (read, compute, write), and the
//! driver is trusted to overlap independent queues. Correctness rests on
//! the segments covering disjoint offset ranges; anything shared between
//! segments (whole-array reads, intermediate kernels) is serialized with a
//! queue drain instead of an event.

use super::IssueStats;
use crate::array::{AccessPolicy, ArraySpec};
use crate::config::MAX_QUEUES;
use crate::error::{Error, Result};
use crate::worker::DeviceWorker;
use parking_lot::Mutex;

/// Host-side parallelism of the final flush/finish sweep.
const FINISH_POOL: usize = 8;

/// One driver-disciplined pipeline run over a device's sub-range.
#[derive(Debug)]
pub struct DriverPipeline<'a> {
    pub worker: &'a DeviceWorker,
    pub specs: &'a [ArraySpec],
    pub kernels: &'a [String],
    pub compute_id: i64,
    pub offset: u64,
    pub range: u64,
    pub local_range: u64,
    pub stages: u32,
}

impl DriverPipeline<'_> {
    /// Issue the full pipeline and block until every used queue has drained.
    ///
    /// A stage count that is not a positive multiple of 4 aborts before
    /// anything is enqueued, leaving host arrays untouched.
    pub fn run(&self) -> Result<IssueStats> {
        if self.stages < 4 || self.stages % 4 != 0 {
            return Err(Error::contract(format!(
                "driver pipeline stages must be >= 4 and a multiple of 4, got {}",
                self.stages
            )));
        }
        if self.range == 0 || self.range % self.stages as u64 != 0 {
            return Err(Error::contract(format!(
                "range {} is not divisible into {} segments",
                self.range, self.stages
            )));
        }
        let segment = self.range / self.stages as u64;
        if segment % self.local_range != 0 {
            return Err(Error::contract(format!(
                "segment size {} is not a multiple of local range {}",
                segment, self.local_range
            )));
        }
        if self.kernels.is_empty() {
            return Err(Error::contract("pipeline needs at least one kernel"));
        }

        let mut stats = IssueStats::default();
        let used_queues = (self.stages as usize).min(MAX_QUEUES);

        // Whole-array reads are shared across segments: stage them on the
        // first queue and drain it before fanning out.
        let mut preloaded = false;
        for spec in self.specs {
            if spec.policy == AccessPolicy::Read {
                let items = spec.array.len() as u64 / spec.elems_per_item.max(1) as u64;
                self.worker.write_slice(spec, 0, items, 1, &[])?;
                stats.reads += 1;
                preloaded = true;
            }
        }
        if preloaded {
            self.worker.finish(1)?;
        }

        match self.kernels.len() {
            1 => {
                self.issue_segments(&mut stats, segment, true, Some(&self.kernels[0]), true)?;
            }
            2 => {
                self.issue_segments(&mut stats, segment, true, Some(&self.kernels[0]), false)?;
                self.drain_used(used_queues)?;
                self.issue_segments(&mut stats, segment, false, Some(&self.kernels[1]), true)?;
            }
            n => {
                self.issue_segments(&mut stats, segment, true, Some(&self.kernels[0]), false)?;
                self.drain_used(used_queues)?;

                for kernel in &self.kernels[1..n - 1] {
                    self.worker.compute(
                        kernel,
                        self.compute_id,
                        self.offset,
                        self.range,
                        self.local_range,
                        0,
                        &[],
                    )?;
                    stats.computes += 1;
                }
                self.worker.finish(0)?;

                self.issue_segments(&mut stats, segment, false, Some(&self.kernels[n - 1]), true)?;
            }
        }

        for q in 1..=used_queues {
            self.worker.flush(q)?;
        }
        self.finish_paired(used_queues)?;

        // whole-array write-back runs after every segment has drained
        for spec in self.specs {
            if spec.policy == AccessPolicy::WriteAll {
                let items = spec.array.len() as u64 / spec.elems_per_item.max(1) as u64;
                self.worker.read_slice(spec, 0, items, 1, &[])?;
                stats.writes += 1;
            }
        }
        self.worker.finish(1)?;

        Ok(stats)
    }

    fn issue_segments(
        &self,
        stats: &mut IssueStats,
        segment: u64,
        do_reads: bool,
        kernel: Option<&String>,
        do_writes: bool,
    ) -> Result<()> {
        for k in 0..self.stages as usize {
            let queue = self.worker.aux_queue_index(k);
            let seg_offset = self.offset + k as u64 * segment;

            if do_reads {
                for spec in self.specs {
                    if spec.policy == AccessPolicy::PartialRead {
                        self.worker
                            .write_slice(spec, seg_offset, segment, queue, &[])?;
                        stats.reads += 1;
                    }
                }
            }

            if let Some(kernel) = kernel {
                self.worker.compute(
                    kernel,
                    self.compute_id,
                    seg_offset,
                    segment,
                    self.local_range,
                    queue,
                    &[],
                )?;
                stats.computes += 1;
            }

            if do_writes {
                for spec in self.specs {
                    if spec.policy == AccessPolicy::Write {
                        self.worker
                            .read_slice(spec, seg_offset, segment, queue, &[])?;
                        stats.writes += 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn drain_used(&self, used_queues: usize) -> Result<()> {
        for q in 1..=used_queues {
            self.worker.finish(q)?;
        }
        Ok(())
    }

    /// Finish the used queues from a small host pool, pairing queue q with
    /// queue 17-q so each task touches one early and one late queue.
    fn finish_paired(&self, used_queues: usize) -> Result<()> {
        let failures: Mutex<Vec<Error>> = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for pair in 1..=FINISH_POOL {
                let failures = &failures;
                let worker = self.worker;
                scope.spawn(move || {
                    for q in [pair, MAX_QUEUES + 1 - pair] {
                        if q <= used_queues {
                            if let Err(e) = worker.finish(q) {
                                failures.lock().push(e);
                            }
                        }
                    }
                });
            }
        });

        match failures.into_inner().into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::HostArray;
    use crate::backend::{Backend, HostBackend, KindFilter, MemoryPolicy};
    use std::sync::Arc;

    fn copy_backend() -> Arc<HostBackend> {
        let backend = HostBackend::cpus(1);
        backend.register_kernel("copy", |bufs, range| {
            let (src, dst) = bufs.split_at_mut(1);
            let src: &[f32] = bytemuck::cast_slice(&src[0][..]);
            let dst: &mut [f32] = bytemuck::cast_slice_mut(&mut dst[0][..]);
            for i in range.global_offset..range.global_offset + range.global_range {
                dst[i as usize] = src[i as usize];
            }
        });
        backend.register_kernel("negate", |bufs, range| {
            let data: &mut [f32] = bytemuck::cast_slice_mut(&mut bufs[1][..]);
            for i in range.global_offset..range.global_offset + range.global_range {
                data[i as usize] = -data[i as usize];
            }
        });
        backend
    }

    fn worker(backend: &HostBackend, names: &[&str]) -> DeviceWorker {
        let device = backend.devices(KindFilter::all()).unwrap().remove(0);
        DeviceWorker::new(device, "src", names, MemoryPolicy::PinnedHost, 1, false).unwrap()
    }

    fn io_specs(n: usize) -> (Arc<HostArray>, Arc<HostArray>, Vec<ArraySpec>) {
        let input = HostArray::from_slice(&(0..n).map(|i| i as f32).collect::<Vec<_>>());
        let output = HostArray::from_slice(&vec![0.0f32; n]);
        let specs = vec![
            ArraySpec::new(Arc::clone(&input), AccessPolicy::PartialRead, 1),
            ArraySpec::new(Arc::clone(&output), AccessPolicy::Write, 1),
        ];
        (input, output, specs)
    }

    #[test]
    fn test_sixteen_segments_identity() {
        let backend = copy_backend();
        let worker = worker(&backend, &["copy"]);
        let (input, output, specs) = io_specs(4096);

        worker.bind_arguments("copy", &specs, 1).unwrap();
        let engine = DriverPipeline {
            worker: &worker,
            specs: &specs,
            kernels: &["copy".to_string()],
            compute_id: 1,
            offset: 0,
            range: 4096,
            local_range: 64,
            stages: 16,
        };
        let stats = engine.run().unwrap();

        assert_eq!(output.to_vec::<f32>(), input.to_vec::<f32>());
        assert_eq!(stats.reads, 16);
        assert_eq!(stats.computes, 16);
        assert_eq!(stats.writes, 16);
    }

    #[test]
    fn test_more_segments_than_queues_wraps() {
        let backend = copy_backend();
        let worker = worker(&backend, &["copy"]);
        let (input, output, specs) = io_specs(2048);

        worker.bind_arguments("copy", &specs, 2).unwrap();
        let engine = DriverPipeline {
            worker: &worker,
            specs: &specs,
            kernels: &["copy".to_string()],
            compute_id: 2,
            offset: 0,
            range: 2048,
            local_range: 32,
            stages: 32,
        };
        let stats = engine.run().unwrap();

        assert_eq!(output.to_vec::<f32>(), input.to_vec::<f32>());
        assert_eq!(stats.computes, 32);
    }

    #[test]
    fn test_two_kernel_split() {
        let backend = copy_backend();
        let worker = worker(&backend, &["copy", "negate"]);
        let (input, output, specs) = io_specs(1024);

        worker.bind_arguments("copy", &specs, 3).unwrap();
        worker.bind_arguments("negate", &specs, 3).unwrap();
        let kernels = vec!["copy".to_string(), "negate".to_string()];
        let engine = DriverPipeline {
            worker: &worker,
            specs: &specs,
            kernels: &kernels,
            compute_id: 3,
            offset: 0,
            range: 1024,
            local_range: 64,
            stages: 4,
        };
        engine.run().unwrap();

        let expected: Vec<f32> = input.to_vec::<f32>().iter().map(|v| -v).collect();
        assert_eq!(output.to_vec::<f32>(), expected);
    }

    #[test]
    fn test_non_multiple_of_four_aborts_untouched() {
        let backend = copy_backend();
        let worker = worker(&backend, &["copy"]);
        let (_, output, specs) = io_specs(1024);

        worker.bind_arguments("copy", &specs, 4).unwrap();
        let engine = DriverPipeline {
            worker: &worker,
            specs: &specs,
            kernels: &["copy".to_string()],
            compute_id: 4,
            offset: 0,
            range: 1024,
            local_range: 64,
            stages: 6,
        };
        let err = engine.run().unwrap_err();
        assert!(matches!(err, Error::Contract(_)));

        // nothing was enqueued, the output array is untouched
        assert_eq!(output.to_vec::<f32>(), vec![0.0f32; 1024]);
    }
}
