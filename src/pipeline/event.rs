//! Event-driven pipeline discipline.
//!
//! Six logical queues form three pairs: {read, read'}, {compute, compute'},
//! {write, write'}. Two wavefronts run over the two halves of the device's
//! sub-range, the first half on the unprimed queues, the second on the
//! primed ones. Within a wavefront, segment j's read is enqueued at step j,
//! its compute at step j+1 and its write at step j+2; cross-queue order is
//! carried entirely by the event DAG:
//!
//! - read_j guards compute_j and the write enqueued one step later,
//! - compute_j guards its own write and the read enqueued two steps later,
//! - write_j guards the read and compute enqueued three steps later.

use super::IssueStats;
use crate::array::{AccessPolicy, ArraySpec};
use crate::backend::EventHandle;
use crate::error::{Error, Result};
use crate::worker::DeviceWorker;

/// Auxiliary queue numbers of the read pair.
const READ_Q: [usize; 2] = [1, 2];
/// Auxiliary queue numbers of the compute pair.
const COMPUTE_Q: [usize; 2] = [3, 4];
/// Auxiliary queue numbers of the write pair.
const WRITE_Q: [usize; 2] = [5, 6];

/// One event-disciplined pipeline run over a device's sub-range.
#[derive(Debug)]
pub struct EventPipeline<'a> {
    pub worker: &'a DeviceWorker,
    pub specs: &'a [ArraySpec],
    pub kernels: &'a [String],
    pub compute_id: i64,
    pub offset: u64,
    pub range: u64,
    pub local_range: u64,
    pub stages: u32,
}

struct PassResult {
    stats: IssueStats,
    last_computes: Vec<EventHandle>,
    wrote: bool,
}

impl EventPipeline<'_> {
    /// Issue the full pipeline and block until the final phase has drained.
    pub fn run(&self) -> Result<IssueStats> {
        self.check_geometry()?;
        if self.kernels.is_empty() {
            return Err(Error::contract("pipeline needs at least one kernel"));
        }

        let mut stats = IssueStats::default();

        // Whole-array reads are shared by every segment: transfer them once
        // up front and guard the first computes with their events.
        let mut preload = Vec::new();
        for spec in self.specs {
            if spec.policy == AccessPolicy::Read {
                let items = spec.array.len() as u64 / spec.elems_per_item.max(1) as u64;
                preload.push(self.worker.write_slice(spec, 0, items, READ_Q[0], &[])?);
                stats.reads += 1;
            }
        }

        let shape = self.kernels.len();
        let final_pass = if shape == 1 {
            let pass = self.run_pass(&self.kernels[0], true, true, &preload)?;
            stats.merge(pass.stats);
            pass
        } else if shape == 2 {
            let first = self.run_pass(&self.kernels[0], true, false, &preload)?;
            stats.merge(first.stats);
            // same compute queues, in-order per half: no barrier needed
            let second = self.run_pass(&self.kernels[1], false, true, &[])?;
            stats.merge(second.stats);
            second
        } else {
            let first = self.run_pass(&self.kernels[0], true, false, &preload)?;
            stats.merge(first.stats);

            // intermediate kernels run un-pipelined on the primary queue
            let mut chain = first.last_computes.clone();
            for kernel in &self.kernels[1..shape - 1] {
                let ev = self.worker.compute(
                    kernel,
                    self.compute_id,
                    self.offset,
                    self.range,
                    self.local_range,
                    0,
                    &chain,
                )?;
                stats.computes += 1;
                chain = vec![ev];
            }

            let last = self.run_pass(&self.kernels[shape - 1], false, true, &chain)?;
            stats.merge(last.stats);
            last
        };

        // single-device whole-array write-back
        let mut wrote = final_pass.wrote;
        for spec in self.specs {
            if spec.policy == AccessPolicy::WriteAll {
                let items = spec.array.len() as u64 / spec.elems_per_item.max(1) as u64;
                self.worker
                    .read_slice(spec, 0, items, WRITE_Q[0], &final_pass.last_computes)?;
                stats.writes += 1;
                wrote = true;
            }
        }

        for q in READ_Q.iter().chain(&COMPUTE_Q).chain(&WRITE_Q) {
            self.worker.flush(*q)?;
        }
        let finish_queues = if wrote { WRITE_Q } else { COMPUTE_Q };
        for q in finish_queues {
            self.worker.finish(q)?;
        }

        Ok(stats)
    }

    fn check_geometry(&self) -> Result<()> {
        let stages = self.stages as u64;
        if self.stages < 4 || self.stages % 4 != 0 {
            return Err(Error::contract(format!(
                "event pipeline stages must be >= 4 and a multiple of 4, got {}",
                self.stages
            )));
        }
        if self.range == 0 || self.range % stages != 0 {
            return Err(Error::contract(format!(
                "range {} is not divisible into {} segments",
                self.range, stages
            )));
        }
        if (self.range / stages) % self.local_range != 0 {
            return Err(Error::contract(format!(
                "segment size {} is not a multiple of local range {}",
                self.range / stages,
                self.local_range
            )));
        }
        Ok(())
    }

    /// One read->compute->write wavefront per half, on that half's queues.
    fn run_pass(
        &self,
        kernel: &str,
        do_reads: bool,
        do_writes: bool,
        first_compute_guards: &[EventHandle],
    ) -> Result<PassResult> {
        let mut stats = IssueStats::default();
        let mut last_computes = Vec::with_capacity(2);
        let mut wrote = false;

        let segment = self.range / self.stages as u64;
        let per_half = (self.stages / 2) as usize;

        for half in 0..2 {
            let half_offset = self.offset + half as u64 * (self.range / 2);
            let read_q = READ_Q[half];
            let compute_q = COMPUTE_Q[half];
            let write_q = WRITE_Q[half];

            let mut read_evs: Vec<Option<Vec<EventHandle>>> = vec![None; per_half];
            let mut comp_evs: Vec<Option<EventHandle>> = vec![None; per_half];
            let mut write_evs: Vec<Option<Vec<EventHandle>>> = vec![None; per_half];

            for step in 0..per_half + 2 {
                // read of segment `step`
                if do_reads && step < per_half {
                    let j = step;
                    let mut guards = Vec::new();
                    push_one(&mut guards, j.checked_sub(2).and_then(|i| comp_evs[i].clone()));
                    push_many(&mut guards, j.checked_sub(3).and_then(|i| write_evs[i].clone()));

                    let mut events = Vec::new();
                    for spec in self.specs {
                        if spec.policy == AccessPolicy::PartialRead {
                            events.push(self.worker.write_slice(
                                spec,
                                half_offset + j as u64 * segment,
                                segment,
                                read_q,
                                &guards,
                            )?);
                            stats.reads += 1;
                        }
                    }
                    read_evs[j] = Some(events);
                }

                // compute of segment `step - 1`
                if step >= 1 && step <= per_half {
                    let j = step - 1;
                    let mut guards = Vec::new();
                    push_many(&mut guards, read_evs[j].clone());
                    push_many(&mut guards, j.checked_sub(2).and_then(|i| write_evs[i].clone()));
                    if j == 0 {
                        guards.extend_from_slice(first_compute_guards);
                    }

                    let ev = self.worker.compute(
                        kernel,
                        self.compute_id,
                        half_offset + j as u64 * segment,
                        segment,
                        self.local_range,
                        compute_q,
                        &guards,
                    )?;
                    stats.computes += 1;
                    if j + 1 == per_half {
                        last_computes.push(ev.clone());
                    }
                    comp_evs[j] = Some(ev);
                }

                // write of segment `step - 2`
                if do_writes && step >= 2 && step - 2 < per_half {
                    let j = step - 2;
                    let mut guards = Vec::new();
                    push_one(&mut guards, comp_evs[j].clone());
                    if j + 1 < per_half {
                        push_many(&mut guards, read_evs[j + 1].clone());
                    }

                    let mut events = Vec::new();
                    for spec in self.specs {
                        if spec.policy == AccessPolicy::Write {
                            events.push(self.worker.read_slice(
                                spec,
                                half_offset + j as u64 * segment,
                                segment,
                                write_q,
                                &guards,
                            )?);
                            stats.writes += 1;
                            wrote = true;
                        }
                    }
                    write_evs[j] = Some(events);
                }
            }
        }

        Ok(PassResult {
            stats,
            last_computes,
            wrote,
        })
    }
}

fn push_one(guards: &mut Vec<EventHandle>, ev: Option<EventHandle>) {
    if let Some(ev) = ev {
        guards.push(ev);
    }
}

fn push_many(guards: &mut Vec<EventHandle>, evs: Option<Vec<EventHandle>>) {
    if let Some(evs) = evs {
        guards.extend(evs);
    }
}
