//! Per-device transfer/compute pipelining.
//!
//! A device's sub-range is cut into N equal segments and the read, compute
//! and write phases of consecutive segments are overlapped. Two disciplines
//! exist: [`event`] wires an explicit event DAG across six queues, while
//! [`driver`] spreads ordered segment triples over up to sixteen queues and
//! trusts the driver to overlap them.

pub mod driver;
pub mod event;

use crate::error::{Error, Result};

/// Pipelining discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    /// Event-driven fan-out over three queue pairs.
    Event,
    /// Driver-scheduled round-robin over the auxiliary queues.
    Driver,
}

/// Requested pipeline shape for a compute call.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSpec {
    pub kind: PipelineKind,
    pub stages: u32,
}

impl PipelineSpec {
    pub fn new(kind: PipelineKind, stages: u32) -> Self {
        Self { kind, stages }
    }

    /// Stage-count invariant: at least 4 and a multiple of 4.
    pub fn validate(&self) -> Result<()> {
        if self.stages < 4 || self.stages % 4 != 0 {
            return Err(Error::contract(format!(
                "pipeline stages must be >= 4 and a multiple of 4, got {}",
                self.stages
            )));
        }
        Ok(())
    }
}

/// Issue counters reported by an engine run, for accounting and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IssueStats {
    pub reads: u64,
    pub computes: u64,
    pub writes: u64,
}

impl IssueStats {
    pub(crate) fn merge(&mut self, other: IssueStats) {
        self.reads += other.reads;
        self.computes += other.computes;
        self.writes += other.writes;
    }
}

/// Dispatcher-side feasibility gate for pipelining a balanced partition.
///
/// Every participating device needs a share of at least one full pipeline
/// round, each segment must stay a multiple of the workgroup size, and
/// repeat loops force the simple path.
pub fn feasible(ranges: &[u64], stages: u32, local_range: u64, repeats: u32) -> bool {
    if repeats > 1 || stages < 4 || stages % 4 != 0 {
        return false;
    }
    ranges.iter().filter(|&&r| r > 0).all(|&r| {
        r >= stages as u64 * local_range && (r / stages as u64) % local_range == 0
    })
}
