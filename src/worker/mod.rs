//! Per-device workers.
//!
//! A [`DeviceWorker`] owns one device's command queues (one primary plus up
//! to sixteen auxiliary), its compiled kernels, the kernel-argument cache,
//! per-compute-id wall-time benchmarks, and the transfer primitives the
//! dispatcher and pipeline engines drive. Queue 0 is the primary; auxiliary
//! queues are addressed by index so engines can pick them with plain
//! modular arithmetic.

use crate::array::{AccessPolicy, ArraySpec};
use crate::backend::{
    BufferHandle, CommandQueue, DeviceHandle, DeviceKind, DispatchRange, EventHandle, KernelArgs,
    KernelRef, MemoryPolicy,
};
use crate::config::MAX_QUEUES;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Compute-id reserved for sync-kernel dispatches; excluded from balancing.
pub const SYNC_COMPUTE_ID: i64 = -1;

struct CachedArgs {
    signature: Vec<u64>,
    args: KernelArgs,
}

#[derive(Default)]
struct WorkerState {
    buffers: HashMap<u64, BufferHandle>,
    args: HashMap<(String, i64), CachedArgs>,
    bench_started: Option<Instant>,
    bench_ms: HashMap<i64, f64>,
}

/// One device's queues, kernels, caches and counters.
pub struct DeviceWorker {
    device: Arc<dyn DeviceHandle>,
    queues: Vec<Box<dyn CommandQueue>>,
    kernels: HashMap<String, KernelRef>,
    memory_policy: MemoryPolicy,
    queue_concurrency: usize,
    state: Mutex<WorkerState>,
    markers_issued: AtomicU64,
    markers_completed: Arc<AtomicU64>,
}

impl std::fmt::Debug for DeviceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceWorker")
            .field("device", &self.device.name())
            .field("queues", &self.queues.len())
            .finish()
    }
}

impl DeviceWorker {
    /// Build a worker: create the queue set and compile the program.
    ///
    /// With `no_pipelining` only the primary queue exists; otherwise the
    /// worker carries the primary plus [`MAX_QUEUES`] auxiliary queues.
    pub fn new(
        device: Arc<dyn DeviceHandle>,
        kernel_source: &str,
        kernel_names: &[&str],
        memory_policy: MemoryPolicy,
        queue_concurrency: usize,
        no_pipelining: bool,
    ) -> Result<Self> {
        let queue_count = if no_pipelining { 1 } else { 1 + MAX_QUEUES };
        let mut queues = Vec::with_capacity(queue_count);
        for _ in 0..queue_count {
            queues.push(device.create_queue()?);
        }

        let compiled = device.compile(kernel_source, kernel_names)?;
        let kernels = kernel_names
            .iter()
            .map(|n| n.to_string())
            .zip(compiled)
            .collect();

        Ok(Self {
            device,
            queues,
            kernels,
            memory_policy,
            queue_concurrency: queue_concurrency.clamp(1, MAX_QUEUES),
            state: Mutex::new(WorkerState::default()),
            markers_issued: AtomicU64::new(0),
            markers_completed: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Device name as reported by the runtime.
    pub fn device_name(&self) -> String {
        self.device.name()
    }

    /// Device kind.
    pub fn kind(&self) -> DeviceKind {
        self.device.kind()
    }

    /// Memory policy used for this worker's buffers.
    pub fn memory_policy(&self) -> MemoryPolicy {
        self.memory_policy
    }

    /// Total queues, primary included.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Whether this worker can run the pipelined engines.
    pub fn supports_pipelining(&self) -> bool {
        self.queues.len() > MAX_QUEUES
    }

    fn queue(&self, idx: usize) -> &dyn CommandQueue {
        self.queues[idx % self.queues.len()].as_ref()
    }

    /// Auxiliary queue `k`, wrapping modulo the auxiliary set.
    pub fn aux_queue_index(&self, k: usize) -> usize {
        if self.queues.len() <= 1 {
            0
        } else {
            1 + (k % (self.queues.len() - 1))
        }
    }

    /// Round-robin compute queue selection for async enqueue mode.
    pub fn next_compute_queue(&self, index: u64) -> usize {
        let lanes = self.queue_concurrency.min(self.queues.len());
        (index % lanes as u64) as usize
    }

    /// Look up (or lazily allocate) the device buffer bound to an array.
    pub(crate) fn buffer_for(&self, spec: &ArraySpec) -> Result<BufferHandle> {
        let mut state = self.state.lock();
        if let Some(buf) = state.buffers.get(&spec.array.id()) {
            return Ok(Arc::clone(buf));
        }
        let buf = self
            .device
            .alloc(spec.array.len_bytes(), self.memory_policy)?;
        state.buffers.insert(spec.array.id(), Arc::clone(&buf));
        Ok(buf)
    }

    /// Bind (or re-bind) kernel arguments for `compute_id`.
    ///
    /// Idempotent: an identical (kernel, arrays, compute-id) triple reuses
    /// the cached binding. Returns true when a binding was (re)built.
    pub fn bind_arguments(
        &self,
        kernel: &str,
        specs: &[ArraySpec],
        compute_id: i64,
    ) -> Result<bool> {
        if !self.kernels.contains_key(kernel) {
            return Err(Error::dispatch(format!(
                "kernel '{}' was not compiled on device '{}'",
                kernel,
                self.device.name()
            )));
        }

        let signature: Vec<u64> = specs.iter().map(|s| s.array.id()).collect();
        {
            let state = self.state.lock();
            if let Some(cached) = state.args.get(&(kernel.to_string(), compute_id)) {
                if cached.signature == signature {
                    return Ok(false);
                }
            }
        }

        let mut buffers = Vec::with_capacity(specs.len());
        for spec in specs {
            buffers.push(self.buffer_for(spec)?);
        }

        let mut state = self.state.lock();
        state.args.insert(
            (kernel.to_string(), compute_id),
            CachedArgs {
                signature,
                args: KernelArgs { buffers },
            },
        );
        Ok(true)
    }

    /// Number of cached argument bindings.
    pub fn bound_argument_sets(&self) -> usize {
        self.state.lock().args.len()
    }

    fn cached_args(&self, kernel: &str, compute_id: i64) -> Result<KernelArgs> {
        self.state
            .lock()
            .args
            .get(&(kernel.to_string(), compute_id))
            .map(|c| c.args.clone())
            .ok_or_else(|| {
                Error::dispatch(format!(
                    "arguments for kernel '{}' (compute-id {}) were never bound",
                    kernel, compute_id
                ))
            })
    }

    /// Host-to-device transfer of one array slice.
    pub(crate) fn write_slice(
        &self,
        spec: &ArraySpec,
        item_offset: u64,
        items: u64,
        queue_idx: usize,
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        let buf = self.buffer_for(spec)?;
        self.queue(queue_idx).enqueue_write(
            &buf,
            &spec.array,
            spec.byte_offset(item_offset),
            spec.byte_len(items),
            wait,
        )
    }

    /// Device-to-host transfer of one array slice.
    pub(crate) fn read_slice(
        &self,
        spec: &ArraySpec,
        item_offset: u64,
        items: u64,
        queue_idx: usize,
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        let buf = self.buffer_for(spec)?;
        self.queue(queue_idx).enqueue_read(
            &buf,
            &spec.array,
            spec.byte_offset(item_offset),
            spec.byte_len(items),
            wait,
        )
    }

    /// Policy-driven host-to-device phase for `[offset, offset + range)`.
    ///
    /// `Read` arrays transfer whole, `PartialRead` only the slice,
    /// write-only arrays not at all.
    pub fn write_to_buffer(
        &self,
        specs: &[ArraySpec],
        offset: u64,
        range: u64,
        queue_idx: usize,
        wait: &[EventHandle],
    ) -> Result<Vec<EventHandle>> {
        let mut events = Vec::new();
        for spec in specs {
            match spec.policy {
                AccessPolicy::Read => {
                    events.push(self.write_slice(
                        spec,
                        0,
                        spec.array.len() as u64 / spec.elems_per_item.max(1) as u64,
                        queue_idx,
                        wait,
                    )?);
                }
                AccessPolicy::PartialRead => {
                    events.push(self.write_slice(spec, offset, range, queue_idx, wait)?);
                }
                AccessPolicy::Write | AccessPolicy::WriteAll => {}
            }
        }
        Ok(events)
    }

    /// Policy-driven device-to-host phase for `[offset, offset + range)`.
    pub fn read_from_buffer(
        &self,
        specs: &[ArraySpec],
        offset: u64,
        range: u64,
        queue_idx: usize,
        wait: &[EventHandle],
    ) -> Result<Vec<EventHandle>> {
        let mut events = Vec::new();
        for spec in specs {
            match spec.policy {
                AccessPolicy::Write => {
                    events.push(self.read_slice(spec, offset, range, queue_idx, wait)?);
                }
                AccessPolicy::WriteAll => {
                    events.push(self.read_slice(
                        spec,
                        0,
                        spec.array.len() as u64 / spec.elems_per_item.max(1) as u64,
                        queue_idx,
                        wait,
                    )?);
                }
                AccessPolicy::Read | AccessPolicy::PartialRead => {}
            }
        }
        Ok(events)
    }

    /// Enqueue one kernel execution over `[offset, offset + range)`.
    pub fn compute(
        &self,
        kernel: &str,
        compute_id: i64,
        offset: u64,
        range: u64,
        local_range: u64,
        queue_idx: usize,
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        let args = self.cached_args(kernel, compute_id)?;
        let handle = self
            .kernels
            .get(kernel)
            .ok_or_else(|| Error::dispatch(format!("unknown kernel '{}'", kernel)))?;
        self.queue(queue_idx).enqueue_kernel(
            handle,
            &args,
            DispatchRange {
                global_offset: offset,
                global_range: range,
                local_range,
            },
            wait,
        )
    }

    /// Run a kernel chain `repeats` times on one queue. `repeats` of 0 or 1
    /// both mean a single pass.
    pub fn compute_repeated(
        &self,
        kernels: &[String],
        compute_id: i64,
        offset: u64,
        range: u64,
        local_range: u64,
        repeats: u32,
        queue_idx: usize,
    ) -> Result<()> {
        for _ in 0..repeats.max(1) {
            for kernel in kernels {
                self.compute(kernel, compute_id, offset, range, local_range, queue_idx, &[])?;
            }
        }
        Ok(())
    }

    /// Repeat variant with a single-workgroup sync kernel between passes.
    ///
    /// The sync kernel runs under [`SYNC_COMPUTE_ID`] so it never enters the
    /// balancing statistics; its arguments must have been bound under that
    /// id beforehand.
    pub fn compute_repeated_with_sync(
        &self,
        kernels: &[String],
        sync_kernel: &str,
        compute_id: i64,
        offset: u64,
        range: u64,
        local_range: u64,
        repeats: u32,
        queue_idx: usize,
    ) -> Result<()> {
        for _ in 0..repeats.max(1) {
            for kernel in kernels {
                self.compute(kernel, compute_id, offset, range, local_range, queue_idx, &[])?;
            }
            if repeats > 1 {
                self.compute(
                    sync_kernel,
                    SYNC_COMPUTE_ID,
                    0,
                    local_range,
                    local_range,
                    queue_idx,
                    &[],
                )?;
            }
        }
        Ok(())
    }

    /// Insert a marker whose completion bumps the worker-local callback
    /// counter.
    pub fn add_counting_marker(&self, queue_idx: usize) -> Result<()> {
        let event = self.queue(queue_idx).enqueue_marker(&[])?;
        self.markers_issued.fetch_add(1, Ordering::Relaxed);
        let completed = Arc::clone(&self.markers_completed);
        event.on_complete(Box::new(move || {
            completed.fetch_add(1, Ordering::Relaxed);
        }));
        Ok(())
    }

    /// Markers issued so far.
    pub fn markers_issued(&self) -> u64 {
        self.markers_issued.load(Ordering::Relaxed)
    }

    /// Marker completion callbacks observed so far.
    pub fn markers_completed(&self) -> u64 {
        self.markers_completed.load(Ordering::Relaxed)
    }

    /// Submit pending work on one queue without waiting.
    pub fn flush(&self, queue_idx: usize) -> Result<()> {
        self.queue(queue_idx).flush()
    }

    /// Block until one queue has drained.
    pub fn finish(&self, queue_idx: usize) -> Result<()> {
        self.queue(queue_idx).finish()
    }

    /// Drain every compute queue; used by the enqueue-mode exit barrier.
    pub fn finish_compute_queues(&self) -> Result<()> {
        let lanes = self.queue_concurrency.min(self.queues.len());
        for idx in 0..lanes {
            self.queue(idx).finish()?;
        }
        Ok(())
    }

    /// Open a wall-time measurement scope.
    pub fn start_bench(&self) {
        self.state.lock().bench_started = Some(Instant::now());
    }

    /// Close the measurement scope and attribute it to `compute_id`.
    pub fn end_bench(&self, compute_id: i64) -> f64 {
        let mut state = self.state.lock();
        let ms = state
            .bench_started
            .take()
            .map(|t| t.elapsed().as_secs_f64() * 1e3)
            .unwrap_or(0.0);
        if compute_id != SYNC_COMPUTE_ID {
            state.bench_ms.insert(compute_id, ms);
        }
        ms
    }

    /// Last measured latency for `compute_id`, if any.
    pub fn bench_ms(&self, compute_id: i64) -> Option<f64> {
        self.state.lock().bench_ms.get(&compute_id).copied()
    }
}
