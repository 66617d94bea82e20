//! Job dispatch across the device set.
//!
//! The [`Orchestrator`] is the public entry point: it retains and pins host
//! arrays, consults the balancer for the per-device partition, fans the
//! call out across workers (pipelined or simple read-compute-write), joins,
//! and folds the measured latencies back into the scheduling state.

pub mod enqueue;
mod registry;

pub use enqueue::EnqueueOptions;

use crate::array::{AccessPolicy, ArraySpec};
use crate::backend::{Backend, DeviceHandle, DeviceKind, MemoryPolicy};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pipeline::{self, driver::DriverPipeline, event::EventPipeline, PipelineKind, PipelineSpec};
use crate::scheduler::{rebalance, ScheduleState};
use crate::worker::{DeviceWorker, SYNC_COMPUTE_ID};
use enqueue::EnqueueState;
use parking_lot::Mutex;
use registry::{ArrayRegistry, PinScope};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// The affinity mask is refreshed on call indices congruent to 1 mod this.
pub const AFFINITY_REFRESH_PERIOD: u64 = 255;

/// One compute call: kernels, array bindings and the index space.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub kernels: Vec<String>,
    pub repeats: u32,
    pub sync_kernel: Option<String>,
    pub arrays: Vec<ArraySpec>,
    pub global_range: u64,
    pub global_offset: u64,
    pub compute_id: i64,
    pub pipeline: Option<PipelineSpec>,
    pub local_range: u64,
}

impl JobSpec {
    /// Single-kernel job over `[0, global_range)` with the default
    /// workgroup size.
    pub fn new(kernel: &str, global_range: u64, compute_id: i64) -> Self {
        Self {
            kernels: vec![kernel.to_string()],
            repeats: 0,
            sync_kernel: None,
            arrays: Vec::new(),
            global_range,
            global_offset: 0,
            compute_id,
            pipeline: None,
            local_range: crate::config::DEFAULT_LOCAL_RANGE,
        }
    }

    /// Append a kernel to the chain.
    pub fn kernel(mut self, name: &str) -> Self {
        self.kernels.push(name.to_string());
        self
    }

    /// Append an array binding.
    pub fn array(mut self, spec: ArraySpec) -> Self {
        self.arrays.push(spec);
        self
    }

    pub fn local_range(mut self, local: u64) -> Self {
        self.local_range = local;
        self
    }

    pub fn global_offset(mut self, offset: u64) -> Self {
        self.global_offset = offset;
        self
    }

    pub fn repeats(mut self, n: u32) -> Self {
        self.repeats = n;
        self
    }

    pub fn sync_kernel(mut self, name: &str) -> Self {
        self.sync_kernel = Some(name.to_string());
        self
    }

    pub fn pipelined(mut self, kind: PipelineKind, stages: u32) -> Self {
        self.pipeline = Some(PipelineSpec::new(kind, stages));
        self
    }
}

#[derive(Debug, Default)]
struct ErrorSink {
    code: AtomicU32,
    fatal: AtomicBool,
    log: Mutex<String>,
}

impl ErrorSink {
    fn record(&self, context: &str, err: &Error) {
        self.code.fetch_add(1, Ordering::Relaxed);
        if matches!(
            err,
            Error::NoDevice | Error::Compile(_) | Error::Backend(_)
        ) {
            self.fatal.store(true, Ordering::Relaxed);
        }
        {
            use std::fmt::Write;
            let mut log = self.log.lock();
            let _ = writeln!(log, "[{}] {}", context, err);
        }
        tracing::warn!(context, error = %err, "orchestrator error");
    }

    fn code(&self) -> u32 {
        self.code.load(Ordering::Relaxed)
    }

    fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Relaxed)
    }

    fn message(&self) -> String {
        self.log.lock().clone()
    }
}

/// Multi-device compute orchestrator.
pub struct Orchestrator {
    backend: Arc<dyn Backend>,
    workers: Vec<DeviceWorker>,
    config: Config,
    schedules: Mutex<HashMap<i64, ScheduleState>>,
    registry: ArrayRegistry,
    errors: ErrorSink,
    call_count: AtomicU64,
    enqueue: Mutex<EnqueueState>,
    last_compute_id: AtomicI64,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("devices", &self.workers.len())
            .field("errors", &self.errors.code())
            .finish()
    }
}

impl Orchestrator {
    /// Build an orchestrator from the backend's device enumeration,
    /// filtered by the config's device selection.
    pub fn new(
        backend: Arc<dyn Backend>,
        kernel_source: &str,
        kernel_names: &[&str],
        config: Config,
    ) -> Result<Self> {
        config.validate()?;
        let mut devices = backend.devices(config.devices)?;

        if config.num_gpus >= 0 {
            let mut gpus_kept = 0;
            devices.retain(|d| {
                if d.kind() == DeviceKind::Gpu {
                    gpus_kept += 1;
                    gpus_kept <= config.num_gpus
                } else {
                    true
                }
            });
        }

        Self::from_device_list(backend, devices, kernel_source, kernel_names, config)
    }

    /// Build an orchestrator for an explicit device list.
    pub fn from_device_list(
        backend: Arc<dyn Backend>,
        devices: Vec<Arc<dyn DeviceHandle>>,
        kernel_source: &str,
        kernel_names: &[&str],
        config: Config,
    ) -> Result<Self> {
        config.validate()?;
        if devices.is_empty() {
            return Err(Error::NoDevice);
        }

        let mut workers = Vec::with_capacity(devices.len());
        for device in devices {
            let policy = if device.kind() == DeviceKind::Gpu && config.gpu_streaming {
                MemoryPolicy::PinnedHost
            } else {
                device.memory_policy()
            };
            workers.push(DeviceWorker::new(
                device,
                kernel_source,
                kernel_names,
                policy,
                config.queue_concurrency,
                config.no_pipelining,
            )?);
        }

        Ok(Self {
            backend,
            workers,
            config,
            schedules: Mutex::new(HashMap::new()),
            registry: ArrayRegistry::default(),
            errors: ErrorSink::default(),
            call_count: AtomicU64::new(0),
            enqueue: Mutex::new(EnqueueState::default()),
            last_compute_id: AtomicI64::new(0),
        })
    }

    /// Dispatch one compute call.
    ///
    /// Returns once all device work has drained, or - under enqueue mode -
    /// once host-side issue is complete. Failures are surfaced both as the
    /// returned error and through [`error_code`](Self::error_code) /
    /// [`error_message`](Self::error_message).
    pub fn compute(&self, job: &JobSpec) -> Result<()> {
        if self.errors.is_fatal() {
            return Err(Error::Inert);
        }
        if let Err(e) = self.validate_job(job) {
            self.errors.record("dispatch", &e);
            return Err(e);
        }

        self.registry.insert_all(&job.arrays);
        let pins = PinScope::new(&job.arrays);

        let call = self.call_count.fetch_add(1, Ordering::Relaxed);
        if call % AFFINITY_REFRESH_PERIOD == 0 {
            self.backend.refresh_affinity();
        }

        let (enqueue_opts, issue_seq) = {
            let mut enqueue = self.enqueue.lock();
            let opts = enqueue.options();
            let seq = if opts.is_some() { enqueue.next_issue() } else { 0 };
            (opts, seq)
        };

        // Pipelining is viable only when requested, allowed, single-pass
        // and every queue set carries the auxiliary queues. Enqueue mode
        // forces the simple path: the engines drain their queues, which
        // would reintroduce the host sync the mode defers.
        let pipeline_hint = match job.pipeline {
            Some(spec)
                if !self.config.no_pipelining
                    && job.repeats <= 1
                    && enqueue_opts.is_none()
                    && spec.validate().is_ok()
                    && self.workers.iter().all(|w| w.supports_pipelining()) =>
            {
                Some(spec)
            }
            _ => None,
        };
        let alignment = match pipeline_hint {
            Some(spec) => spec.stages as u64 * job.local_range,
            None => job.local_range,
        };

        let (ranges, references) = {
            let mut schedules = self.schedules.lock();
            let state = schedules
                .entry(job.compute_id)
                .or_insert_with(|| ScheduleState::new(self.workers.len()));

            if !state.initialized() {
                state.init_equal(job.global_range, alignment);
            } else {
                for (d, worker) in self.workers.iter().enumerate() {
                    if let Some(ms) = worker.bench_ms(job.compute_id) {
                        state.record_benchmark(d, ms);
                    }
                }
                rebalance(state, job.global_range, alignment, self.config.smoothing);
            }
            state.update_references(job.global_offset);
            (state.ranges().to_vec(), state.references().to_vec())
        };

        let pipeline_spec = pipeline_hint.filter(|spec| {
            let ok = pipeline::feasible(&ranges, spec.stages, job.local_range, job.repeats);
            if !ok {
                tracing::warn!(
                    stages = spec.stages,
                    local_range = job.local_range,
                    "pipelining infeasible for this partition, falling back to simple path"
                );
            }
            ok
        });

        let participants: Vec<usize> = (0..self.workers.len())
            .filter(|&d| ranges[d] > 0)
            .collect();

        let mut failures: Vec<(String, Error)> = Vec::new();
        if participants.len() == 1 {
            let d = participants[0];
            if let Err(e) = self.run_device(
                d,
                job,
                references[d],
                ranges[d],
                pipeline_spec,
                enqueue_opts,
                issue_seq,
            ) {
                failures.push((self.workers[d].device_name(), e));
            }
        } else {
            let collected: Mutex<Vec<(String, Error)>> = Mutex::new(Vec::new());
            std::thread::scope(|scope| {
                for &d in &participants {
                    let collected = &collected;
                    let reference = references[d];
                    let range = ranges[d];
                    scope.spawn(move || {
                        if let Err(e) = self.run_device(
                            d,
                            job,
                            reference,
                            range,
                            pipeline_spec,
                            enqueue_opts,
                            issue_seq,
                        ) {
                            collected
                                .lock()
                                .push((self.workers[d].device_name(), e));
                        }
                    });
                }
            });
            failures = collected.into_inner();
        }

        // fold measured latencies back into the scheduling state
        if enqueue_opts.is_none() {
            let mut schedules = self.schedules.lock();
            if let Some(state) = schedules.get_mut(&job.compute_id) {
                for &d in &participants {
                    if let Some(ms) = self.workers[d].bench_ms(job.compute_id) {
                        state.record_benchmark(d, ms);
                    }
                }
            }
        }

        if enqueue_opts.is_some() {
            self.enqueue.lock().park_pins(pins);
        } else {
            drop(pins);
        }
        self.last_compute_id.store(job.compute_id, Ordering::Relaxed);

        if !failures.is_empty() {
            for (ctx, err) in &failures {
                self.errors.record(ctx, err);
            }
            return Err(failures.remove(0).1);
        }
        Ok(())
    }

    fn validate_job(&self, job: &JobSpec) -> Result<()> {
        if job.kernels.is_empty() {
            return Err(Error::contract("a compute call needs at least one kernel"));
        }
        if job.global_range == 0 {
            return Err(Error::contract("global range must be > 0"));
        }
        if job.local_range == 0 {
            return Err(Error::contract("local range must be > 0"));
        }
        if self.workers.len() > 1
            && job
                .arrays
                .iter()
                .any(|s| s.policy == AccessPolicy::WriteAll)
        {
            // well-defined for a single writer only
            return Err(Error::contract(
                "write-all policy is not valid with multiple devices",
            ));
        }
        Ok(())
    }

    fn run_device(
        &self,
        d: usize,
        job: &JobSpec,
        reference: u64,
        range: u64,
        pipeline_spec: Option<PipelineSpec>,
        enqueue_opts: Option<EnqueueOptions>,
        issue_seq: u64,
    ) -> Result<()> {
        let worker = &self.workers[d];

        for kernel in &job.kernels {
            worker.bind_arguments(kernel, &job.arrays, job.compute_id)?;
        }
        let use_sync = job.repeats > 1 && job.sync_kernel.is_some();
        if use_sync {
            let sync = job.sync_kernel.as_deref().unwrap();
            worker.bind_arguments(sync, &job.arrays, SYNC_COMPUTE_ID)?;
        }

        if enqueue_opts.is_none() {
            worker.start_bench();
        }

        let queue = match enqueue_opts {
            Some(opts) if opts.async_queues => worker.next_compute_queue(issue_seq),
            _ => 0,
        };

        match pipeline_spec {
            Some(spec) if spec.kind == PipelineKind::Event => {
                EventPipeline {
                    worker,
                    specs: &job.arrays,
                    kernels: &job.kernels,
                    compute_id: job.compute_id,
                    offset: reference,
                    range,
                    local_range: job.local_range,
                    stages: spec.stages,
                }
                .run()?;
            }
            Some(spec) => {
                DriverPipeline {
                    worker,
                    specs: &job.arrays,
                    kernels: &job.kernels,
                    compute_id: job.compute_id,
                    offset: reference,
                    range,
                    local_range: job.local_range,
                    stages: spec.stages,
                }
                .run()?;
            }
            None => {
                worker.write_to_buffer(&job.arrays, reference, range, queue, &[])?;
                if use_sync {
                    worker.compute_repeated_with_sync(
                        &job.kernels,
                        job.sync_kernel.as_deref().unwrap(),
                        job.compute_id,
                        reference,
                        range,
                        job.local_range,
                        job.repeats,
                        queue,
                    )?;
                } else {
                    worker.compute_repeated(
                        &job.kernels,
                        job.compute_id,
                        reference,
                        range,
                        job.local_range,
                        job.repeats,
                        queue,
                    )?;
                }
                worker.read_from_buffer(&job.arrays, reference, range, queue, &[])?;
                if enqueue_opts.is_none() {
                    worker.finish(queue)?;
                }
            }
        }

        if let Some(opts) = enqueue_opts {
            if opts.fine_grained {
                worker.add_counting_marker(queue)?;
            }
        } else {
            worker.end_bench(job.compute_id);
        }

        Ok(())
    }

    /// Enter enqueue mode: subsequent compute calls return without host
    /// synchronization. Opens a benchmark scope on every device.
    pub fn enter_enqueue_mode(&self, options: EnqueueOptions) -> Result<()> {
        let mut enqueue = self.enqueue.lock();
        if !enqueue.activate(options) {
            return Err(Error::contract("enqueue mode is already active"));
        }
        for worker in &self.workers {
            worker.start_bench();
        }
        Ok(())
    }

    /// Leave enqueue mode: drains every used compute queue on every device
    /// in parallel, closes the benchmark scope of the last used compute-id
    /// and releases the parked pins.
    pub fn exit_enqueue_mode(&self) -> Result<()> {
        if !self.enqueue.lock().is_active() {
            return Err(Error::contract("enqueue mode is not active"));
        }

        let failures: Mutex<Vec<(String, Error)>> = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for worker in &self.workers {
                let failures = &failures;
                scope.spawn(move || {
                    if let Err(e) = worker.finish_compute_queues() {
                        failures.lock().push((worker.device_name(), e));
                    }
                });
            }
        });

        let last_id = self.last_compute_id.load(Ordering::Relaxed);
        {
            let mut schedules = self.schedules.lock();
            for (d, worker) in self.workers.iter().enumerate() {
                let ms = worker.end_bench(last_id);
                if ms > 0.0 {
                    if let Some(state) = schedules.get_mut(&last_id) {
                        state.record_benchmark(d, ms);
                    }
                }
            }
        }

        self.enqueue.lock().deactivate();

        let mut failures = failures.into_inner();
        if !failures.is_empty() {
            for (ctx, err) in &failures {
                self.errors.record(ctx, err);
            }
            return Err(failures.remove(0).1);
        }
        Ok(())
    }

    /// Whether enqueue mode is currently active.
    pub fn enqueue_mode_active(&self) -> bool {
        self.enqueue.lock().is_active()
    }

    /// Number of selected devices.
    pub fn device_count(&self) -> usize {
        self.workers.len()
    }

    /// Device names, in dispatch order.
    pub fn device_names(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.device_name()).collect()
    }

    /// Accumulated error count.
    pub fn error_code(&self) -> u32 {
        self.errors.code()
    }

    /// Accumulated error log.
    pub fn error_message(&self) -> String {
        self.errors.message()
    }

    /// Latest measured per-device latencies for one compute-id.
    pub fn benchmarks(&self, compute_id: i64) -> Vec<f64> {
        self.schedules
            .lock()
            .get(&compute_id)
            .map(|s| s.benchmarks().to_vec())
            .unwrap_or_default()
    }

    /// Latency history rows (newest first) for one compute-id.
    pub fn performance_history(&self, compute_id: i64) -> Vec<Vec<f64>> {
        self.schedules
            .lock()
            .get(&compute_id)
            .map(|s| s.history())
            .unwrap_or_default()
    }

    /// Current per-device partition for one compute-id.
    pub fn ranges(&self, compute_id: i64) -> Vec<u64> {
        self.schedules
            .lock()
            .get(&compute_id)
            .map(|s| s.ranges().to_vec())
            .unwrap_or_default()
    }

    /// Total markers issued across all devices.
    pub fn count_markers(&self) -> u64 {
        self.workers.iter().map(|w| w.markers_issued()).sum()
    }

    /// Total marker completion callbacks across all devices.
    pub fn count_marker_callbacks(&self) -> u64 {
        self.workers.iter().map(|w| w.markers_completed()).sum()
    }

    /// Number of retained host arrays.
    pub fn registered_arrays(&self) -> usize {
        self.registry.len()
    }

    /// Human-readable balance report for one compute-id.
    pub fn performance_report(&self, compute_id: i64) -> String {
        use std::fmt::Write;

        let schedules = self.schedules.lock();
        let Some(state) = schedules.get(&compute_id) else {
            return format!("compute id {}: no calls recorded\n", compute_id);
        };

        let total: u64 = state.ranges().iter().sum();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "compute id {} across {} device(s), {} workitems",
            compute_id,
            self.workers.len(),
            total
        );

        for (d, worker) in self.workers.iter().enumerate() {
            let range = state.ranges()[d];
            let percent = if total > 0 {
                range as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            let _ = writeln!(
                out,
                "  {:<28} {:>6.2}%  {:>10.3} ms  [{}]",
                worker.device_name(),
                percent,
                state.benchmarks()[d],
                worker.memory_policy().label()
            );
        }

        // aggregate latency distribution over the history ring
        let mut histogram = hdrhistogram::Histogram::<u64>::new(3).expect("histogram");
        for row in state.history() {
            for v in row {
                if v > 0.0 {
                    let _ = histogram.record((v * 1000.0) as u64);
                }
            }
        }
        if histogram.len() > 0 {
            let _ = writeln!(
                out,
                "  latency p50 {:.3} ms / p95 {:.3} ms over {} samples",
                histogram.value_at_quantile(0.50) as f64 / 1000.0,
                histogram.value_at_quantile(0.95) as f64 / 1000.0,
                histogram.len()
            );
        }

        out
    }
}
