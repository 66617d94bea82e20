//! In-process reference backend.
//!
//! Implements the runtime traits with plain host memory and one thread per
//! command queue, preserving the in-order queue semantics and event wiring
//! the orchestrator relies on. Kernels are native closures registered by
//! name; "compilation" resolves names against the registry. Serves as the
//! CPU driver and as the deterministic test double.

use super::{
    Backend, BufferHandle, CommandQueue, DeviceBuffer, DeviceHandle, DeviceKind, DispatchRange,
    Event, EventHandle, KernelArgs, KernelHandle, KernelRef, KindFilter, MemoryPolicy,
};
use crate::array::HostArray;
use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Native kernel body. Receives the bound buffers in argument order and the
/// dispatch geometry; iterates its own index space.
///
/// Contract: a dispatch must not bind the same buffer twice, the executing
/// queue thread locks each bound buffer for the duration of the call.
pub type KernelFn = Arc<dyn Fn(&mut [&mut [u8]], DispatchRange) + Send + Sync>;

/// Description of one simulated device.
#[derive(Clone)]
pub struct HostDeviceSpec {
    pub name: String,
    pub kind: DeviceKind,
    pub policy: MemoryPolicy,
    /// Artificial cost per workitem, for capacity-ratio experiments.
    pub throttle_ns_per_item: u64,
}

impl std::fmt::Debug for HostDeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDeviceSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl HostDeviceSpec {
    pub fn cpu(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: DeviceKind::Cpu,
            policy: MemoryPolicy::PinnedHost,
            throttle_ns_per_item: 0,
        }
    }

    pub fn gpu(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: DeviceKind::Gpu,
            policy: MemoryPolicy::Streaming,
            throttle_ns_per_item: 0,
        }
    }

    pub fn accelerator(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: DeviceKind::Accelerator,
            policy: MemoryPolicy::Streaming,
            throttle_ns_per_item: 0,
        }
    }

    /// Slow the device down to emulate a capacity ratio.
    pub fn with_throttle_ns(mut self, ns_per_item: u64) -> Self {
        self.throttle_ns_per_item = ns_per_item;
        self
    }
}

#[derive(Default)]
struct KernelRegistry {
    map: RwLock<HashMap<String, KernelFn>>,
}

/// The in-process backend: a fixed set of simulated devices sharing one
/// kernel registry.
pub struct HostBackend {
    devices: Vec<Arc<HostDevice>>,
    registry: Arc<KernelRegistry>,
    affinity_refreshes: AtomicU64,
}

impl std::fmt::Debug for HostBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBackend")
            .field("devices", &self.devices.len())
            .finish()
    }
}

impl HostBackend {
    pub fn new(specs: Vec<HostDeviceSpec>) -> Arc<Self> {
        let registry = Arc::new(KernelRegistry::default());
        let devices = specs
            .into_iter()
            .map(|spec| {
                Arc::new(HostDevice {
                    spec,
                    registry: Arc::clone(&registry),
                })
            })
            .collect();

        Arc::new(Self {
            devices,
            registry,
            affinity_refreshes: AtomicU64::new(0),
        })
    }

    /// Convenience: `n` identical CPU devices.
    pub fn cpus(n: usize) -> Arc<Self> {
        Self::new(
            (0..n)
                .map(|i| HostDeviceSpec::cpu(&format!("host-cpu-{}", i)))
                .collect(),
        )
    }

    /// Register a native kernel under `name`. Must happen before the
    /// orchestrator compiles its program.
    pub fn register_kernel<F>(&self, name: &str, body: F)
    where
        F: Fn(&mut [&mut [u8]], DispatchRange) + Send + Sync + 'static,
    {
        self.registry
            .map
            .write()
            .insert(name.to_string(), Arc::new(body));
    }

    /// How many affinity refreshes the orchestrator has requested.
    pub fn affinity_refreshes(&self) -> u64 {
        self.affinity_refreshes.load(Ordering::Relaxed)
    }
}

impl Backend for HostBackend {
    fn devices(&self, filter: KindFilter) -> Result<Vec<Arc<dyn DeviceHandle>>> {
        Ok(self
            .devices
            .iter()
            .filter(|d| filter.accepts(d.spec.kind))
            .map(|d| Arc::clone(d) as Arc<dyn DeviceHandle>)
            .collect())
    }

    fn refresh_affinity(&self) {
        // The real runtime resets the OS affinity mask here.
        self.affinity_refreshes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("affinity mask refreshed");
    }
}

struct HostDevice {
    spec: HostDeviceSpec,
    registry: Arc<KernelRegistry>,
}

impl DeviceHandle for HostDevice {
    fn name(&self) -> String {
        self.spec.name.clone()
    }

    fn kind(&self) -> DeviceKind {
        self.spec.kind
    }

    fn memory_policy(&self) -> MemoryPolicy {
        self.spec.policy
    }

    fn create_queue(&self) -> Result<Box<dyn CommandQueue>> {
        Ok(Box::new(HostQueue::spawn(self.spec.throttle_ns_per_item)))
    }

    fn compile(&self, source: &str, kernel_names: &[&str]) -> Result<Vec<KernelRef>> {
        if source.is_empty() {
            return Err(Error::compile("empty kernel source"));
        }

        let map = self.registry.map.read();
        kernel_names
            .iter()
            .map(|name| {
                map.get(*name)
                    .map(|f| {
                        Arc::new(HostKernel {
                            name: name.to_string(),
                            body: Arc::clone(f),
                        }) as KernelRef
                    })
                    .ok_or_else(|| {
                        Error::compile(format!("kernel '{}' not found in program", name))
                    })
            })
            .collect()
    }

    fn alloc(&self, len_bytes: usize, policy: MemoryPolicy) -> Result<BufferHandle> {
        Ok(Arc::new(HostDeviceBuffer {
            data: Mutex::new(vec![0u8; len_bytes]),
            policy,
        }))
    }
}

struct HostDeviceBuffer {
    data: Mutex<Vec<u8>>,
    policy: MemoryPolicy,
}

impl DeviceBuffer for HostDeviceBuffer {
    fn len_bytes(&self) -> usize {
        self.data.lock().len()
    }

    fn policy(&self) -> MemoryPolicy {
        self.policy
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct HostKernel {
    name: String,
    body: KernelFn,
}

impl std::fmt::Debug for HostKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostKernel").field("name", &self.name).finish()
    }
}

impl KernelHandle for HostKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Default)]
struct EventInner {
    complete: bool,
    failure: Option<String>,
    callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

/// Completion state shared between the queue thread and waiters.
struct HostEvent {
    inner: Mutex<EventInner>,
    cond: Condvar,
}

impl std::fmt::Debug for HostEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEvent").finish_non_exhaustive()
    }
}

impl HostEvent {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(EventInner::default()),
            cond: Condvar::new(),
        })
    }

    fn fire(&self, failure: Option<String>) {
        let callbacks = {
            let mut inner = self.inner.lock();
            inner.complete = true;
            inner.failure = failure;
            self.cond.notify_all();
            std::mem::take(&mut inner.callbacks)
        };
        for cb in callbacks {
            cb();
        }
    }
}

impl Event for HostEvent {
    fn wait(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        while !inner.complete {
            self.cond.wait(&mut inner);
        }
        match &inner.failure {
            Some(msg) => Err(Error::backend(msg.clone())),
            None => Ok(()),
        }
    }

    fn is_complete(&self) -> bool {
        self.inner.lock().complete
    }

    fn on_complete(&self, callback: Box<dyn FnOnce() + Send>) {
        let run_now = {
            let mut inner = self.inner.lock();
            if inner.complete {
                true
            } else {
                inner.callbacks.push(callback);
                return;
            }
        };
        if run_now {
            callback();
        }
    }
}

enum CommandKind {
    Write {
        dst: BufferHandle,
        src: Arc<HostArray>,
        byte_offset: usize,
        byte_len: usize,
    },
    Read {
        src: BufferHandle,
        dst: Arc<HostArray>,
        byte_offset: usize,
        byte_len: usize,
    },
    Kernel {
        kernel: KernelRef,
        args: KernelArgs,
        range: DispatchRange,
    },
    Marker,
    Shutdown,
}

struct Command {
    kind: CommandKind,
    wait: Vec<EventHandle>,
    event: Arc<HostEvent>,
}

/// One in-order command stream, executed by a dedicated thread.
struct HostQueue {
    tx: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HostQueue {
    fn spawn(throttle_ns_per_item: u64) -> Self {
        let (tx, rx) = unbounded::<Command>();
        let worker = std::thread::Builder::new()
            .name("shard-host-queue".to_string())
            .spawn(move || {
                while let Ok(cmd) = rx.recv() {
                    if matches!(cmd.kind, CommandKind::Shutdown) {
                        cmd.event.fire(None);
                        break;
                    }

                    let mut failure = None;
                    for dep in &cmd.wait {
                        if let Err(e) = dep.wait() {
                            failure = Some(format!("dependency failed: {}", e));
                            break;
                        }
                    }

                    if failure.is_none() {
                        failure = execute(&cmd.kind, throttle_ns_per_item).err().map(|e| e.to_string());
                    }

                    cmd.event.fire(failure);
                }
            })
            .expect("failed to spawn host queue thread");

        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn submit(&self, kind: CommandKind, wait: &[EventHandle]) -> Result<EventHandle> {
        let event = HostEvent::new();
        let cmd = Command {
            kind,
            wait: wait.to_vec(),
            event: Arc::clone(&event),
        };
        self.tx
            .send(cmd)
            .map_err(|_| Error::backend("command queue thread is gone"))?;
        Ok(event)
    }
}

impl CommandQueue for HostQueue {
    fn enqueue_write(
        &self,
        dst: &BufferHandle,
        src: &Arc<HostArray>,
        byte_offset: usize,
        byte_len: usize,
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        self.submit(
            CommandKind::Write {
                dst: Arc::clone(dst),
                src: Arc::clone(src),
                byte_offset,
                byte_len,
            },
            wait,
        )
    }

    fn enqueue_read(
        &self,
        src: &BufferHandle,
        dst: &Arc<HostArray>,
        byte_offset: usize,
        byte_len: usize,
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        self.submit(
            CommandKind::Read {
                src: Arc::clone(src),
                dst: Arc::clone(dst),
                byte_offset,
                byte_len,
            },
            wait,
        )
    }

    fn enqueue_kernel(
        &self,
        kernel: &KernelRef,
        args: &KernelArgs,
        range: DispatchRange,
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        self.submit(
            CommandKind::Kernel {
                kernel: Arc::clone(kernel),
                args: args.clone(),
                range,
            },
            wait,
        )
    }

    fn enqueue_marker(&self, wait: &[EventHandle]) -> Result<EventHandle> {
        self.submit(CommandKind::Marker, wait)
    }

    fn flush(&self) -> Result<()> {
        // Commands are handed to the queue thread at enqueue time.
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        self.submit(CommandKind::Marker, &[])?.wait()
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        let _ = self.submit(CommandKind::Shutdown, &[]);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn execute(kind: &CommandKind, throttle_ns_per_item: u64) -> Result<()> {
    match kind {
        CommandKind::Write {
            dst,
            src,
            byte_offset,
            byte_len,
        } => {
            let buffer = dst
                .as_any()
                .downcast_ref::<HostDeviceBuffer>()
                .ok_or_else(|| Error::backend("foreign buffer handle"))?;
            // buffer before host array, same order as the read path
            let mut data = buffer.data.lock();
            let host = src.bytes();
            let end = byte_offset + byte_len;
            if end > host.len() || end > data.len() {
                return Err(Error::transfer(format!(
                    "write range {}..{} out of bounds",
                    byte_offset, end
                )));
            }
            data[*byte_offset..end].copy_from_slice(&host[*byte_offset..end]);
            Ok(())
        }
        CommandKind::Read {
            src,
            dst,
            byte_offset,
            byte_len,
        } => {
            let buffer = src
                .as_any()
                .downcast_ref::<HostDeviceBuffer>()
                .ok_or_else(|| Error::backend("foreign buffer handle"))?;
            let data = buffer.data.lock();
            let mut host = dst.bytes_mut();
            let end = byte_offset + byte_len;
            if end > host.len() || end > data.len() {
                return Err(Error::transfer(format!(
                    "read range {}..{} out of bounds",
                    byte_offset, end
                )));
            }
            host[*byte_offset..end].copy_from_slice(&data[*byte_offset..end]);
            Ok(())
        }
        CommandKind::Kernel {
            kernel,
            args,
            range,
        } => {
            let host_kernel = kernel
                .as_any()
                .downcast_ref::<HostKernel>()
                .ok_or_else(|| Error::backend("foreign kernel handle"))?;

            let mut guards = Vec::with_capacity(args.buffers.len());
            for buf in &args.buffers {
                let host_buf = buf
                    .as_any()
                    .downcast_ref::<HostDeviceBuffer>()
                    .ok_or_else(|| Error::backend("foreign buffer handle"))?;
                // Safety of the double-lock contract rests on distinct
                // buffers per dispatch; see KernelFn docs.
                guards.push(host_buf.data.lock());
            }
            let mut views: Vec<&mut [u8]> =
                guards.iter_mut().map(|g| g.as_mut_slice()).collect();

            (host_kernel.body)(&mut views, *range);

            if throttle_ns_per_item > 0 {
                std::thread::sleep(Duration::from_nanos(
                    throttle_ns_per_item * range.global_range,
                ));
            }
            Ok(())
        }
        CommandKind::Marker | CommandKind::Shutdown => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::HostArray;

    fn f32_slice(bytes: &mut [u8]) -> &mut [f32] {
        bytemuck::cast_slice_mut(bytes)
    }

    #[test]
    fn test_write_kernel_read_roundtrip() {
        let backend = HostBackend::cpus(1);
        backend.register_kernel("double", |bufs, range| {
            let data = f32_slice(&mut bufs[0][..]);
            for i in range.global_offset..range.global_offset + range.global_range {
                data[i as usize] *= 2.0;
            }
        });

        let devices = backend.devices(KindFilter::all()).unwrap();
        let device = &devices[0];
        let kernels = device.compile("__kernel void double();", &["double"]).unwrap();
        let queue = device.create_queue().unwrap();

        let host = HostArray::from_slice(&[1.0f32, 2.0, 3.0, 4.0]);
        let buf = device
            .alloc(host.len_bytes(), MemoryPolicy::PinnedHost)
            .unwrap();

        let args = KernelArgs {
            buffers: vec![Arc::clone(&buf)],
        };
        let range = DispatchRange {
            global_offset: 0,
            global_range: 4,
            local_range: 2,
        };

        queue
            .enqueue_write(&buf, &host, 0, host.len_bytes(), &[])
            .unwrap();
        queue.enqueue_kernel(&kernels[0], &args, range, &[]).unwrap();
        queue
            .enqueue_read(&buf, &host, 0, host.len_bytes(), &[])
            .unwrap();
        queue.finish().unwrap();

        assert_eq!(host.to_vec::<f32>(), vec![2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_unknown_kernel_is_compile_error() {
        let backend = HostBackend::cpus(1);
        let devices = backend.devices(KindFilter::all()).unwrap();
        let err = devices[0].compile("src", &["missing"]).unwrap_err();
        assert!(matches!(err, Error::Compile(_)));
    }

    #[test]
    fn test_event_dependencies_order_across_queues() {
        let backend = HostBackend::cpus(1);
        backend.register_kernel("add_one", |bufs, range| {
            let data = f32_slice(&mut bufs[0][..]);
            for i in range.global_offset..range.global_offset + range.global_range {
                data[i as usize] += 1.0;
            }
        });

        let devices = backend.devices(KindFilter::all()).unwrap();
        let device = &devices[0];
        let kernels = device.compile("src", &["add_one"]).unwrap();
        let q1 = device.create_queue().unwrap();
        let q2 = device.create_queue().unwrap();

        let host = HostArray::from_slice(&[0.0f32; 8]);
        let buf = device
            .alloc(host.len_bytes(), MemoryPolicy::PinnedHost)
            .unwrap();
        let args = KernelArgs {
            buffers: vec![Arc::clone(&buf)],
        };
        let range = DispatchRange {
            global_offset: 0,
            global_range: 8,
            local_range: 4,
        };

        let w = q1
            .enqueue_write(&buf, &host, 0, host.len_bytes(), &[])
            .unwrap();
        let k = q2.enqueue_kernel(&kernels[0], &args, range, &[w]).unwrap();
        let r = q1
            .enqueue_read(&buf, &host, 0, host.len_bytes(), &[k])
            .unwrap();
        r.wait().unwrap();

        assert_eq!(host.to_vec::<f32>(), vec![1.0; 8]);
    }

    #[test]
    fn test_marker_callback_fires() {
        let backend = HostBackend::cpus(1);
        let devices = backend.devices(KindFilter::all()).unwrap();
        let queue = devices[0].create_queue().unwrap();

        let hits = Arc::new(AtomicU64::new(0));
        let marker = queue.enqueue_marker(&[]).unwrap();
        let hits2 = Arc::clone(&hits);
        marker.on_complete(Box::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        marker.wait().unwrap();
        // fire() runs callbacks before waiters wake, so this is stable
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_out_of_bounds_transfer_fails() {
        let backend = HostBackend::cpus(1);
        let devices = backend.devices(KindFilter::all()).unwrap();
        let device = &devices[0];
        let queue = device.create_queue().unwrap();

        let host = HostArray::from_slice(&[0u8; 4]);
        let buf = device.alloc(4, MemoryPolicy::PinnedHost).unwrap();
        let ev = queue.enqueue_write(&buf, &host, 0, 64, &[]).unwrap();
        assert!(ev.wait().is_err());
    }

    #[test]
    fn test_filtered_enumeration() {
        let backend = HostBackend::new(vec![
            HostDeviceSpec::cpu("c0"),
            HostDeviceSpec::gpu("g0"),
            HostDeviceSpec::accelerator("a0"),
        ]);
        assert_eq!(backend.devices(KindFilter::all()).unwrap().len(), 3);
        assert_eq!(backend.devices(KindFilter::gpu_only()).unwrap().len(), 1);
        assert_eq!(backend.devices(KindFilter::default()).unwrap().len(), 0);
    }
}
