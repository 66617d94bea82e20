//! Compute-runtime interface.
//!
//! The orchestrator core is written against these traits, which mirror the
//! surface of an OpenCL 1.2-class runtime: device enumeration with kind
//! codes, in-order command queues, program compilation from a single source
//! string, buffer allocation under two memory policies, non-blocking
//! transfers with optional event lists, markers, flush and finish. The
//! bundled [`host`] backend implements them in-process and doubles as the
//! CPU driver and the test double.

pub mod host;

use crate::array::HostArray;
use crate::error::Result;
use std::sync::Arc;

pub use host::{HostBackend, HostDeviceSpec};

/// Broad device classification reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Accelerator,
}

/// Host-visible memory policy of a device's buffers.
///
/// `PinnedHost` is zero-copy on integrated devices; `Streaming` uses explicit
/// DMA on discrete devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPolicy {
    PinnedHost,
    Streaming,
}

impl MemoryPolicy {
    /// Short label used by performance reports.
    pub fn label(self) -> &'static str {
        match self {
            MemoryPolicy::PinnedHost => "stream",
            MemoryPolicy::Streaming => "gddr",
        }
    }
}

/// Explicit device-kind selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindFilter {
    pub cpu: bool,
    pub gpu: bool,
    pub accelerator: bool,
}

impl KindFilter {
    /// Select every device kind.
    pub fn all() -> Self {
        Self {
            cpu: true,
            gpu: true,
            accelerator: true,
        }
    }

    /// Select only CPUs.
    pub fn cpu_only() -> Self {
        Self {
            cpu: true,
            ..Self::default()
        }
    }

    /// Select only GPUs.
    pub fn gpu_only() -> Self {
        Self {
            gpu: true,
            ..Self::default()
        }
    }

    /// Parse a legacy selection string. Case-insensitive; any of "cpu",
    /// "gpu", "acc" may appear anywhere in the string.
    pub fn parse(selection: &str) -> Self {
        let lower = selection.to_ascii_lowercase();
        Self {
            cpu: lower.contains("cpu"),
            gpu: lower.contains("gpu"),
            accelerator: lower.contains("acc"),
        }
    }

    /// Whether this filter accepts the given kind.
    pub fn accepts(&self, kind: DeviceKind) -> bool {
        match kind {
            DeviceKind::Cpu => self.cpu,
            DeviceKind::Gpu => self.gpu,
            DeviceKind::Accelerator => self.accelerator,
        }
    }

    /// True when no kind is selected.
    pub fn is_empty(&self) -> bool {
        !(self.cpu || self.gpu || self.accelerator)
    }
}

/// Completion handle for one enqueued command.
pub trait Event: Send + Sync + std::fmt::Debug {
    /// Block until the command has completed.
    fn wait(&self) -> Result<()>;

    /// Non-blocking completion probe.
    fn is_complete(&self) -> bool;

    /// Register a callback to run when the command completes. Runs
    /// immediately if the command already completed.
    fn on_complete(&self, callback: Box<dyn FnOnce() + Send>);
}

/// Shared event handle.
pub type EventHandle = Arc<dyn Event>;

/// Device-side buffer handle.
pub trait DeviceBuffer: Send + Sync {
    fn len_bytes(&self) -> usize;
    fn policy(&self) -> MemoryPolicy;

    /// Downcast support for backend implementations.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Shared buffer handle.
pub type BufferHandle = Arc<dyn DeviceBuffer>;

/// Compiled kernel handle, retrieved by name from a compiled program.
pub trait KernelHandle: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Downcast support for backend implementations.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Shared kernel handle.
pub type KernelRef = Arc<dyn KernelHandle>;

/// Ordered buffer bindings for one dispatch.
#[derive(Clone, Default)]
pub struct KernelArgs {
    pub buffers: Vec<BufferHandle>,
}

impl std::fmt::Debug for KernelArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelArgs")
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

/// Geometry of one kernel dispatch over a 1-D index space.
#[derive(Debug, Clone, Copy)]
pub struct DispatchRange {
    pub global_offset: u64,
    pub global_range: u64,
    pub local_range: u64,
}

/// One in-order command stream on a device.
///
/// Order of enqueue equals order of execution within a queue; ordering
/// across queues is only what the event lists impose.
pub trait CommandQueue: Send + Sync {
    /// Non-blocking host-to-device transfer of a byte range.
    fn enqueue_write(
        &self,
        dst: &BufferHandle,
        src: &Arc<HostArray>,
        byte_offset: usize,
        byte_len: usize,
        wait: &[EventHandle],
    ) -> Result<EventHandle>;

    /// Non-blocking device-to-host transfer of a byte range.
    fn enqueue_read(
        &self,
        src: &BufferHandle,
        dst: &Arc<HostArray>,
        byte_offset: usize,
        byte_len: usize,
        wait: &[EventHandle],
    ) -> Result<EventHandle>;

    /// Non-blocking kernel dispatch.
    fn enqueue_kernel(
        &self,
        kernel: &KernelRef,
        args: &KernelArgs,
        range: DispatchRange,
        wait: &[EventHandle],
    ) -> Result<EventHandle>;

    /// Zero-work marker observing completion of everything enqueued before
    /// it (plus the given wait list).
    fn enqueue_marker(&self, wait: &[EventHandle]) -> Result<EventHandle>;

    /// Submit enqueued work to the device without waiting.
    fn flush(&self) -> Result<()>;

    /// Block until every enqueued command has completed.
    fn finish(&self) -> Result<()>;
}

/// One physical compute device.
pub trait DeviceHandle: Send + Sync {
    fn name(&self) -> String;
    fn kind(&self) -> DeviceKind;
    fn memory_policy(&self) -> MemoryPolicy;

    /// Create a new in-order command queue.
    fn create_queue(&self) -> Result<Box<dyn CommandQueue>>;

    /// Compile `source` and retrieve the named kernels, in order.
    fn compile(&self, source: &str, kernel_names: &[&str]) -> Result<Vec<KernelRef>>;

    /// Allocate a device buffer.
    fn alloc(&self, len_bytes: usize, policy: MemoryPolicy) -> Result<BufferHandle>;
}

/// Entry point of a compute runtime: enumeration plus process-level hooks.
pub trait Backend: Send + Sync {
    /// Enumerate devices matching the filter.
    fn devices(&self, filter: KindFilter) -> Result<Vec<Arc<dyn DeviceHandle>>>;

    /// Reset the process affinity mask to all available logical processors.
    fn refresh_affinity(&self);

    /// Number of logical processors visible to the runtime.
    fn logical_processors(&self) -> usize {
        num_cpus::get()
    }
}
