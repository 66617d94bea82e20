//! Convenient re-exports for common SHARD types.
//!
//! This module provides a single import for most common use cases:
//! ```
//! use shard_rs::prelude::*;
//! ```

pub use crate::array::{AccessPolicy, ArraySpec, ElemKind, HostArray};
pub use crate::backend::{
    Backend, DeviceKind, HostBackend, HostDeviceSpec, KindFilter, MemoryPolicy,
};
pub use crate::config::{Config, ConfigBuilder};
pub use crate::error::{Error, Result};
pub use crate::orchestrator::{EnqueueOptions, JobSpec, Orchestrator};
pub use crate::pipeline::{PipelineKind, PipelineSpec};
