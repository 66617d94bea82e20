//! SHARD - Scheduled Heterogeneous Adaptive Range Distribution
//!
//! A multi-device compute orchestrator for OpenCL-1.2-class runtimes. SHARD
//! takes a compute job - kernels over a shared set of host arrays on a
//! one-dimensional index space - and spreads the workitems across a fixed
//! set of CPUs, GPUs and accelerators, overlapping transfers with execution
//! through multi-queue pipelining while rebalancing each device's share
//! from measured throughput.
//!
//! # Quick Start
//!
//! ```no_run
//! use shard_rs::prelude::*;
//! use std::sync::Arc;
//!
//! // a backend with two simulated CPU devices
//! let backend = HostBackend::cpus(2);
//! backend.register_kernel("scale", |bufs, range| {
//!     let data: &mut [f32] = bytemuck::cast_slice_mut(&mut bufs[0][..]);
//!     for i in range.global_offset..range.global_offset + range.global_range {
//!         data[i as usize] *= 2.0;
//!     }
//! });
//!
//! let orchestrator = Orchestrator::new(
//!     backend,
//!     "__kernel void scale(__global float* data) { ... }",
//!     &["scale"],
//!     Config::default(),
//! ).unwrap();
//!
//! let data = HostArray::from_slice(&[1.0f32; 4096]);
//! let job = JobSpec::new("scale", 4096, 1)
//!     .array(ArraySpec::new(Arc::clone(&data), AccessPolicy::PartialRead, 1))
//!     .local_range(64);
//! orchestrator.compute(&job).unwrap();
//! ```
//!
//! # Features
//!
//! - **Adaptive Balancing**: per-compute-id range partitions tracking
//!   measured device throughput, with history smoothing
//! - **Pipelined Transfers**: event-DAG or driver-scheduled multi-queue
//!   overlap of read, compute and write phases
//! - **Enqueue Mode**: batched issue without per-call host sync, drained on
//!   exit, observable through queue markers
//! - **Backend Agnostic**: written against a small runtime trait surface; a
//!   reference in-process backend doubles as the CPU driver and test double

// Lint configuration
#![warn(missing_docs, missing_debug_implementations)]
#![allow(dead_code)] // During development

pub mod array;
pub mod backend;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod prelude;
pub mod scheduler;
pub mod worker;

// Re-export key types at crate root
pub use array::{AccessPolicy, ArraySpec, ElemKind, HostArray};
pub use backend::{DeviceKind, HostBackend, KindFilter, MemoryPolicy};
pub use config::{Config, ConfigBuilder};
pub use error::{Error, Result};
pub use orchestrator::{EnqueueOptions, JobSpec, Orchestrator};
pub use pipeline::PipelineKind;
