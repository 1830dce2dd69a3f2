// SPDX-License-Identifier: GPL-3.0-only

//! Capture Pipeline - stage orchestration core for camera devices
//!
//! This library lets independently developed image-processing stages (HDR,
//! auto-framing, face detection, background effects, ZSL, privacy muting)
//! hook into the capture protocol of a camera device without knowing about
//! each other.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`camera`]: Streams, buffers, fences, metadata and capture descriptors
//! - [`stage`]: The stage plug-in contract
//! - [`pipeline`]: The orchestrator driving requests and results through stages
//! - [`executor`]: Worker threads and the executor abstraction stages run on
//! - [`config`]: Runtime configuration and observable stage configuration
//! - [`gpu`]: Shared compute context (GPU device, worker, cache)
//! - [`inspector`]: Debug inspection at stage boundaries
//!
//! # Example
//!
//! ```ignore
//! let resources = SharedResources::new(GpuMode::Preferred);
//! let stages: Vec<Box<dyn Stage>> = vec![Box::new(HdrStage::new(resources.clone()))];
//! let pipeline = StagePipeline::new(stages, resources)?;
//! pipeline.initialize(&static_info, client_callbacks)?;
//! ```

pub mod camera;
pub mod config;
pub mod constants;
pub mod errors;
pub mod executor;
pub mod gpu;
pub mod inspector;
pub mod pipeline;
pub mod stage;

// Re-export commonly used types
pub use camera::{CaptureDescriptor, StreamBuffer, StreamConfiguration};
pub use config::{ObservableConfig, RuntimeConfig};
pub use errors::{PipelineError, PipelineResult};
pub use gpu::{ComputeContext, GpuMode};
pub use pipeline::{SharedResources, StagePipeline};
pub use stage::{Stage, StageCallbacks, StageResultError};
