// SPDX-License-Identifier: GPL-3.0-only

//! Camera data model shared by the orchestrator and its stages
//!
//! - [`stream`]: streams and stream configurations
//! - [`buffer`]: per-stream buffer entries
//! - [`fence`]: acquire/release fences guarding buffer memory
//! - [`capture`]: capture requests and results
//! - [`metadata`]: typed key/value metadata blocks
//! - [`notify`]: shutter and error notifications

pub mod buffer;
pub mod capture;
pub mod fence;
pub mod metadata;
pub mod notify;
pub mod stream;

pub use buffer::{BufferHandle, BufferStatus, StreamBuffer};
pub use capture::{CaptureDescriptor, DescriptorKind, FaceRect, FeatureMetadata};
pub use fence::{Fence, FenceSignaler, FenceStatus};
pub use metadata::{CameraMetadata, MetadataType, MetadataValue, Rational, Tag, tags};
pub use notify::{ErrorCode, NotifyMessage};
pub use stream::{
    OperationMode, PixelFormat, Stream, StreamConfiguration, StreamId, StreamRotation, StreamType,
    UsageFlags,
};
