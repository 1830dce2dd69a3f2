// SPDX-License-Identifier: GPL-3.0-only

//! Capture descriptors: the request/result envelope traveling through stages
//!
//! A descriptor is either a request (client → hardware) or a result
//! (hardware → client). Both carry a frame number, an optional metadata block
//! and a set of output buffers with at most one entry per stream.

use std::fmt;

use crate::camera::buffer::StreamBuffer;
use crate::camera::metadata::{CameraMetadata, MetadataType, Tag};
use crate::camera::stream::StreamId;
use crate::errors::{PipelineError, PipelineResult};

/// Direction of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Request,
    Result,
}

/// Face rectangle in active-array coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FaceRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    /// Detection confidence in `0.0..=1.0`
    pub score: f32,
}

/// Per-frame data exchanged between stages, never sent to the client
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureMetadata {
    /// HDR ratio computed by the stage that merged the exposures
    pub hdr_ratio: Option<f32>,
    /// Faces found by a face detection stage
    pub faces: Option<Vec<FaceRect>>,
}

/// Request or result flowing through the pipeline
#[derive(Debug)]
pub struct CaptureDescriptor {
    kind: DescriptorKind,
    frame_number: u32,
    metadata: Option<CameraMetadata>,
    input_buffer: Option<StreamBuffer>,
    output_buffers: Vec<StreamBuffer>,
    partial_result: u32,
    feature_metadata: FeatureMetadata,
}

impl CaptureDescriptor {
    /// Create a request without settings
    pub fn request(frame_number: u32) -> Self {
        Self::new(DescriptorKind::Request, frame_number, 0)
    }

    /// Create a result delivery. `partial_result` is 0 for buffer-only
    /// deliveries, otherwise the 1-based index of this metadata part.
    pub fn result(frame_number: u32, partial_result: u32) -> Self {
        Self::new(DescriptorKind::Result, frame_number, partial_result)
    }

    fn new(kind: DescriptorKind, frame_number: u32, partial_result: u32) -> Self {
        Self {
            kind,
            frame_number,
            metadata: None,
            input_buffer: None,
            output_buffers: Vec::new(),
            partial_result,
            feature_metadata: FeatureMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: CameraMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    pub fn is_request(&self) -> bool {
        self.kind == DescriptorKind::Request
    }

    pub fn is_result(&self) -> bool {
        self.kind == DescriptorKind::Result
    }

    pub fn frame_number(&self) -> u32 {
        self.frame_number
    }

    pub fn partial_result(&self) -> u32 {
        self.partial_result
    }

    /// Whether this delivery carries the last metadata part of its frame
    pub fn is_final_metadata(&self, partial_result_count: u32) -> bool {
        self.is_result() && self.partial_result == partial_result_count
    }

    // ===== Metadata =====

    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    pub fn metadata(&self) -> Option<&CameraMetadata> {
        self.metadata.as_ref()
    }

    pub fn metadata_mut(&mut self) -> Option<&mut CameraMetadata> {
        self.metadata.as_mut()
    }

    /// Replace the metadata block, returning the previous one
    pub fn set_metadata(&mut self, metadata: Option<CameraMetadata>) -> Option<CameraMetadata> {
        std::mem::replace(&mut self.metadata, metadata)
    }

    pub fn get_metadata<T: MetadataType>(&self, tag: Tag) -> Option<&[T]> {
        self.metadata.as_ref().and_then(|m| m.get::<T>(tag))
    }

    /// Update a tag, creating the metadata block if the descriptor has none
    pub fn update_metadata<T: MetadataType>(&mut self, tag: Tag, values: impl Into<Vec<T>>) {
        self.metadata
            .get_or_insert_with(CameraMetadata::new)
            .update::<T>(tag, values);
    }

    pub fn delete_metadata(&mut self, tag: Tag) -> bool {
        self.metadata.as_mut().is_some_and(|m| m.delete(tag))
    }

    pub fn feature_metadata(&self) -> &FeatureMetadata {
        &self.feature_metadata
    }

    pub fn feature_metadata_mut(&mut self) -> &mut FeatureMetadata {
        &mut self.feature_metadata
    }

    // ===== Buffers =====

    pub fn input_buffer(&self) -> Option<&StreamBuffer> {
        self.input_buffer.as_ref()
    }

    pub fn set_input_buffer(&mut self, buffer: Option<StreamBuffer>) -> Option<StreamBuffer> {
        std::mem::replace(&mut self.input_buffer, buffer)
    }

    pub fn num_output_buffers(&self) -> usize {
        self.output_buffers.len()
    }

    pub fn output_buffers(&self) -> &[StreamBuffer] {
        &self.output_buffers
    }

    /// Mutable access to the existing entries; the set itself cannot change
    pub fn output_buffers_mut(&mut self) -> &mut [StreamBuffer] {
        &mut self.output_buffers
    }

    pub fn has_output_buffer(&self, stream: StreamId) -> bool {
        self.output_buffer(stream).is_some()
    }

    pub fn output_buffer(&self, stream: StreamId) -> Option<&StreamBuffer> {
        self.output_buffers.iter().find(|b| b.stream_id() == stream)
    }

    pub fn output_buffer_mut(&mut self, stream: StreamId) -> Option<&mut StreamBuffer> {
        self.output_buffers
            .iter_mut()
            .find(|b| b.stream_id() == stream)
    }

    /// Add an entry; a second entry for the same stream is rejected
    pub fn append_output_buffer(&mut self, buffer: StreamBuffer) -> PipelineResult<()> {
        if self.has_output_buffer(buffer.stream_id()) {
            return Err(PipelineError::DuplicateBuffer(buffer.stream_id()));
        }
        self.output_buffers.push(buffer);
        Ok(())
    }

    pub fn remove_output_buffer(&mut self, stream: StreamId) -> Option<StreamBuffer> {
        let index = self
            .output_buffers
            .iter()
            .position(|b| b.stream_id() == stream)?;
        Some(self.output_buffers.remove(index))
    }

    /// Take every output entry out of the descriptor
    pub fn take_output_buffers(&mut self) -> Vec<StreamBuffer> {
        std::mem::take(&mut self.output_buffers)
    }

    /// Replace the output entries, rejecting duplicate streams
    pub fn set_output_buffers(&mut self, buffers: Vec<StreamBuffer>) -> PipelineResult<()> {
        for (i, buffer) in buffers.iter().enumerate() {
            if buffers[..i]
                .iter()
                .any(|b| b.stream_id() == buffer.stream_id())
            {
                return Err(PipelineError::DuplicateBuffer(buffer.stream_id()));
            }
        }
        self.output_buffers = buffers;
        Ok(())
    }

    /// Stream identities of the output entries, in order
    pub fn output_stream_ids(&self) -> Vec<StreamId> {
        self.output_buffers.iter().map(|b| b.stream_id()).collect()
    }
}

impl fmt::Display for CaptureDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DescriptorKind::Request => "request",
            DescriptorKind::Result => "result",
        };
        write!(
            f,
            "{} frame={} partial={} metadata={} buffers=[",
            kind,
            self.frame_number,
            self.partial_result,
            self.metadata.as_ref().map_or(0, CameraMetadata::len),
        )?;
        for (i, buffer) in self.output_buffers.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{:?}", buffer.stream_id(), buffer.status)?;
        }
        write!(f, "]")
    }
}
