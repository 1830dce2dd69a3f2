// SPDX-License-Identifier: GPL-3.0-only

//! Debug inspection of descriptors between stages
//!
//! An inspector sees every request before and after each stage, and every
//! result on its way back up. Position `k` is the boundary between stage
//! `k-1` and stage `k`: requests are seen at `0` before the first stage and
//! at `N` after the last; results are seen at `N` before the last stage runs
//! and at `0` once the first stage has passed them on.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::camera::buffer::StreamBuffer;
use crate::camera::capture::{CaptureDescriptor, DescriptorKind, FeatureMetadata};
use crate::camera::metadata::CameraMetadata;

/// Restricted view of a descriptor handed to an inspector.
///
/// Values may be read and overwritten, but metadata presence and the set of
/// buffer entries are fixed.
pub struct CaptureView<'a> {
    descriptor: &'a mut CaptureDescriptor,
}

impl<'a> CaptureView<'a> {
    pub(crate) fn new(descriptor: &'a mut CaptureDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn kind(&self) -> DescriptorKind {
        self.descriptor.kind()
    }

    pub fn frame_number(&self) -> u32 {
        self.descriptor.frame_number()
    }

    pub fn partial_result(&self) -> u32 {
        self.descriptor.partial_result()
    }

    pub fn metadata(&self) -> Option<&CameraMetadata> {
        self.descriptor.metadata()
    }

    pub fn metadata_mut(&mut self) -> Option<&mut CameraMetadata> {
        self.descriptor.metadata_mut()
    }

    pub fn buffers(&self) -> &[StreamBuffer] {
        self.descriptor.output_buffers()
    }

    pub fn buffers_mut(&mut self) -> &mut [StreamBuffer] {
        self.descriptor.output_buffers_mut()
    }

    pub fn feature_metadata(&self) -> &FeatureMetadata {
        self.descriptor.feature_metadata()
    }
}

impl fmt::Display for CaptureView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.descriptor, f)
    }
}

/// Observer called at every stage boundary
pub trait DebugInspector: Send + Sync {
    fn inspect_request(&self, position: usize, view: &mut CaptureView<'_>);

    fn inspect_result(&self, position: usize, view: &mut CaptureView<'_>);
}

/// Logs a one-line summary of the descriptor at every boundary
#[derive(Debug, Default)]
pub struct TracingInspector;

impl DebugInspector for TracingInspector {
    fn inspect_request(&self, position: usize, view: &mut CaptureView<'_>) {
        debug!(position, frame = view.frame_number(), "inspect {}", view);
    }

    fn inspect_result(&self, position: usize, view: &mut CaptureView<'_>) {
        debug!(position, frame = view.frame_number(), "inspect {}", view);
    }
}

/// One boundary crossing seen by [`RecordingInspector`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inspection {
    pub kind: DescriptorKind,
    pub position: usize,
    pub frame_number: u32,
}

/// Keeps every boundary crossing in order of observation
#[derive(Debug, Default)]
pub struct RecordingInspector {
    seen: Mutex<Vec<Inspection>>,
}

impl RecordingInspector {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, position: usize, view: &CaptureView<'_>) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Inspection {
                kind: view.kind(),
                position,
                frame_number: view.frame_number(),
            });
    }

    pub fn inspections(&self) -> Vec<Inspection> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Positions observed for one frame in one direction, in order
    pub fn positions(&self, kind: DescriptorKind, frame_number: u32) -> Vec<usize> {
        self.inspections()
            .into_iter()
            .filter(|i| i.kind == kind && i.frame_number == frame_number)
            .map(|i| i.position)
            .collect()
    }

    pub fn clear(&self) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl DebugInspector for RecordingInspector {
    fn inspect_request(&self, position: usize, view: &mut CaptureView<'_>) {
        self.record(position, view);
    }

    fn inspect_result(&self, position: usize, view: &mut CaptureView<'_>) {
        self.record(position, view);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::buffer::{BufferHandle, BufferStatus};
    use crate::camera::metadata::tags;
    use crate::camera::stream::{PixelFormat, Stream};

    #[test]
    fn test_view_edits_values_in_place() {
        let stream = Stream::new(PixelFormat::Ycbcr420, 320, 240).into_shared();
        let mut result = CaptureDescriptor::result(8, 1).with_metadata(CameraMetadata::new());
        result
            .append_output_buffer(StreamBuffer::new(stream, BufferHandle::from_raw(1)))
            .unwrap();

        {
            let mut view = CaptureView::new(&mut result);
            if let Some(md) = view.metadata_mut() {
                md.update::<i32>(tags::REQUEST_ID, vec![77]);
            }
            for buffer in view.buffers_mut() {
                buffer.mark_error();
            }
            assert_eq!(view.buffers().len(), 1);
        }

        assert_eq!(result.get_metadata::<i32>(tags::REQUEST_ID), Some(&[77][..]));
        assert_eq!(result.output_buffers()[0].status, BufferStatus::Error);
    }

    #[test]
    fn test_recording_inspector_filters_by_frame() {
        let inspector = RecordingInspector::new();
        let mut a = CaptureDescriptor::request(1);
        let mut b = CaptureDescriptor::request(2);
        inspector.inspect_request(0, &mut CaptureView::new(&mut a));
        inspector.inspect_request(0, &mut CaptureView::new(&mut b));
        inspector.inspect_request(1, &mut CaptureView::new(&mut a));

        assert_eq!(inspector.positions(DescriptorKind::Request, 1), vec![0, 1]);
        assert_eq!(inspector.positions(DescriptorKind::Result, 1), Vec::<usize>::new());
        inspector.clear();
        assert!(inspector.inspections().is_empty());
    }
}
