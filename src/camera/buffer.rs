// SPDX-License-Identifier: GPL-3.0-only

//! Buffer entries carried by capture descriptors

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::camera::fence::Fence;
use crate::camera::stream::{Stream, StreamId};
use crate::errors::PipelineResult;

/// Opaque hardware buffer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(u64);

impl BufferHandle {
    pub const fn from_raw(raw: u64) -> Self {
        BufferHandle(raw)
    }

    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer@{:#x}", self.0)
    }
}

/// Terminal status of a buffer entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferStatus {
    #[default]
    Ok,
    Error,
}

/// One stream's buffer inside one capture descriptor
#[derive(Debug)]
pub struct StreamBuffer {
    stream: Arc<Stream>,
    pub buffer: BufferHandle,
    pub status: BufferStatus,
    acquire_fence: Option<Fence>,
    release_fence: Option<Fence>,
}

impl StreamBuffer {
    pub fn new(stream: Arc<Stream>, buffer: BufferHandle) -> Self {
        Self {
            stream,
            buffer,
            status: BufferStatus::Ok,
            acquire_fence: None,
            release_fence: None,
        }
    }

    pub fn with_acquire_fence(mut self, fence: Fence) -> Self {
        self.acquire_fence = Some(fence);
        self
    }

    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream.id()
    }

    pub fn is_error(&self) -> bool {
        self.status == BufferStatus::Error
    }

    /// Set the terminal error status
    pub fn mark_error(&mut self) {
        self.status = BufferStatus::Error;
    }

    pub fn acquire_fence(&self) -> Option<&Fence> {
        self.acquire_fence.as_ref()
    }

    pub fn take_acquire_fence(&mut self) -> Option<Fence> {
        self.acquire_fence.take()
    }

    pub fn set_acquire_fence(&mut self, fence: Option<Fence>) {
        self.acquire_fence = fence;
    }

    pub fn release_fence(&self) -> Option<&Fence> {
        self.release_fence.as_ref()
    }

    pub fn take_release_fence(&mut self) -> Option<Fence> {
        self.release_fence.take()
    }

    pub fn set_release_fence(&mut self, fence: Option<Fence>) {
        self.release_fence = fence;
    }

    /// Wait until the buffer memory may be touched.
    ///
    /// On success the acquire fence is consumed. On timeout or fence error
    /// the entry is marked as failed and the unresolved fence is handed back
    /// as the release fence, so whoever recycles the buffer still waits on it.
    pub fn wait_acquire_fence(&mut self, timeout: Duration) -> PipelineResult<()> {
        let Some(fence) = self.acquire_fence.take() else {
            return Ok(());
        };

        match fence.wait(timeout) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    stream = %self.stream.id(),
                    buffer = %self.buffer,
                    error = %e,
                    "Acquire fence not ready, marking buffer as failed"
                );
                self.status = BufferStatus::Error;
                self.release_fence = Some(fence);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::stream::PixelFormat;

    fn entry() -> StreamBuffer {
        let stream = Stream::new(PixelFormat::Blob, 4096, 1).into_shared();
        StreamBuffer::new(stream, BufferHandle::from_raw(0x10))
    }

    #[test]
    fn test_wait_without_fence_is_ready() {
        let mut buffer = entry();
        assert!(buffer.wait_acquire_fence(Duration::ZERO).is_ok());
        assert!(!buffer.is_error());
    }

    #[test]
    fn test_signaled_fence_is_consumed() {
        let mut buffer = entry().with_acquire_fence(Fence::signaled());
        assert!(buffer.wait_acquire_fence(Duration::from_millis(10)).is_ok());
        assert!(buffer.acquire_fence().is_none());
        assert!(buffer.release_fence().is_none());
    }

    #[test]
    fn test_timeout_marks_error_and_keeps_fence() {
        let (fence, _signaler) = Fence::pair();
        let mut buffer = entry().with_acquire_fence(fence);

        assert!(buffer.wait_acquire_fence(Duration::from_millis(5)).is_err());
        assert_eq!(buffer.status, BufferStatus::Error);
        assert!(buffer.acquire_fence().is_none());
        assert!(
            buffer.release_fence().is_some(),
            "Unresolved fence must travel back as the release fence"
        );
    }
}
