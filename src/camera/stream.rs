// SPDX-License-Identifier: GPL-3.0-only

//! Streams and stream configurations
//!
//! A [`Stream`] is a negotiated buffer queue between the client and the
//! hardware. Streams are identified by their [`StreamId`], not by address:
//! the hardware may hand back an updated copy of a stream (new usage flags,
//! new buffer count) and it is still the same stream.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::camera::metadata::CameraMetadata;
use crate::errors::{PipelineError, PipelineResult};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque stream identity token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a token assigned by the hardware layer
    pub const fn from_raw(raw: u64) -> Self {
        StreamId(raw)
    }

    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamType {
    #[default]
    Output,
    Input,
    Bidirectional,
}

/// Pixel formats negotiated on streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Format chosen by the gralloc implementation from the usage flags
    ImplementationDefined,
    /// Flexible YUV 4:2:0
    Ycbcr420,
    /// Compressed data, e.g. JPEG
    Blob,
    /// Single-plane 16-bit Bayer
    Raw16,
    /// 8-bit greyscale
    Y8,
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::ImplementationDefined => "IMPLEMENTATION_DEFINED",
            PixelFormat::Ycbcr420 => "YCbCr_420_888",
            PixelFormat::Blob => "BLOB",
            PixelFormat::Raw16 => "RAW16",
            PixelFormat::Y8 => "Y8",
        };
        f.write_str(name)
    }
}

/// Buffer usage bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UsageFlags(u64);

impl UsageFlags {
    pub const NONE: UsageFlags = UsageFlags(0);
    pub const SW_READ_OFTEN: UsageFlags = UsageFlags(0x3);
    pub const SW_WRITE_OFTEN: UsageFlags = UsageFlags(0x30);
    pub const HW_TEXTURE: UsageFlags = UsageFlags(0x100);
    pub const HW_RENDER: UsageFlags = UsageFlags(0x200);
    pub const HW_COMPOSER: UsageFlags = UsageFlags(0x800);
    pub const HW_VIDEO_ENCODER: UsageFlags = UsageFlags(0x10000);
    pub const HW_CAMERA_WRITE: UsageFlags = UsageFlags(0x20000);
    pub const HW_CAMERA_READ: UsageFlags = UsageFlags(0x40000);

    pub const fn from_bits(bits: u64) -> Self {
        UsageFlags(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub const fn contains(&self, other: UsageFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for UsageFlags {
    type Output = UsageFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        UsageFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for UsageFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Rotation the client asks the hardware to apply to a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamRotation {
    #[default]
    Rotate0,
    Rotate90,
    Rotate180,
    Rotate270,
}

/// Negotiated buffer queue between client and hardware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    id: StreamId,
    pub stream_type: StreamType,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub usage: UsageFlags,
    /// Maximum number of buffers in flight, filled in by the hardware
    pub max_buffers: u32,
    pub rotation: StreamRotation,
}

impl Stream {
    /// Create an output stream with a fresh identity
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Self::with_id(StreamId::next(), format, width, height)
    }

    /// Create an output stream with a hardware-assigned identity
    pub fn with_id(id: StreamId, format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            id,
            stream_type: StreamType::Output,
            format,
            width,
            height,
            usage: UsageFlags::NONE,
            max_buffers: 0,
            rotation: StreamRotation::Rotate0,
        }
    }

    pub fn with_type(mut self, stream_type: StreamType) -> Self {
        self.stream_type = stream_type;
        self
    }

    pub fn with_usage(mut self, usage: UsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Whether `other` still describes what the client asked for.
    ///
    /// Usage bits and buffer counts are filled in by the hardware and are
    /// not compared.
    pub fn matches_request(&self, other: &Stream) -> bool {
        self.id == other.id
            && self.stream_type == other.stream_type
            && self.format == other.format
            && self.width == other.width
            && self.height == other.height
            && self.rotation == other.rotation
    }

    /// Wrap into the shared handle used by configurations and buffers
    pub fn into_shared(self) -> Arc<Stream> {
        Arc::new(self)
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} {} usage={:#x}",
            self.id,
            self.width,
            self.height,
            self.format,
            self.usage.bits()
        )
    }
}

/// Stream configuration operation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OperationMode {
    #[default]
    Normal,
    ConstrainedHighSpeed,
    /// Vendor-defined mode, passed through untouched
    Vendor(u32),
}

/// One stream negotiation round
///
/// The stream list never contains two streams with the same identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamConfiguration {
    streams: Vec<Arc<Stream>>,
    pub operation_mode: OperationMode,
    pub session_parameters: Option<CameraMetadata>,
}

impl StreamConfiguration {
    pub fn new(streams: Vec<Arc<Stream>>) -> PipelineResult<Self> {
        let mut config = Self::default();
        config.set_streams(streams)?;
        Ok(config)
    }

    pub fn streams(&self) -> &[Arc<Stream>] {
        &self.streams
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Identity sequence, in order
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.iter().map(|s| s.id()).collect()
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: StreamId) -> Option<&Arc<Stream>> {
        self.streams.iter().find(|s| s.id() == id)
    }

    fn position(&self, id: StreamId) -> Option<usize> {
        self.streams.iter().position(|s| s.id() == id)
    }

    /// Replace the whole stream list, rejecting duplicate identities
    pub fn set_streams(&mut self, streams: Vec<Arc<Stream>>) -> PipelineResult<()> {
        for (i, stream) in streams.iter().enumerate() {
            if streams[..i].iter().any(|s| s.id() == stream.id()) {
                return Err(PipelineError::DuplicateStream(stream.id()));
            }
        }
        self.streams = streams;
        Ok(())
    }

    /// Append a stream
    pub fn add(&mut self, stream: Arc<Stream>) -> PipelineResult<()> {
        if self.contains(stream.id()) {
            return Err(PipelineError::DuplicateStream(stream.id()));
        }
        self.streams.push(stream);
        Ok(())
    }

    /// Remove a stream, returning it
    pub fn remove(&mut self, id: StreamId) -> PipelineResult<Arc<Stream>> {
        let index = self.position(id).ok_or(PipelineError::StreamNotFound(id))?;
        Ok(self.streams.remove(index))
    }

    /// Substitute `replacement` for the stream `id`, keeping its position.
    ///
    /// Returns the stream that was replaced so the caller can restore it on
    /// the upward pass.
    pub fn replace(&mut self, id: StreamId, replacement: Arc<Stream>) -> PipelineResult<Arc<Stream>> {
        let index = self.position(id).ok_or(PipelineError::StreamNotFound(id))?;
        if replacement.id() != id && self.contains(replacement.id()) {
            return Err(PipelineError::DuplicateStream(replacement.id()));
        }
        Ok(std::mem::replace(&mut self.streams[index], replacement))
    }

    /// Mutate a stream in place (copy-on-write if it is shared)
    pub fn update_stream<F>(&mut self, id: StreamId, update: F) -> PipelineResult<()>
    where
        F: FnOnce(&mut Stream),
    {
        let index = self.position(id).ok_or(PipelineError::StreamNotFound(id))?;
        let stream = Arc::make_mut(&mut self.streams[index]);
        update(stream);
        // The identity is private, so the update cannot break uniqueness
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yuv(width: u32, height: u32) -> Arc<Stream> {
        Stream::new(PixelFormat::Ycbcr420, width, height).into_shared()
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let a = yuv(640, 480);
        let err = StreamConfiguration::new(vec![a.clone(), a.clone()]).unwrap_err();
        assert_eq!(err, PipelineError::DuplicateStream(a.id()));

        let mut config = StreamConfiguration::new(vec![a.clone()]).unwrap();
        assert!(config.add(a.clone()).is_err());
        assert_eq!(config.len(), 1);
    }

    #[test]
    fn test_replace_and_restore_keeps_position() {
        let a = yuv(640, 480);
        let b = yuv(1280, 720);
        let mut config = StreamConfiguration::new(vec![a.clone(), b.clone()]).unwrap();
        let original = config.clone();

        let substitute = yuv(1920, 1080);
        let replaced = config.replace(a.id(), substitute.clone()).unwrap();
        assert_eq!(replaced.id(), a.id());
        assert_eq!(config.stream_ids(), vec![substitute.id(), b.id()]);

        config.replace(substitute.id(), replaced).unwrap();
        assert_eq!(config, original);
    }

    #[test]
    fn test_replace_rejects_existing_identity() {
        let a = yuv(640, 480);
        let b = yuv(1280, 720);
        let mut config = StreamConfiguration::new(vec![a.clone(), b.clone()]).unwrap();
        assert!(config.replace(a.id(), b.clone()).is_err());
    }

    #[test]
    fn test_update_stream_keeps_identity() {
        let a = yuv(640, 480);
        let mut config = StreamConfiguration::new(vec![a.clone()]).unwrap();
        config
            .update_stream(a.id(), |s| {
                s.max_buffers = 4;
                s.usage |= UsageFlags::HW_CAMERA_WRITE;
            })
            .unwrap();

        let updated = config.get(a.id()).unwrap();
        assert_eq!(updated.max_buffers, 4);
        assert!(updated.usage.contains(UsageFlags::HW_CAMERA_WRITE));
        // The client's handle is untouched
        assert_eq!(a.max_buffers, 0);
    }

    #[test]
    fn test_matches_request_ignores_hardware_fields() {
        let requested = Stream::new(PixelFormat::Ycbcr420, 640, 480);
        let mut configured = requested.clone();
        configured.max_buffers = 6;
        configured.usage |= UsageFlags::HW_CAMERA_WRITE;
        assert!(requested.matches_request(&configured));

        configured.width = 1280;
        assert!(!requested.matches_request(&configured));
    }

    #[test]
    fn test_remove_missing_stream() {
        let mut config = StreamConfiguration::default();
        let id = StreamId::from_raw(9999);
        assert_eq!(config.remove(id), Err(PipelineError::StreamNotFound(id)));
    }
}
