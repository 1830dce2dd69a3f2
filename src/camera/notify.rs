// SPDX-License-Identifier: GPL-3.0-only

//! Asynchronous device notifications

use std::fmt;

use crate::camera::stream::StreamId;

/// Error classes reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The device is unusable; the session must be closed
    Device,
    /// The whole request failed; no result metadata or buffers will follow
    Request,
    /// Result metadata for the frame will not be delivered
    Result,
    /// A single stream buffer for the frame failed
    Buffer,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Device => "device",
            ErrorCode::Request => "request",
            ErrorCode::Result => "result",
            ErrorCode::Buffer => "buffer",
        }
    }
}

/// Message delivered through the notify path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyMessage {
    /// Exposure started for a frame
    Shutter { frame_number: u32, timestamp_ns: u64 },
    /// Something failed; `stream` is set for buffer errors only
    Error {
        frame_number: u32,
        stream: Option<StreamId>,
        code: ErrorCode,
    },
}

impl NotifyMessage {
    pub fn shutter(frame_number: u32, timestamp_ns: u64) -> Self {
        NotifyMessage::Shutter {
            frame_number,
            timestamp_ns,
        }
    }

    pub fn error(frame_number: u32, code: ErrorCode) -> Self {
        NotifyMessage::Error {
            frame_number,
            stream: None,
            code,
        }
    }

    pub fn buffer_error(frame_number: u32, stream: StreamId) -> Self {
        NotifyMessage::Error {
            frame_number,
            stream: Some(stream),
            code: ErrorCode::Buffer,
        }
    }

    pub fn frame_number(&self) -> u32 {
        match self {
            NotifyMessage::Shutter { frame_number, .. } => *frame_number,
            NotifyMessage::Error { frame_number, .. } => *frame_number,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, NotifyMessage::Error { .. })
    }
}

impl fmt::Display for NotifyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyMessage::Shutter {
                frame_number,
                timestamp_ns,
            } => write!(f, "shutter frame={} ts={}", frame_number, timestamp_ns),
            NotifyMessage::Error {
                frame_number,
                stream: Some(stream),
                code,
            } => write!(f, "{} error frame={} {}", code.as_str(), frame_number, stream),
            NotifyMessage::Error {
                frame_number,
                stream: None,
                code,
            } => write!(f, "{} error frame={}", code.as_str(), frame_number),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_number_and_display() {
        let shutter = NotifyMessage::shutter(4, 1_000);
        assert_eq!(shutter.frame_number(), 4);
        assert!(!shutter.is_error());
        assert_eq!(shutter.to_string(), "shutter frame=4 ts=1000");

        let stream = StreamId::from_raw(3);
        let err = NotifyMessage::buffer_error(5, stream);
        assert!(err.is_error());
        assert_eq!(err.to_string(), "buffer error frame=5 stream#3");
        assert_eq!(
            NotifyMessage::error(6, ErrorCode::Request).to_string(),
            "request error frame=6"
        );
    }
}
