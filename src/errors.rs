// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the capture pipeline

use std::fmt;

use crate::camera::stream::StreamId;

/// Result type alias using PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Pipeline operation names, used to attribute stage failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Initialize,
    ConfigureStreams,
    OnConfiguredStreams,
    ConstructDefaultRequestSettings,
    ProcessCaptureRequest,
    ProcessCaptureResult,
    Notify,
    Flush,
}

impl Operation {
    /// Whether a stage failure in this operation aborts the capture session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Operation::Initialize | Operation::ConfigureStreams | Operation::OnConfiguredStreams
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Initialize => "initialize",
            Operation::ConfigureStreams => "configure_streams",
            Operation::OnConfiguredStreams => "on_configured_streams",
            Operation::ConstructDefaultRequestSettings => "construct_default_request_settings",
            Operation::ProcessCaptureRequest => "process_capture_request",
            Operation::ProcessCaptureResult => "process_capture_result",
            Operation::Notify => "notify",
            Operation::Flush => "flush",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main pipeline error type
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// A single stage failed an operation (fatal operations stop here)
    StageFailed {
        stage: String,
        operation: Operation,
        reason: String,
    },
    /// One or more stages failed a non-fatal operation; every stage was still visited
    StageFailures {
        operation: Operation,
        stages: Vec<String>,
    },
    /// A stream with the same identity is already part of the configuration
    DuplicateStream(StreamId),
    /// The stream is not part of the configuration
    StreamNotFound(StreamId),
    /// The upward pass did not restore the client's stream list
    StreamsMismatch { expected: Vec<StreamId>, actual: Vec<StreamId> },
    /// A client stream came back with different dimensions or format
    StreamAltered(StreamId),
    /// The descriptor already carries a buffer for this stream
    DuplicateBuffer(StreamId),
    /// Pipeline used before a successful initialize
    NotInitialized,
    /// Pipeline initialized twice
    AlreadyInitialized,
    /// A previous initialize failed; the pipeline must be rebuilt
    InitializeFailed,
    /// The executor thread is gone or refused the task
    ExecutorUnavailable(String),
    /// GPU context creation or use failed
    Gpu(String),
    /// Configuration parse or validation error
    Config(String),
    /// A fence did not signal within the allowed time
    FenceTimeout,
    /// Generic error with message
    Other(String),
}

impl PipelineError {
    /// Shorthand used by stages to report a failure
    pub fn stage(stage: impl Into<String>, operation: Operation, reason: impl Into<String>) -> Self {
        PipelineError::StageFailed {
            stage: stage.into(),
            operation,
            reason: reason.into(),
        }
    }

    /// Whether this error should abort the capture session
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::StageFailed { operation, .. } => operation.is_fatal(),
            PipelineError::StageFailures { .. } | PipelineError::FenceTimeout => false,
            _ => true,
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::StageFailed {
                stage,
                operation,
                reason,
            } => write!(f, "Stage '{}' failed {}: {}", stage, operation, reason),
            PipelineError::StageFailures { operation, stages } => {
                write!(f, "{} failed in stages: {}", operation, stages.join(", "))
            }
            PipelineError::DuplicateStream(id) => write!(f, "Duplicate stream {}", id),
            PipelineError::StreamNotFound(id) => write!(f, "Stream {} not found", id),
            PipelineError::StreamsMismatch { expected, actual } => write!(
                f,
                "Configured streams {:?} do not match client streams {:?}",
                actual, expected
            ),
            PipelineError::StreamAltered(id) => {
                write!(f, "Stream {} was not restored to the client's request", id)
            }
            PipelineError::DuplicateBuffer(id) => {
                write!(f, "Descriptor already has a buffer for stream {}", id)
            }
            PipelineError::NotInitialized => write!(f, "Pipeline is not initialized"),
            PipelineError::AlreadyInitialized => write!(f, "Pipeline is already initialized"),
            PipelineError::InitializeFailed => {
                write!(f, "Pipeline failed to initialize and must be rebuilt")
            }
            PipelineError::ExecutorUnavailable(name) => {
                write!(f, "Executor '{}' is unavailable", name)
            }
            PipelineError::Gpu(msg) => write!(f, "GPU error: {}", msg),
            PipelineError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PipelineError::FenceTimeout => write!(f, "Timed out waiting for fence"),
            PipelineError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<String> for PipelineError {
    fn from(msg: String) -> Self {
        PipelineError::Other(msg)
    }
}

impl From<&str> for PipelineError {
    fn from(msg: &str) -> Self {
        PipelineError::Other(msg.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Config(err.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let fatal = PipelineError::stage("hdr", Operation::ConfigureStreams, "no memory");
        assert!(fatal.is_fatal());

        let logged = PipelineError::stage("hdr", Operation::ProcessCaptureRequest, "bad");
        assert!(!logged.is_fatal());

        let aggregate = PipelineError::StageFailures {
            operation: Operation::Flush,
            stages: vec!["a".into()],
        };
        assert!(!aggregate.is_fatal());
    }

    #[test]
    fn test_display_names_stage_and_operation() {
        let err = PipelineError::stage("auto_framing", Operation::OnConfiguredStreams, "lost");
        assert_eq!(
            err.to_string(),
            "Stage 'auto_framing' failed on_configured_streams: lost"
        );
    }
}
