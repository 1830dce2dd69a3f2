// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline-wide constants

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound for waiting on a buffer's acquire fence before touching its memory.
///
/// A wait that exceeds this is treated as a buffer error instead of stalling
/// the worker thread.
pub const FENCE_WAIT_TIMEOUT: Duration = Duration::from_millis(300);

/// Partial result count used when the static metadata does not declare one
pub const DEFAULT_PARTIAL_RESULT_COUNT: u32 = 1;

/// Thread name of the Orchestrator's default executor
pub const DEFAULT_EXECUTOR_NAME: &str = "pipeline-default";

/// Thread name of the shared compute context worker
pub const COMPUTE_WORKER_NAME: &str = "gpu-resources";

/// Directory name for stage scratch files, under the platform cache dir
pub const SCRATCH_DIR_NAME: &str = "capture-pipeline";

/// Request templates passed to `construct_default_request_settings`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RequestTemplate {
    /// Preview stream settings (default)
    #[default]
    Preview,
    /// Still capture, quality over frame rate
    StillCapture,
    /// Stable frame rate for recording
    VideoRecord,
    /// Still capture while recording
    VideoSnapshot,
    /// Zero-shutter-lag still capture
    ZeroShutterLag,
    /// Manual control of all 3A parameters
    Manual,
}

impl RequestTemplate {
    /// All templates, in their wire order
    pub const ALL: [RequestTemplate; 6] = [
        RequestTemplate::Preview,
        RequestTemplate::StillCapture,
        RequestTemplate::VideoRecord,
        RequestTemplate::VideoSnapshot,
        RequestTemplate::ZeroShutterLag,
        RequestTemplate::Manual,
    ];

    /// Template id as used by the camera device interface (1-based)
    pub fn id(&self) -> u32 {
        match self {
            RequestTemplate::Preview => 1,
            RequestTemplate::StillCapture => 2,
            RequestTemplate::VideoRecord => 3,
            RequestTemplate::VideoSnapshot => 4,
            RequestTemplate::ZeroShutterLag => 5,
            RequestTemplate::Manual => 6,
        }
    }

    /// Look up a template from its device id
    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.id() == id)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            RequestTemplate::Preview => "Preview",
            RequestTemplate::StillCapture => "Still capture",
            RequestTemplate::VideoRecord => "Video record",
            RequestTemplate::VideoSnapshot => "Video snapshot",
            RequestTemplate::ZeroShutterLag => "Zero shutter lag",
            RequestTemplate::Manual => "Manual",
        }
    }
}
