// SPDX-License-Identifier: GPL-3.0-only

//! Stage plug-in contract
//!
//! Every feature (HDR, auto-framing, face detection, effects, ZSL, privacy
//! muting, ...) plugs into the pipeline by implementing [`Stage`]. The
//! orchestrator owns an ordered list of stages and drives each lifecycle
//! event through it:
//!
//! ```text
//!   client ─ request ─▶ [0] ─▶ [1] ─▶ ... ─▶ [N-1] ─▶ hardware
//!   client ◀─ result ── [0] ◀─ [1] ◀─ ... ◀─ [N-1] ◀─ hardware
//! ```
//!
//! Requests and stream configurations travel down (forward), results and
//! the configured stream list travel back up (reverse), so each stage can
//! undo exactly what it changed on the way down.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::camera::capture::CaptureDescriptor;
use crate::camera::metadata::CameraMetadata;
use crate::camera::notify::NotifyMessage;
use crate::camera::stream::StreamConfiguration;
use crate::constants::RequestTemplate;
use crate::errors::{PipelineError, PipelineResult};
use crate::executor::Executor;

/// Continuation receiving a result from a stage
pub type ResultCallback = Arc<dyn Fn(CaptureDescriptor) + Send + Sync>;

/// Continuation receiving a notify message from a stage
pub type NotifyCallback = Arc<dyn Fn(NotifyMessage) + Send + Sync>;

/// Downstream continuations handed to a stage at initialize.
///
/// Delivering through these continues the reverse traversal at the stage
/// above the caller and ends at the client. They may be called from any
/// thread, any number of times.
#[derive(Clone)]
pub struct StageCallbacks {
    result: ResultCallback,
    notify: NotifyCallback,
}

impl StageCallbacks {
    pub fn new(result: ResultCallback, notify: NotifyCallback) -> Self {
        Self { result, notify }
    }

    /// Pass a result on to the next stage up
    pub fn deliver_result(&self, result: CaptureDescriptor) {
        (self.result)(result)
    }

    /// Pass a notify message on to the next stage up
    pub fn deliver_notify(&self, message: NotifyMessage) {
        (self.notify)(message)
    }
}

impl std::fmt::Debug for StageCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageCallbacks").finish_non_exhaustive()
    }
}

/// Failure of a stage to handle a result.
///
/// A stage that fails before passing the result on hands it back in
/// `result`; the orchestrator then marks every buffer as an error and
/// continues delivery above the stage.
#[derive(Debug)]
pub struct StageResultError {
    pub error: PipelineError,
    pub result: Option<CaptureDescriptor>,
}

impl StageResultError {
    /// The stage gives the undelivered result back
    pub fn returned(error: PipelineError, result: CaptureDescriptor) -> Self {
        Self {
            error,
            result: Some(result),
        }
    }

    /// The result was already delivered or released by the stage
    pub fn consumed(error: PipelineError) -> Self {
        Self {
            error,
            result: None,
        }
    }
}

impl From<PipelineError> for StageResultError {
    fn from(error: PipelineError) -> Self {
        Self::consumed(error)
    }
}

impl std::fmt::Display for StageResultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.result {
            Some(result) => write!(f, "{} (frame {} returned)", self.error, result.frame_number()),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for StageResultError {}

/// A processing stage in the capture pipeline
///
/// All operations must be implemented; pass-through is a valid
/// implementation. Handlers run on [`Stage::preferred_executor`] when one is
/// given, otherwise on the orchestrator's default worker.
pub trait Stage: Send {
    /// Name used in logs and error reports
    fn name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    /// Cache static capabilities and keep `callbacks` for asynchronous
    /// deliveries. Failure aborts the session.
    fn initialize(
        &mut self,
        static_info: &CameraMetadata,
        callbacks: StageCallbacks,
    ) -> PipelineResult<()>;

    /// Downward pass of a stream negotiation. The stage may add, remove or
    /// substitute streams. Failure aborts the configuration.
    fn configure_streams(&mut self, config: &mut StreamConfiguration) -> PipelineResult<()>;

    /// Upward pass of a stream negotiation. The stage must undo what it did
    /// in [`Stage::configure_streams`]. Failure aborts the configuration.
    fn on_configured_streams(&mut self, config: &mut StreamConfiguration) -> PipelineResult<()>;

    /// Seed default values for a request template
    fn construct_default_request_settings(
        &mut self,
        settings: &mut CameraMetadata,
        template: RequestTemplate,
    ) -> PipelineResult<()>;

    /// Rewrite a request on its way to the hardware
    fn process_capture_request(&mut self, request: &mut CaptureDescriptor) -> PipelineResult<()>;

    /// Take ownership of a result on its way to the client.
    ///
    /// The stage passes it on with [`StageCallbacks::deliver_result`], now or
    /// later. A stage that fails without passing it on returns it through
    /// [`StageResultError::returned`] so its buffers still reach the client.
    fn process_capture_result(
        &mut self,
        result: CaptureDescriptor,
    ) -> Result<(), StageResultError>;

    /// React to a notify message before it continues upward
    fn notify(&mut self, message: &mut NotifyMessage) -> PipelineResult<()>;

    /// Release every held buffer without waiting for future results
    fn flush(&mut self) -> PipelineResult<()>;

    /// Executor this stage's handlers should run on
    fn preferred_executor(&self) -> Option<Arc<dyn Executor>> {
        None
    }
}

/// Per-frame bookkeeping for a stage, keyed by frame number
///
/// Results for different frames arrive in no particular order, so stages
/// look up their state by frame number instead of assuming FIFO delivery.
#[derive(Debug)]
pub struct InFlightFrames<T> {
    frames: BTreeMap<u32, T>,
}

impl<T> InFlightFrames<T> {
    pub fn new() -> Self {
        Self {
            frames: BTreeMap::new(),
        }
    }

    /// Track `frame_number`, returning previous state if it was already tracked
    pub fn insert(&mut self, frame_number: u32, state: T) -> Option<T> {
        self.frames.insert(frame_number, state)
    }

    pub fn get(&self, frame_number: u32) -> Option<&T> {
        self.frames.get(&frame_number)
    }

    pub fn get_mut(&mut self, frame_number: u32) -> Option<&mut T> {
        self.frames.get_mut(&frame_number)
    }

    /// Stop tracking `frame_number`
    pub fn take(&mut self, frame_number: u32) -> Option<T> {
        self.frames.remove(&frame_number)
    }

    pub fn contains(&self, frame_number: u32) -> bool {
        self.frames.contains_key(&frame_number)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Oldest tracked frame number
    pub fn oldest(&self) -> Option<u32> {
        self.frames.keys().next().copied()
    }

    /// Remove every tracked frame in frame-number order (used by flush)
    pub fn drain(&mut self) -> Vec<(u32, T)> {
        std::mem::take(&mut self.frames).into_iter().collect()
    }
}

impl<T> Default for InFlightFrames<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Passthrough;

    impl Stage for Passthrough {
        fn initialize(&mut self, _: &CameraMetadata, _: StageCallbacks) -> PipelineResult<()> {
            Ok(())
        }
        fn configure_streams(&mut self, _: &mut StreamConfiguration) -> PipelineResult<()> {
            Ok(())
        }
        fn on_configured_streams(&mut self, _: &mut StreamConfiguration) -> PipelineResult<()> {
            Ok(())
        }
        fn construct_default_request_settings(
            &mut self,
            _: &mut CameraMetadata,
            _: RequestTemplate,
        ) -> PipelineResult<()> {
            Ok(())
        }
        fn process_capture_request(&mut self, _: &mut CaptureDescriptor) -> PipelineResult<()> {
            Ok(())
        }
        fn process_capture_result(
            &mut self,
            _: CaptureDescriptor,
        ) -> Result<(), StageResultError> {
            Ok(())
        }
        fn notify(&mut self, _: &mut NotifyMessage) -> PipelineResult<()> {
            Ok(())
        }
        fn flush(&mut self) -> PipelineResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_default_name_and_executor() {
        let stage: Box<dyn Stage> = Box::new(Passthrough);
        assert_eq!(stage.name(), "Passthrough");
        assert!(stage.preferred_executor().is_none());
    }

    #[test]
    fn test_callbacks_forward() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        let callbacks = StageCallbacks::new(
            Arc::new(move |r: CaptureDescriptor| sink.lock().unwrap().push(r.frame_number())),
            Arc::new(|_: NotifyMessage| {}),
        );
        callbacks.deliver_result(CaptureDescriptor::result(3, 1));
        callbacks.clone().deliver_result(CaptureDescriptor::result(4, 1));
        assert_eq!(*frames.lock().unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_result_error_carries_frame() {
        let err = StageResultError::returned(
            PipelineError::Other("no memory".into()),
            CaptureDescriptor::result(9, 1),
        );
        assert_eq!(err.to_string(), "no memory (frame 9 returned)");

        let err: StageResultError = PipelineError::FenceTimeout.into();
        assert!(err.result.is_none(), "Converted errors carry no result");
    }

    #[test]
    fn test_in_flight_frames_out_of_order() {
        let mut frames = InFlightFrames::new();
        frames.insert(5, "five");
        frames.insert(3, "three");
        frames.insert(4, "four");

        assert_eq!(frames.take(4), Some("four"));
        assert_eq!(frames.oldest(), Some(3));
        assert!(!frames.contains(4));
        assert_eq!(frames.drain(), vec![(3, "three"), (5, "five")]);
        assert!(frames.is_empty());
    }
}
