// SPDX-License-Identifier: GPL-3.0-only

//! Synthetic capture session driver
//!
//! Builds a pipeline of pass-through stages and plays the hardware side:
//! stream negotiation, per-frame requests, shutter notifications and
//! results echoing the requested buffers back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use capture_pipeline::camera::{
    BufferHandle, CameraMetadata, CaptureDescriptor, Fence, NotifyMessage, PixelFormat, Stream,
    StreamBuffer, StreamConfiguration, StreamId, UsageFlags, tags,
};
use capture_pipeline::constants::{FENCE_WAIT_TIMEOUT, RequestTemplate};
use capture_pipeline::errors::{Operation, PipelineError, PipelineResult};
use capture_pipeline::executor::{Executor, WorkerThread};
use capture_pipeline::gpu::GpuMode;
use capture_pipeline::inspector::TracingInspector;
use capture_pipeline::pipeline::{SharedResources, StagePipeline};
use capture_pipeline::stage::{InFlightFrames, Stage, StageCallbacks, StageResultError};
use tracing::{debug, info, warn};

static NEXT_BUFFER: AtomicU64 = AtomicU64::new(0x1000);

fn next_buffer() -> BufferHandle {
    BufferHandle::from_raw(NEXT_BUFFER.fetch_add(1, Ordering::Relaxed))
}

/// Options for one simulated session
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub stages: usize,
    pub frames: u32,
    /// Number of stages, counted from the first, that run on their own thread
    pub threaded: usize,
    pub trace: bool,
    /// Frame whose request the first stage rejects
    pub fail_request: Option<u32>,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            stages: 3,
            frames: 10,
            threaded: 1,
            trace: false,
            fail_request: None,
        }
    }
}

/// Outcome of a simulated session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationReport {
    pub frames_delivered: u32,
    pub buffers_delivered: usize,
    pub buffer_errors: usize,
    pub notifications: usize,
    pub request_failures: usize,
}

/// Pass-through stage used by the simulator.
///
/// The first stage also owns a hidden analysis stream: it adds the stream on
/// the way down, attaches a buffer for it to every request and strips both
/// again on the way up.
struct SimulatedStage {
    label: String,
    resources: SharedResources,
    executor: Option<Arc<WorkerThread>>,
    callbacks: Option<StageCallbacks>,
    in_flight: InFlightFrames<Instant>,
    hidden_stream: Option<Arc<Stream>>,
    owns_hidden_stream: bool,
    fail_request: Option<u32>,
}

impl SimulatedStage {
    fn new(index: usize, resources: SharedResources, threaded: bool) -> PipelineResult<Self> {
        let label = format!("sim-{}", index);
        let executor = if threaded {
            Some(Arc::new(WorkerThread::start(&label)?))
        } else {
            None
        };
        Ok(Self {
            label,
            resources,
            executor,
            callbacks: None,
            in_flight: InFlightFrames::new(),
            hidden_stream: None,
            owns_hidden_stream: index == 0,
            fail_request: None,
        })
    }
}

impl Stage for SimulatedStage {
    fn name(&self) -> &str {
        &self.label
    }

    fn initialize(
        &mut self,
        _static_info: &CameraMetadata,
        callbacks: StageCallbacks,
    ) -> PipelineResult<()> {
        self.callbacks = Some(callbacks);
        Ok(())
    }

    fn configure_streams(&mut self, config: &mut StreamConfiguration) -> PipelineResult<()> {
        // Per-stage state surviving reconfiguration lives in the compute cache
        let key = format!("{}/rounds", self.label);
        let rounds = self.resources.compute.post_and_wait(move |state| {
            let rounds = state.get_cache::<u32>(&key).copied().unwrap_or(0) + 1;
            state.set_cache(key, rounds);
            rounds
        })?;
        debug!(stage = %self.label, rounds, "Configuring streams");

        if self.owns_hidden_stream {
            let hidden = Stream::new(PixelFormat::Y8, 640, 360)
                .with_usage(UsageFlags::SW_READ_OFTEN)
                .into_shared();
            config.add(Arc::clone(&hidden))?;
            self.hidden_stream = Some(hidden);
        }
        Ok(())
    }

    fn on_configured_streams(&mut self, config: &mut StreamConfiguration) -> PipelineResult<()> {
        if let Some(hidden) = &self.hidden_stream {
            // Keep the hardware's view of the stream for the buffers we attach
            let configured = config.remove(hidden.id())?;
            self.hidden_stream = Some(configured);
        }
        Ok(())
    }

    fn construct_default_request_settings(
        &mut self,
        settings: &mut CameraMetadata,
        template: RequestTemplate,
    ) -> PipelineResult<()> {
        if !settings.contains(tags::CONTROL_CAPTURE_INTENT) {
            settings.update::<u8>(tags::CONTROL_CAPTURE_INTENT, vec![template.id() as u8]);
        }
        Ok(())
    }

    fn process_capture_request(&mut self, request: &mut CaptureDescriptor) -> PipelineResult<()> {
        let frame = request.frame_number();
        if self.fail_request == Some(frame) {
            return Err(PipelineError::stage(
                &self.label,
                Operation::ProcessCaptureRequest,
                format!("rejecting frame {}", frame),
            ));
        }

        if let Some(hidden) = &self.hidden_stream {
            request.append_output_buffer(StreamBuffer::new(Arc::clone(hidden), next_buffer()))?;
        }
        self.in_flight.insert(frame, Instant::now());
        Ok(())
    }

    fn process_capture_result(
        &mut self,
        mut result: CaptureDescriptor,
    ) -> Result<(), StageResultError> {
        let frame = result.frame_number();

        for buffer in result.output_buffers_mut() {
            // Failure already marked the entry as an error
            let _ = buffer.wait_acquire_fence(FENCE_WAIT_TIMEOUT);
        }
        if let Some(hidden) = &self.hidden_stream {
            result.remove_output_buffer(hidden.id());
        }
        if let Some(started) = self.in_flight.take(frame) {
            debug!(
                stage = %self.label,
                frame,
                elapsed_us = started.elapsed().as_micros() as u64,
                "Frame left stage"
            );
        }

        match &self.callbacks {
            Some(callbacks) => {
                callbacks.deliver_result(result);
                Ok(())
            }
            None => Err(StageResultError::returned(
                PipelineError::Other(format!("{} has no result callback", self.label)),
                result,
            )),
        }
    }

    fn notify(&mut self, message: &mut NotifyMessage) -> PipelineResult<()> {
        if let NotifyMessage::Error { frame_number, .. } = message {
            self.in_flight.take(*frame_number);
        }
        Ok(())
    }

    fn flush(&mut self) -> PipelineResult<()> {
        let dropped = self.in_flight.drain();
        if !dropped.is_empty() {
            info!(stage = %self.label, frames = dropped.len(), "Flushed in-flight frames");
        }
        Ok(())
    }

    fn preferred_executor(&self) -> Option<Arc<dyn Executor>> {
        self.executor
            .as_ref()
            .map(|e| Arc::clone(e) as Arc<dyn Executor>)
    }
}

/// Negotiate streams the way a camera device would
fn configure_session(pipeline: &StagePipeline) -> PipelineResult<Vec<Arc<Stream>>> {
    let preview = Stream::new(PixelFormat::ImplementationDefined, 1280, 720)
        .with_usage(UsageFlags::HW_COMPOSER)
        .into_shared();
    let still = Stream::new(PixelFormat::Blob, 4096, 1).into_shared();
    let mut config = StreamConfiguration::new(vec![preview, still])?;

    pipeline.configure_streams(&mut config)?;
    for id in config.stream_ids() {
        config.update_stream(id, |s| {
            s.max_buffers = 4;
            s.usage |= UsageFlags::HW_CAMERA_WRITE;
        })?;
    }
    pipeline.on_configured_streams(&mut config)?;

    Ok(config.streams().to_vec())
}

fn client_callbacks() -> (
    StageCallbacks,
    mpsc::Receiver<CaptureDescriptor>,
    mpsc::Receiver<NotifyMessage>,
) {
    let (result_tx, result_rx) = mpsc::channel();
    let (notify_tx, notify_rx) = mpsc::channel();
    let result_tx = Mutex::new(result_tx);
    let notify_tx = Mutex::new(notify_tx);
    let callbacks = StageCallbacks::new(
        Arc::new(move |result: CaptureDescriptor| {
            if let Ok(tx) = result_tx.lock() {
                let _ = tx.send(result);
            }
        }),
        Arc::new(move |message: NotifyMessage| {
            if let Ok(tx) = notify_tx.lock() {
                let _ = tx.send(message);
            }
        }),
    );
    (callbacks, result_rx, notify_rx)
}

/// Run one synthetic session
pub fn run_simulation(options: &SimulationOptions) -> PipelineResult<SimulationReport> {
    let resources = SharedResources::new(GpuMode::Disabled);
    resources.compute.initialize()?;

    let mut stages: Vec<Box<dyn Stage>> = Vec::with_capacity(options.stages);
    for index in 0..options.stages {
        let mut stage = SimulatedStage::new(index, resources.clone(), index < options.threaded)?;
        if index == 0 {
            stage.fail_request = options.fail_request;
        }
        stages.push(Box::new(stage));
    }

    let pipeline = StagePipeline::new(stages, resources)?;
    if options.trace {
        pipeline.set_inspector(Some(Arc::new(TracingInspector)));
    }

    let (callbacks, results, notifications) = client_callbacks();
    let mut static_info = CameraMetadata::new();
    static_info.update::<i32>(tags::REQUEST_PARTIAL_RESULT_COUNT, vec![1]);
    pipeline.initialize(&static_info, callbacks)?;

    let streams = configure_session(&pipeline)?;
    let client_streams: Vec<StreamId> = streams.iter().map(|s| s.id()).collect();

    let mut defaults = CameraMetadata::new();
    pipeline.construct_default_request_settings(&mut defaults, RequestTemplate::Preview)?;

    let mut report = SimulationReport::default();
    for frame in 1..=options.frames {
        let mut request = CaptureDescriptor::request(frame).with_metadata(defaults.clone());
        for stream in &streams {
            request.append_output_buffer(
                StreamBuffer::new(Arc::clone(stream), next_buffer())
                    .with_acquire_fence(Fence::signaled()),
            )?;
        }

        if let Err(e) = pipeline.process_capture_request(&mut request) {
            warn!(frame, error = %e, "Request reported failures");
            report.request_failures += 1;
        }

        // Hardware side: shutter, then one result with every buffer filled
        let timestamp_ns = u64::from(frame) * 33_333_333;
        pipeline.notify(NotifyMessage::shutter(frame, timestamp_ns))?;

        let mut result = CaptureDescriptor::result(frame, pipeline.partial_result_count());
        result.update_metadata::<i64>(tags::SENSOR_TIMESTAMP, vec![timestamp_ns as i64]);
        result.set_output_buffers(request.take_output_buffers())?;
        pipeline.process_capture_result(result)?;
    }

    let deadline = Duration::from_secs(5);
    while report.frames_delivered < options.frames {
        let result = results.recv_timeout(deadline).map_err(|_| {
            PipelineError::Other(format!(
                "Timed out with {} of {} frames delivered",
                report.frames_delivered, options.frames
            ))
        })?;

        for buffer in result.output_buffers() {
            if !client_streams.contains(&buffer.stream_id()) {
                warn!(frame = result.frame_number(), stream = %buffer.stream_id(), "Hidden buffer leaked to client");
            }
            if buffer.is_error() {
                report.buffer_errors += 1;
            }
        }
        report.buffers_delivered += result.num_output_buffers();
        report.frames_delivered += 1;
    }
    report.notifications = notifications.try_iter().count();

    pipeline.flush()?;
    info!(?report, "Simulation finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulation_delivers_every_frame() {
        let report = run_simulation(&SimulationOptions {
            stages: 3,
            frames: 5,
            threaded: 2,
            trace: false,
            fail_request: None,
        })
        .unwrap();
        assert_eq!(report.frames_delivered, 5);
        assert_eq!(report.buffers_delivered, 10, "Hidden buffers must not reach the client");
        assert_eq!(report.buffer_errors, 0);
        assert_eq!(report.request_failures, 0);
    }

    #[test]
    fn test_simulation_counts_rejected_request() {
        let report = run_simulation(&SimulationOptions {
            stages: 2,
            frames: 3,
            threaded: 0,
            trace: true,
            fail_request: Some(2),
        })
        .unwrap();
        assert_eq!(report.request_failures, 1);
        assert_eq!(report.frames_delivered, 3);
    }

    #[test]
    fn test_simulation_without_stages() {
        let report = run_simulation(&SimulationOptions {
            stages: 0,
            frames: 2,
            threaded: 0,
            trace: false,
            fail_request: None,
        })
        .unwrap();
        assert_eq!(report.frames_delivered, 2);
        assert_eq!(report.buffers_delivered, 4);
    }
}
