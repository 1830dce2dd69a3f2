// SPDX-License-Identifier: GPL-3.0-only

//! Stage orchestrator
//!
//! [`StagePipeline`] owns the ordered stage list and drives every lifecycle
//! event through it. Forward operations (initialize, configure_streams,
//! construct_default_request_settings, process_capture_request, flush) walk
//! stages `0..N`; reverse operations (on_configured_streams,
//! process_capture_result, notify) walk `N..0`.
//!
//! Each stage runs on its preferred executor, or on the pipeline's default
//! worker. Requests and the other synchronous operations wait for each
//! stage's handler before moving to the next stage. Results and notify
//! messages never wait on a stage's own executor: the stage continues the
//! delivery itself through the callbacks it received at initialize, and
//! those callbacks resume the reverse walk at the stage above it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tracing::{debug, error, info, warn};

use crate::camera::capture::CaptureDescriptor;
use crate::camera::metadata::{CameraMetadata, tags};
use crate::camera::notify::NotifyMessage;
use crate::camera::stream::{Stream, StreamConfiguration};
use crate::config::RuntimeConfig;
use crate::constants::{DEFAULT_EXECUTOR_NAME, DEFAULT_PARTIAL_RESULT_COUNT, RequestTemplate};
use crate::errors::{Operation, PipelineError, PipelineResult};
use crate::executor::{Executor, WorkerThread, post_and_wait};
use crate::gpu::{ComputeContext, GpuMode};
use crate::inspector::{CaptureView, DebugInspector};
use crate::stage::{Stage, StageCallbacks};

/// Process-wide resources shared by the pipeline and its stages
///
/// Stages receive a clone at construction. The pipeline keeps its own copy
/// and drops it only after every stage is gone.
#[derive(Clone)]
pub struct SharedResources {
    pub runtime_config: Arc<RuntimeConfig>,
    pub compute: Arc<ComputeContext>,
}

impl SharedResources {
    pub fn new(gpu_mode: GpuMode) -> Self {
        Self {
            runtime_config: Arc::new(RuntimeConfig::new()),
            compute: Arc::new(ComputeContext::new(gpu_mode)),
        }
    }
}

impl Default for SharedResources {
    fn default() -> Self {
        Self::new(GpuMode::default())
    }
}

struct StageSlot {
    name: String,
    stage: Mutex<Box<dyn Stage>>,
    executor: Option<Arc<dyn Executor>>,
}

impl StageSlot {
    fn lock_stage(&self) -> MutexGuard<'_, Box<dyn Stage>> {
        self.stage.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Inner {
    slots: Vec<Arc<StageSlot>>,
    default_executor: Arc<dyn Executor>,
    client: RwLock<Option<StageCallbacks>>,
    inspector: RwLock<Option<Arc<dyn DebugInspector>>>,
}

impl Inner {
    fn executor_for(&self, slot: &StageSlot) -> Arc<dyn Executor> {
        slot.executor
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.default_executor))
    }

    fn client(&self) -> Option<StageCallbacks> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn inspector(&self) -> Option<Arc<dyn DebugInspector>> {
        self.inspector
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn inspect_request(&self, position: usize, request: &mut CaptureDescriptor) {
        if let Some(inspector) = self.inspector() {
            inspector.inspect_request(position, &mut CaptureView::new(request));
        }
    }

    fn inspect_result(&self, position: usize, result: &mut CaptureDescriptor) {
        if let Some(inspector) = self.inspector() {
            inspector.inspect_result(position, &mut CaptureView::new(result));
        }
    }

    /// Callbacks for stage `index`: deliveries resume at the boundary above it
    fn stage_callbacks(self: &Arc<Self>, index: usize) -> StageCallbacks {
        let result_inner = Arc::downgrade(self);
        let notify_inner = Arc::downgrade(self);
        StageCallbacks::new(
            Arc::new(move |result: CaptureDescriptor| match result_inner.upgrade() {
                Some(inner) => inner.continue_result(index, result),
                None => debug!(
                    frame = result.frame_number(),
                    "Pipeline gone, dropping result"
                ),
            }),
            Arc::new(move |message: NotifyMessage| match notify_inner.upgrade() {
                Some(inner) => inner.continue_notify(index, message),
                None => debug!(%message, "Pipeline gone, dropping notify"),
            }),
        )
    }

    /// Run a reverse-path task for `slot`.
    ///
    /// Stages with their own executor get the task posted without waiting;
    /// stages on the default worker are waited for.
    fn dispatch_reverse<F>(&self, slot: &StageSlot, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &slot.executor {
            Some(executor) if executor.runs_tasks_on_current_thread() => task(),
            Some(executor) => {
                if let Err(e) = executor.post(Box::new(task)) {
                    error!(stage = %slot.name, error = %e, "Failed to post to stage executor");
                }
            }
            None => {
                if let Err(e) = post_and_wait(self.default_executor.as_ref(), task) {
                    error!(stage = %slot.name, error = %e, "Failed to run on default executor");
                }
            }
        }
    }

    /// Deliver `result` to the stage below boundary `position`, or to the
    /// client once position 0 is reached
    fn continue_result(self: &Arc<Self>, position: usize, mut result: CaptureDescriptor) {
        self.inspect_result(position, &mut result);

        if position == 0 {
            match self.client() {
                Some(client) => client.deliver_result(result),
                None => warn!(
                    frame = result.frame_number(),
                    "No client callback, dropping result"
                ),
            }
            return;
        }

        let index = position - 1;
        let slot = Arc::clone(&self.slots[index]);
        let task_slot = Arc::clone(&slot);
        let weak = Arc::downgrade(self);
        self.dispatch_reverse(&slot, move || {
            let frame = result.frame_number();
            let outcome = task_slot.lock_stage().process_capture_result(result);
            let Err(failure) = outcome else {
                return;
            };
            warn!(
                stage = %task_slot.name,
                frame,
                error = %failure.error,
                returned = failure.result.is_some(),
                "process_capture_result failed"
            );

            // The stage never passed the result on; release its buffers upward
            if let Some(mut result) = failure.result {
                for buffer in result.output_buffers_mut() {
                    buffer.mark_error();
                }
                if let Some(inner) = Weak::upgrade(&weak) {
                    inner.continue_result(index, result);
                }
            }
        });
    }

    /// Deliver `message` to the stage below boundary `position`, or to the
    /// client once position 0 is reached
    fn continue_notify(self: &Arc<Self>, position: usize, message: NotifyMessage) {
        if position == 0 {
            match self.client() {
                Some(client) => client.deliver_notify(message),
                None => warn!(%message, "No client callback, dropping notify"),
            }
            return;
        }

        let index = position - 1;
        let slot = Arc::clone(&self.slots[index]);
        let task_slot = Arc::clone(&slot);
        let weak = Arc::downgrade(self);
        self.dispatch_reverse(&slot, move || {
            let mut message = message;
            {
                let mut stage = task_slot.lock_stage();
                if let Err(e) = stage.notify(&mut message) {
                    warn!(stage = %task_slot.name, %message, error = %e, "notify failed");
                }
            }
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.continue_notify(index, message);
            }
        });
    }

    /// Run `f` against stage `index` on its executor and wait for it
    fn run_stage<R, F>(&self, index: usize, f: F) -> PipelineResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn Stage) -> R + Send + 'static,
    {
        let slot = Arc::clone(&self.slots[index]);
        let executor = self.executor_for(&slot);
        post_and_wait(executor.as_ref(), move || {
            let mut stage = slot.lock_stage();
            f(&mut **stage)
        })
    }

    /// Like [`Inner::run_stage`], lending `value` to the handler.
    ///
    /// `value` is moved out (leaving `placeholder`) for the duration of the
    /// hand-off and always moved back, even if the executor refused the task.
    fn run_stage_with<T, R, F>(
        &self,
        index: usize,
        value: &mut T,
        placeholder: T,
        f: F,
    ) -> PipelineResult<R>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: FnOnce(&mut dyn Stage, &mut T) -> R + Send + 'static,
    {
        let shared = Arc::new(Mutex::new(std::mem::replace(value, placeholder)));
        let task_value = Arc::clone(&shared);
        let outcome = self.run_stage(index, move |stage| {
            let mut value = task_value.lock().unwrap_or_else(PoisonError::into_inner);
            f(stage, &mut value)
        });
        std::mem::swap(
            value,
            &mut *shared.lock().unwrap_or_else(PoisonError::into_inner),
        );
        outcome
    }
}

/// Attribute a stage error to the stage and operation that produced it
fn attribute(stage: &str, operation: Operation, err: PipelineError) -> PipelineError {
    match err {
        PipelineError::StageFailed { .. } => err,
        other => PipelineError::stage(stage, operation, other.to_string()),
    }
}

/// Orchestrates capture requests and results through an ordered stage list
pub struct StagePipeline {
    inner: Arc<Inner>,
    resources: SharedResources,
    initialized: AtomicBool,
    init_failed: AtomicBool,
    init_lock: Mutex<()>,
    partial_result_count: AtomicU32,
    client_streams: Mutex<Option<Vec<Arc<Stream>>>>,
}

impl StagePipeline {
    /// Build a pipeline with its own default worker thread
    pub fn new(stages: Vec<Box<dyn Stage>>, resources: SharedResources) -> PipelineResult<Self> {
        let default_executor: Arc<dyn Executor> = Arc::new(WorkerThread::start(DEFAULT_EXECUTOR_NAME)?);
        Ok(Self::with_default_executor(stages, resources, default_executor))
    }

    /// Build a pipeline that runs stages without a preferred executor on
    /// `default_executor`
    pub fn with_default_executor(
        stages: Vec<Box<dyn Stage>>,
        resources: SharedResources,
        default_executor: Arc<dyn Executor>,
    ) -> Self {
        let slots: Vec<Arc<StageSlot>> = stages
            .into_iter()
            .map(|stage| {
                Arc::new(StageSlot {
                    name: stage.name().to_string(),
                    executor: stage.preferred_executor(),
                    stage: Mutex::new(stage),
                })
            })
            .collect();

        info!(
            stages = ?slots.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            default_executor = default_executor.name(),
            "Creating stage pipeline"
        );

        Self {
            inner: Arc::new(Inner {
                slots,
                default_executor,
                client: RwLock::new(None),
                inspector: RwLock::new(None),
            }),
            resources,
            initialized: AtomicBool::new(false),
            init_failed: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            partial_result_count: AtomicU32::new(DEFAULT_PARTIAL_RESULT_COUNT),
            client_streams: Mutex::new(None),
        }
    }

    pub fn num_stages(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.inner.slots.iter().map(|s| s.name.clone()).collect()
    }

    pub fn resources(&self) -> &SharedResources {
        &self.resources
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Number of metadata parts the device emits per frame
    pub fn partial_result_count(&self) -> u32 {
        self.partial_result_count.load(Ordering::Relaxed)
    }

    /// Install or remove the debug inspector
    pub fn set_inspector(&self, inspector: Option<Arc<dyn DebugInspector>>) {
        debug!(enabled = inspector.is_some(), "Debug inspector changed");
        *self
            .inner
            .inspector
            .write()
            .unwrap_or_else(PoisonError::into_inner) = inspector;
    }

    fn ensure_initialized(&self) -> PipelineResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(PipelineError::NotInitialized)
        }
    }

    /// Initialize every stage in order. Any failure aborts the session: the
    /// client callbacks are dropped and later calls return
    /// [`PipelineError::InitializeFailed`], so the pipeline must be rebuilt.
    pub fn initialize(
        &self,
        static_info: &CameraMetadata,
        client: StageCallbacks,
    ) -> PipelineResult<()> {
        let _guard = self.init_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_initialized() {
            return Err(PipelineError::AlreadyInitialized);
        }
        if self.init_failed.load(Ordering::Acquire) {
            return Err(PipelineError::InitializeFailed);
        }

        let partial_count = static_info
            .get_first::<i32>(tags::REQUEST_PARTIAL_RESULT_COUNT)
            .and_then(|c| u32::try_from(c).ok())
            .filter(|c| *c > 0)
            .unwrap_or(DEFAULT_PARTIAL_RESULT_COUNT);
        self.partial_result_count.store(partial_count, Ordering::Relaxed);

        *self
            .inner
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(client);

        for (index, slot) in self.inner.slots.iter().enumerate() {
            debug!(stage = %slot.name, "Initializing stage");
            let callbacks = self.inner.stage_callbacks(index);
            let info = static_info.clone();
            let outcome = self
                .inner
                .run_stage(index, move |stage| stage.initialize(&info, callbacks))
                .and_then(|status| status);
            if let Err(e) = outcome {
                error!(stage = %slot.name, error = %e, "Stage failed to initialize");
                // Stages above already hold callbacks; nothing may reach the client now
                self.inner
                    .client
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                self.init_failed.store(true, Ordering::Release);
                return Err(attribute(&slot.name, Operation::Initialize, e));
            }
        }

        self.initialized.store(true, Ordering::Release);
        info!(
            stages = self.num_stages(),
            partial_result_count = partial_count,
            "Stage pipeline initialized"
        );
        Ok(())
    }

    /// Downward pass of a stream negotiation
    pub fn configure_streams(&self, config: &mut StreamConfiguration) -> PipelineResult<()> {
        self.ensure_initialized()?;
        *self
            .client_streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(config.streams().to_vec());

        for index in 0..self.num_stages() {
            let name = &self.inner.slots[index].name;
            self.inner
                .run_stage_with(index, config, StreamConfiguration::default(), |stage, c| {
                    stage.configure_streams(c)
                })?
                .map_err(|e| {
                    error!(stage = %name, error = %e, "configure_streams failed");
                    attribute(name, Operation::ConfigureStreams, e)
                })?;
        }

        info!(streams = config.len(), "Streams configured downward");
        Ok(())
    }

    /// Upward pass of a stream negotiation.
    ///
    /// After the last stage the stream identities must match what the client
    /// passed to [`StagePipeline::configure_streams`].
    pub fn on_configured_streams(&self, config: &mut StreamConfiguration) -> PipelineResult<()> {
        self.ensure_initialized()?;

        for index in (0..self.num_stages()).rev() {
            let name = &self.inner.slots[index].name;
            self.inner
                .run_stage_with(index, config, StreamConfiguration::default(), |stage, c| {
                    stage.on_configured_streams(c)
                })?
                .map_err(|e| {
                    error!(stage = %name, error = %e, "on_configured_streams failed");
                    attribute(name, Operation::OnConfiguredStreams, e)
                })?;
        }

        let requested = self
            .client_streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(requested) = requested {
            let expected: Vec<_> = requested.iter().map(|s| s.id()).collect();
            let actual = config.stream_ids();
            if actual != expected {
                error!(?expected, ?actual, "Stages did not restore the client streams");
                return Err(PipelineError::StreamsMismatch { expected, actual });
            }
            if let Some((wanted, got)) = requested
                .iter()
                .zip(config.streams())
                .find(|(wanted, got)| !wanted.matches_request(got))
            {
                error!(%wanted, %got, "Stage did not restore a client stream");
                return Err(PipelineError::StreamAltered(wanted.id()));
            }
        }

        info!(streams = config.len(), "Streams configured upward");
        Ok(())
    }

    /// Let every stage seed defaults for `template`
    pub fn construct_default_request_settings(
        &self,
        settings: &mut CameraMetadata,
        template: RequestTemplate,
    ) -> PipelineResult<()> {
        self.ensure_initialized()?;
        debug!(template = template.display_name(), "Constructing default settings");

        let mut failed = Vec::new();
        for index in 0..self.num_stages() {
            let outcome = self
                .inner
                .run_stage_with(index, settings, CameraMetadata::new(), move |stage, s| {
                    stage.construct_default_request_settings(s, template)
                })
                .and_then(|status| status);
            if let Err(e) = outcome {
                let name = &self.inner.slots[index].name;
                warn!(stage = %name, error = %e, "construct_default_request_settings failed");
                failed.push(name.clone());
            }
        }

        aggregate(Operation::ConstructDefaultRequestSettings, failed)
    }

    /// Walk a request from the client side to the hardware side.
    ///
    /// Every stage sees the request even if an earlier one failed.
    pub fn process_capture_request(&self, request: &mut CaptureDescriptor) -> PipelineResult<()> {
        self.ensure_initialized()?;
        let frame = request.frame_number();
        debug!(frame, "Processing capture request");

        let mut failed = Vec::new();
        for index in 0..self.num_stages() {
            self.inner.inspect_request(index, request);
            let outcome = self
                .inner
                .run_stage_with(index, request, CaptureDescriptor::request(frame), |stage, r| {
                    stage.process_capture_request(r)
                })
                .and_then(|status| status);
            if let Err(e) = outcome {
                let name = &self.inner.slots[index].name;
                warn!(stage = %name, frame, error = %e, "process_capture_request failed");
                failed.push(name.clone());
            }
        }
        self.inner.inspect_request(self.num_stages(), request);

        aggregate(Operation::ProcessCaptureRequest, failed)
    }

    /// Walk a result from the hardware side back to the client.
    ///
    /// Returns once the result has been handed to a stage running on its own
    /// executor, or has reached the client.
    pub fn process_capture_result(&self, result: CaptureDescriptor) -> PipelineResult<()> {
        self.ensure_initialized()?;
        debug!(
            frame = result.frame_number(),
            partial = result.partial_result(),
            "Processing capture result"
        );
        self.inner.continue_result(self.num_stages(), result);
        Ok(())
    }

    /// Walk a notify message from the hardware side back to the client
    pub fn notify(&self, message: NotifyMessage) -> PipelineResult<()> {
        self.ensure_initialized()?;
        debug!(%message, "Processing notify");
        self.inner.continue_notify(self.num_stages(), message);
        Ok(())
    }

    /// Ask every stage to release what it holds
    pub fn flush(&self) -> PipelineResult<()> {
        self.ensure_initialized()?;
        info!("Flushing stage pipeline");

        let mut failed = Vec::new();
        for index in 0..self.num_stages() {
            let outcome = self
                .inner
                .run_stage(index, |stage| stage.flush())
                .and_then(|status| status);
            if let Err(e) = outcome {
                let name = &self.inner.slots[index].name;
                warn!(stage = %name, error = %e, "flush failed");
                failed.push(name.clone());
            }
        }

        aggregate(Operation::Flush, failed)
    }
}

impl Drop for StagePipeline {
    fn drop(&mut self) {
        debug!(stages = self.num_stages(), "Stage pipeline dropped");
    }
}

fn aggregate(operation: Operation, failed: Vec<String>) -> PipelineResult<()> {
    if failed.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::StageFailures {
            operation,
            stages: failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::notify::ErrorCode;
    use crate::executor::InlineExecutor;
    use crate::stage::StageResultError;
    use std::sync::mpsc;

    #[derive(Default)]
    struct Log {
        calls: Mutex<Vec<String>>,
    }

    impl Log {
        fn push(&self, entry: String) {
            self.calls.lock().unwrap().push(entry);
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }
    }

    struct Recorder {
        label: &'static str,
        log: Arc<Log>,
        callbacks: Option<StageCallbacks>,
        fail_request: bool,
    }

    impl Recorder {
        fn boxed(label: &'static str, log: &Arc<Log>) -> Box<dyn Stage> {
            Box::new(Recorder {
                label,
                log: Arc::clone(log),
                callbacks: None,
                fail_request: false,
            })
        }
    }

    impl Stage for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        fn initialize(&mut self, _: &CameraMetadata, callbacks: StageCallbacks) -> PipelineResult<()> {
            self.log.push(format!("{}:initialize", self.label));
            self.callbacks = Some(callbacks);
            Ok(())
        }

        fn configure_streams(&mut self, _: &mut StreamConfiguration) -> PipelineResult<()> {
            self.log.push(format!("{}:configure", self.label));
            Ok(())
        }

        fn on_configured_streams(&mut self, _: &mut StreamConfiguration) -> PipelineResult<()> {
            self.log.push(format!("{}:configured", self.label));
            Ok(())
        }

        fn construct_default_request_settings(
            &mut self,
            _: &mut CameraMetadata,
            _: RequestTemplate,
        ) -> PipelineResult<()> {
            self.log.push(format!("{}:defaults", self.label));
            Ok(())
        }

        fn process_capture_request(&mut self, _: &mut CaptureDescriptor) -> PipelineResult<()> {
            self.log.push(format!("{}:request", self.label));
            if self.fail_request {
                return Err("rejected".into());
            }
            Ok(())
        }

        fn process_capture_result(
            &mut self,
            result: CaptureDescriptor,
        ) -> Result<(), StageResultError> {
            self.log.push(format!("{}:result", self.label));
            if let Some(callbacks) = &self.callbacks {
                callbacks.deliver_result(result);
            }
            Ok(())
        }

        fn notify(&mut self, _: &mut NotifyMessage) -> PipelineResult<()> {
            self.log.push(format!("{}:notify", self.label));
            Ok(())
        }

        fn flush(&mut self) -> PipelineResult<()> {
            self.log.push(format!("{}:flush", self.label));
            Ok(())
        }
    }

    fn inline_pipeline(stages: Vec<Box<dyn Stage>>) -> StagePipeline {
        StagePipeline::with_default_executor(
            stages,
            SharedResources::new(GpuMode::Disabled),
            Arc::new(InlineExecutor),
        )
    }

    fn client() -> (StageCallbacks, mpsc::Receiver<CaptureDescriptor>, mpsc::Receiver<NotifyMessage>) {
        let (result_tx, result_rx) = mpsc::channel();
        let (notify_tx, notify_rx) = mpsc::channel();
        let result_tx = Mutex::new(result_tx);
        let notify_tx = Mutex::new(notify_tx);
        let callbacks = StageCallbacks::new(
            Arc::new(move |r: CaptureDescriptor| {
                let _ = result_tx.lock().unwrap().send(r);
            }),
            Arc::new(move |m: NotifyMessage| {
                let _ = notify_tx.lock().unwrap().send(m);
            }),
        );
        (callbacks, result_rx, notify_rx)
    }

    #[test]
    fn test_operations_before_initialize_rejected() {
        let pipeline = inline_pipeline(Vec::new());
        assert_eq!(
            pipeline.process_capture_result(CaptureDescriptor::result(1, 1)),
            Err(PipelineError::NotInitialized)
        );
        assert_eq!(pipeline.flush(), Err(PipelineError::NotInitialized));
    }

    #[test]
    fn test_second_initialize_rejected() {
        let pipeline = inline_pipeline(Vec::new());
        let (callbacks, _r, _n) = client();
        pipeline
            .initialize(&CameraMetadata::new(), callbacks.clone())
            .unwrap();
        assert_eq!(
            pipeline.initialize(&CameraMetadata::new(), callbacks),
            Err(PipelineError::AlreadyInitialized)
        );
    }

    #[test]
    fn test_traversal_directions() {
        let log = Arc::new(Log::default());
        let pipeline = inline_pipeline(vec![Recorder::boxed("a", &log), Recorder::boxed("b", &log)]);
        let (callbacks, results, notifies) = client();
        pipeline.initialize(&CameraMetadata::new(), callbacks).unwrap();
        assert_eq!(log.take(), vec!["a:initialize", "b:initialize"]);

        let mut config = StreamConfiguration::default();
        pipeline.configure_streams(&mut config).unwrap();
        pipeline.on_configured_streams(&mut config).unwrap();
        assert_eq!(
            log.take(),
            vec!["a:configure", "b:configure", "b:configured", "a:configured"]
        );

        let mut request = CaptureDescriptor::request(1);
        pipeline.process_capture_request(&mut request).unwrap();
        pipeline
            .process_capture_result(CaptureDescriptor::result(1, 1))
            .unwrap();
        pipeline
            .notify(NotifyMessage::error(1, ErrorCode::Result))
            .unwrap();
        pipeline.flush().unwrap();
        assert_eq!(
            log.take(),
            vec![
                "a:request", "b:request", "b:result", "a:result", "b:notify", "a:notify",
                "a:flush", "b:flush"
            ]
        );
        assert_eq!(results.try_recv().map(|r| r.frame_number()), Ok(1));
        assert_eq!(notifies.try_recv().map(|m| m.frame_number()), Ok(1));
    }

    #[test]
    fn test_request_failure_is_aggregated() {
        let log = Arc::new(Log::default());
        let failing = Box::new(Recorder {
            label: "a",
            log: Arc::clone(&log),
            callbacks: None,
            fail_request: true,
        });
        let pipeline = inline_pipeline(vec![failing, Recorder::boxed("b", &log)]);
        let (callbacks, _r, _n) = client();
        pipeline.initialize(&CameraMetadata::new(), callbacks).unwrap();
        log.take();

        let err = pipeline
            .process_capture_request(&mut CaptureDescriptor::request(2))
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::StageFailures {
                operation: Operation::ProcessCaptureRequest,
                stages: vec!["a".to_string()],
            }
        );
        assert_eq!(log.take(), vec!["a:request", "b:request"]);
    }

    #[test]
    fn test_partial_result_count_from_static_info() {
        let pipeline = inline_pipeline(Vec::new());
        let mut info = CameraMetadata::new();
        info.update::<i32>(tags::REQUEST_PARTIAL_RESULT_COUNT, vec![3]);
        let (callbacks, _r, _n) = client();
        pipeline.initialize(&info, callbacks).unwrap();
        assert_eq!(pipeline.partial_result_count(), 3);
    }

    #[test]
    fn test_request_survives_refused_executor() {
        struct Closed;
        impl Executor for Closed {
            fn name(&self) -> &str {
                "closed"
            }
            fn post(&self, _: crate::executor::Task) -> PipelineResult<()> {
                Err(PipelineError::ExecutorUnavailable("closed".into()))
            }
            fn runs_tasks_on_current_thread(&self) -> bool {
                false
            }
        }

        let inner = Inner {
            slots: vec![Arc::new(StageSlot {
                name: "a".into(),
                stage: Mutex::new(Recorder::boxed("a", &Arc::new(Log::default()))),
                executor: None,
            })],
            default_executor: Arc::new(Closed),
            client: RwLock::new(None),
            inspector: RwLock::new(None),
        };
        let mut request = CaptureDescriptor::request(9);
        request.update_metadata::<i32>(tags::REQUEST_ID, vec![1]);

        let outcome = inner.run_stage_with(
            0,
            &mut request,
            CaptureDescriptor::request(9),
            |stage, r| stage.process_capture_request(r),
        );
        assert!(outcome.is_err());
        assert!(
            request.has_metadata(),
            "The request must be handed back when the executor refuses the task"
        );
    }
}
