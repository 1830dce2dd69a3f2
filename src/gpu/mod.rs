// SPDX-License-Identifier: GPL-3.0-only

//! Shared compute context for GPU-backed stages.
//!
//! One wgpu device, one dedicated worker thread and one keyed cache are
//! shared by every stage that needs GPU work. The device and the cache live
//! inside [`ComputeState`], which is created on the worker thread and only
//! ever handed out as `&mut ComputeState` to tasks running there. Stages
//! reach it through [`ComputeContext::post`] and
//! [`ComputeContext::post_and_wait`].

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};

use tracing::{debug, info, warn};

use crate::constants::COMPUTE_WORKER_NAME;
use crate::errors::{PipelineError, PipelineResult};
use crate::executor::{Executor, StatefulWorker, Task};

/// Compute-only wgpu, independent of any UI renderer
pub use wgpu_compute as wgpu;

/// What to do when no GPU adapter is available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuMode {
    /// Initialization fails without a GPU
    Required,
    /// Continue without a GPU, stages fall back to CPU paths
    #[default]
    Preferred,
    /// Never create a GPU device
    Disabled,
}

/// Information about the created GPU device
#[derive(Debug, Clone)]
pub struct GpuDeviceInfo {
    /// Name of the GPU adapter
    pub adapter_name: String,
    /// Backend being used (Vulkan, Metal, DX12, etc.)
    pub backend: wgpu::Backend,
}

/// Device and queue owned by the compute worker
#[derive(Debug)]
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub info: GpuDeviceInfo,
}

/// Create a wgpu device and queue for compute work.
pub async fn create_compute_device(label: &str) -> Result<GpuContext, String> {
    info!(label = label, "Creating GPU device for compute");

    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::VULKAN,
        ..Default::default()
    });

    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
        .map_err(|e| format!("Failed to find suitable GPU adapter: {}", e))?;

    let adapter_info = adapter.get_info();

    info!(
        adapter = %adapter_info.name,
        backend = ?adapter_info.backend,
        "GPU adapter selected for compute"
    );

    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some(label),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        })
        .await
        .map_err(|e| format!("Failed to create GPU device: {}", e))?;

    Ok(GpuContext {
        device,
        queue,
        info: GpuDeviceInfo {
            adapter_name: adapter_info.name.clone(),
            backend: adapter_info.backend,
        },
    })
}

/// State confined to the compute worker thread
pub struct ComputeState {
    gpu: Option<GpuContext>,
    cache: HashMap<String, Box<dyn Any + Send>>,
}

impl ComputeState {
    fn create(mode: GpuMode) -> Result<Self, String> {
        let gpu = match mode {
            GpuMode::Disabled => {
                debug!("GPU disabled for compute context");
                None
            }
            GpuMode::Preferred => match pollster::block_on(create_compute_device("pipeline-compute")) {
                Ok(gpu) => Some(gpu),
                Err(e) => {
                    warn!(error = %e, "No GPU available, stages will use CPU paths");
                    None
                }
            },
            GpuMode::Required => Some(pollster::block_on(create_compute_device(
                "pipeline-compute",
            ))?),
        };

        Ok(Self {
            gpu,
            cache: HashMap::new(),
        })
    }

    pub fn gpu(&self) -> Option<&GpuContext> {
        self.gpu.as_ref()
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu.is_some()
    }

    /// Cached value for `key`, if present and of type `T`
    pub fn get_cache<T: Any>(&self, key: &str) -> Option<&T> {
        self.cache.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_cache_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.cache.get_mut(key).and_then(|v| v.downcast_mut::<T>())
    }

    /// Store `value` under `key`, replacing any previous entry
    pub fn set_cache<T: Any + Send>(&mut self, key: impl Into<String>, value: T) {
        let key = key.into();
        debug!(key = %key, "Compute cache entry set");
        self.cache.insert(key, Box::new(value));
    }

    /// Remove the entry for `key`; returns whether it existed
    pub fn clear_cache(&mut self, key: &str) -> bool {
        self.cache.remove(key).is_some()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

/// Process-wide compute worker shared by all stages
pub struct ComputeContext {
    mode: GpuMode,
    worker: OnceLock<StatefulWorker<ComputeState>>,
    init_lock: Mutex<()>,
}

impl ComputeContext {
    pub fn new(mode: GpuMode) -> Self {
        Self {
            mode,
            worker: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    pub fn mode(&self) -> GpuMode {
        self.mode
    }

    pub fn is_initialized(&self) -> bool {
        self.worker.get().is_some()
    }

    /// Start the worker and create the GPU device on it. Calling this again
    /// after a successful start does nothing.
    pub fn initialize(&self) -> PipelineResult<()> {
        let _guard = self.init_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.worker.get().is_some() {
            return Ok(());
        }

        let mode = self.mode;
        let worker = StatefulWorker::start_with_init(COMPUTE_WORKER_NAME, move || {
            ComputeState::create(mode)
        })
        .map_err(|e| PipelineError::Gpu(e.to_string()))?;

        // Cannot fail, the init lock is held and the cell was empty
        let _ = self.worker.set(worker);
        info!(mode = ?mode, "Compute context initialized");
        Ok(())
    }

    fn worker(&self) -> PipelineResult<&StatefulWorker<ComputeState>> {
        self.worker.get().ok_or(PipelineError::NotInitialized)
    }

    /// Queue a task on the compute worker
    pub fn post<F>(&self, task: F) -> PipelineResult<()>
    where
        F: FnOnce(&mut ComputeState) + Send + 'static,
    {
        self.worker()?.post(task)
    }

    /// Run a task on the compute worker and wait for its result
    pub fn post_and_wait<R, F>(&self, task: F) -> PipelineResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut ComputeState) -> R + Send + 'static,
    {
        self.worker()?.post_and_wait(task)
    }

    /// Whether the caller is running on the compute worker
    pub fn is_worker_thread(&self) -> bool {
        self.worker.get().is_some_and(StatefulWorker::is_worker_thread)
    }
}

impl Default for ComputeContext {
    fn default() -> Self {
        Self::new(GpuMode::default())
    }
}

/// Lets a stage name the compute worker as its preferred executor
impl Executor for ComputeContext {
    fn name(&self) -> &str {
        COMPUTE_WORKER_NAME
    }

    fn post(&self, task: Task) -> PipelineResult<()> {
        self.worker()?.post_detached(task)
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        self.is_worker_thread()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    struct Pipeline {
        width: u32,
    }

    #[test]
    fn test_post_before_initialize_fails() {
        let ctx = ComputeContext::new(GpuMode::Disabled);
        assert_eq!(ctx.post(|_| {}), Err(PipelineError::NotInitialized));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let ctx = ComputeContext::new(GpuMode::Disabled);
        ctx.initialize().unwrap();
        ctx.post(|state| state.set_cache("marker", 1u32)).unwrap();
        ctx.initialize().unwrap();
        let kept = ctx
            .post_and_wait(|state| state.get_cache::<u32>("marker").copied())
            .unwrap();
        assert_eq!(kept, Some(1), "Second initialize must not reset the worker");
    }

    #[test]
    fn test_cache_is_typed_and_survives_tasks() {
        let ctx = ComputeContext::new(GpuMode::Disabled);
        ctx.initialize().unwrap();

        ctx.post(|state| state.set_cache("hdr/pipeline", Pipeline { width: 1920 }))
            .unwrap();
        let (hit, wrong_type) = ctx
            .post_and_wait(|state| {
                (
                    state.get_cache::<Pipeline>("hdr/pipeline").map(|p| p.width),
                    state.get_cache::<String>("hdr/pipeline").is_some(),
                )
            })
            .unwrap();
        assert_eq!(hit, Some(1920));
        assert!(!wrong_type);

        let cleared = ctx
            .post_and_wait(|state| state.clear_cache("hdr/pipeline"))
            .unwrap();
        assert!(cleared);
        assert_eq!(ctx.post_and_wait(|state| state.cache_len()).unwrap(), 0);
    }

    #[test]
    fn test_tasks_run_on_compute_thread() {
        let ctx = Arc::new(ComputeContext::new(GpuMode::Disabled));
        ctx.initialize().unwrap();
        assert!(!ctx.is_worker_thread());

        let inner = Arc::clone(&ctx);
        let (name, on_worker) = ctx
            .post_and_wait(move |_| {
                (
                    std::thread::current().name().map(str::to_string),
                    inner.is_worker_thread(),
                )
            })
            .unwrap();
        assert_eq!(name.as_deref(), Some(COMPUTE_WORKER_NAME));
        assert!(on_worker);
    }

    #[test]
    fn test_executor_tasks_reach_cache() {
        let ctx = Arc::new(ComputeContext::new(GpuMode::Disabled));
        ctx.initialize().unwrap();
        ctx.post(|state| state.set_cache("frames", 2u32)).unwrap();

        let inner = Arc::clone(&ctx);
        let seen = crate::executor::post_and_wait(&*ctx, move || {
            inner.post_and_wait(|state| state.get_cache::<u32>("frames").copied())
        })
        .unwrap();
        assert_eq!(seen, Ok(Some(2)), "Handlers on the compute executor share its state");
    }

    #[test]
    fn test_disabled_mode_has_no_gpu() {
        let ctx = ComputeContext::new(GpuMode::Disabled);
        ctx.initialize().unwrap();
        assert!(!ctx.post_and_wait(|state| state.has_gpu()).unwrap());
    }

    #[test]
    fn test_preferred_mode_tolerates_missing_gpu() {
        // Runs with or without a GPU; without one the context still starts
        let ctx = ComputeContext::new(GpuMode::Preferred);
        assert!(ctx.initialize().is_ok());
        match ctx.post_and_wait(|state| state.gpu().map(|g| g.info.adapter_name.clone())) {
            Ok(Some(name)) => assert!(!name.is_empty()),
            Ok(None) => println!("Skipping GPU checks (no GPU)"),
            Err(e) => panic!("Compute worker unavailable: {}", e),
        }
    }
}
