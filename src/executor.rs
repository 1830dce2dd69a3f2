// SPDX-License-Identifier: GPL-3.0-only

//! Task executors used to run stage handlers
//!
//! A [`StatefulWorker`] is a dedicated, named thread that owns a piece of
//! state and runs posted closures against it in FIFO order. The state is
//! created on the worker thread itself and never leaves it, which is how
//! thread-confined resources (GPU contexts, stage caches) are kept on one
//! thread without any locking. Tasks posted through [`Executor::post`] run
//! on the same thread without borrowing the state, so code they call can
//! still reach it with [`StatefulWorker::post_and_wait`].
//!
//! [`WorkerThread`] is the stateless flavour implementing [`Executor`], the
//! abstraction the orchestrator dispatches stage handlers through.
//! [`InlineExecutor`] runs every task on the calling thread and is meant for
//! deterministic tests.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc::{self, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, info, warn};

use crate::errors::{PipelineError, PipelineResult};

/// Unit of work accepted by an [`Executor`]
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run tasks, possibly on another thread
pub trait Executor: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Queue a task. Returns an error if the executor can no longer run tasks.
    fn post(&self, task: Task) -> PipelineResult<()>;

    /// Whether tasks posted to this executor would run on the calling thread
    fn runs_tasks_on_current_thread(&self) -> bool;
}

/// Run `f` on `executor` and block until it returns.
///
/// If the executor already runs on the calling thread, `f` runs inline so a
/// worker can never deadlock waiting on itself.
pub fn post_and_wait<R, F>(executor: &dyn Executor, f: F) -> PipelineResult<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    if executor.runs_tasks_on_current_thread() {
        return Ok(f());
    }

    let (done_tx, done_rx) = mpsc::sync_channel::<R>(1);
    executor.post(Box::new(move || {
        let _ = done_tx.send(f());
    }))?;

    done_rx
        .recv()
        .map_err(|_| PipelineError::ExecutorUnavailable(executor.name().to_string()))
}

type StateTask<S> = Box<dyn FnOnce(&RefCell<S>) + Send + 'static>;

thread_local! {
    /// State owned by the worker running on this thread
    static WORKER_STATE: RefCell<Option<Rc<dyn Any>>> = const { RefCell::new(None) };
}

/// Dedicated thread owning a state value of type `S`
pub struct StatefulWorker<S: 'static> {
    name: String,
    sender: Mutex<Option<Sender<StateTask<S>>>>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl<S: 'static> StatefulWorker<S> {
    /// Spawn the worker and build its state on the new thread.
    ///
    /// Blocks until `init_fn` has run; an initialization error is returned
    /// to the caller and the thread exits.
    pub fn start_with_init<I>(name: &str, init_fn: I) -> PipelineResult<Self>
    where
        I: FnOnce() -> Result<S, String> + Send + 'static,
    {
        let (task_tx, task_rx) = mpsc::channel::<StateTask<S>>();
        let (init_tx, init_rx) = mpsc::sync_channel::<Result<(), String>>(1);
        let name_clone = name.to_string();

        info!(name = %name, "Starting worker thread");

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(name = %name_clone, "Worker thread started, initializing...");

                let state = match init_fn() {
                    Ok(s) => {
                        let _ = init_tx.send(Ok(()));
                        Rc::new(RefCell::new(s))
                    }
                    Err(e) => {
                        warn!(name = %name_clone, error = %e, "Worker initialization failed");
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };

                let shared: Rc<dyn Any> = state.clone();
                WORKER_STATE.with(|slot| *slot.borrow_mut() = Some(shared));

                // Runs until every sender is gone
                while let Ok(task) = task_rx.recv() {
                    task(&state);
                }

                WORKER_STATE.with(|slot| slot.borrow_mut().take());

                info!(name = %name_clone, "Worker thread exiting");
            })
            .map_err(|e| {
                PipelineError::ExecutorUnavailable(format!("Spawn worker '{}': {}", name, e))
            })?;

        let thread_id = handle.thread().id();

        match init_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(PipelineError::ExecutorUnavailable(format!(
                    "Worker '{}' failed to initialize: {}",
                    name, e
                )));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(PipelineError::ExecutorUnavailable(format!(
                    "Worker '{}' died during initialization",
                    name
                )));
            }
        }

        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(task_tx)),
            thread_handle: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn send(&self, task: StateTask<S>) -> PipelineResult<()> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(tx) => tx
                .send(task)
                .map_err(|_| PipelineError::ExecutorUnavailable(self.name.clone())),
            None => Err(PipelineError::ExecutorUnavailable(self.name.clone())),
        }
    }

    /// Queue a task against the worker state
    pub fn post<F>(&self, task: F) -> PipelineResult<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let name = self.name.clone();
        self.send(Box::new(move |state: &RefCell<S>| match state.try_borrow_mut() {
            Ok(mut state) => task(&mut state),
            Err(_) => warn!(name = %name, "Worker state still borrowed, dropping task"),
        }))
    }

    /// Queue a task that runs on the worker thread without borrowing the state
    pub fn post_detached(&self, task: Task) -> PipelineResult<()> {
        self.send(Box::new(move |_: &RefCell<S>| task()))
    }

    /// Run `task` against the worker state and wait for its return value.
    ///
    /// On the worker thread itself the task runs inline, which only works
    /// from a detached task; a task already holding the state gets an error.
    pub fn post_and_wait<R, F>(&self, task: F) -> PipelineResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        if self.is_worker_thread() {
            return self.run_inline(task);
        }

        let (done_tx, done_rx) = mpsc::sync_channel::<R>(1);
        self.post(move |state| {
            let _ = done_tx.send(task(state));
        })?;

        done_rx
            .recv()
            .map_err(|_| PipelineError::ExecutorUnavailable(self.name.clone()))
    }

    fn run_inline<R, F>(&self, task: F) -> PipelineResult<R>
    where
        F: FnOnce(&mut S) -> R,
    {
        let state = WORKER_STATE
            .with(|slot| slot.borrow().clone())
            .and_then(|state| state.downcast::<RefCell<S>>().ok())
            .ok_or_else(|| PipelineError::ExecutorUnavailable(self.name.clone()))?;
        let mut state = state.try_borrow_mut().map_err(|_| {
            PipelineError::Other(format!(
                "Worker '{}' state is borrowed by the running task",
                self.name
            ))
        })?;
        Ok(task(&mut state))
    }

    /// Close the queue and wait for pending tasks to finish
    pub fn stop(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handle = self
            .thread_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        if self.is_worker_thread() {
            // Dropped from one of its own tasks; the thread exits once the
            // queue drains, joining here would deadlock
            debug!(name = %self.name, "Worker stopped from its own thread, detaching");
            return;
        }

        debug!(name = %self.name, "Waiting for worker thread to finish");
        if let Err(e) = handle.join() {
            warn!(name = %self.name, "Worker thread panicked: {:?}", e);
        } else {
            debug!(name = %self.name, "Worker thread finished");
        }
    }
}

impl<S: 'static> Drop for StatefulWorker<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Dedicated thread running posted tasks in order
pub struct WorkerThread {
    worker: StatefulWorker<()>,
}

impl WorkerThread {
    pub fn start(name: &str) -> PipelineResult<Self> {
        Ok(Self {
            worker: StatefulWorker::start_with_init(name, || Ok(()))?,
        })
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn stop(&self) {
        self.worker.stop();
    }
}

impl Executor for WorkerThread {
    fn name(&self) -> &str {
        self.worker.name()
    }

    fn post(&self, task: Task) -> PipelineResult<()> {
        self.worker.post_detached(task)
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        self.worker.is_worker_thread()
    }
}

/// Runs every task immediately on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn name(&self) -> &str {
        "inline"
    }

    fn post(&self, task: Task) -> PipelineResult<()> {
        task();
        Ok(())
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_worker_runs_on_named_thread() {
        let worker = WorkerThread::start("test-worker").unwrap();
        let name = post_and_wait(&worker, || thread::current().name().map(str::to_string)).unwrap();
        assert_eq!(name.as_deref(), Some("test-worker"));
        assert!(!worker.runs_tasks_on_current_thread());
    }

    #[test]
    fn test_tasks_run_in_order() {
        let worker = WorkerThread::start("ordered").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = Arc::clone(&seen);
            worker
                .post(Box::new(move || seen.lock().unwrap().push(i)))
                .unwrap();
        }
        worker.stop();
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_post_after_stop_fails() {
        let worker = WorkerThread::start("stopped").unwrap();
        worker.stop();
        assert!(!worker.is_running());
        assert_eq!(
            worker.post(Box::new(|| {})),
            Err(PipelineError::ExecutorUnavailable("stopped".to_string()))
        );
    }

    #[test]
    fn test_nested_post_and_wait_runs_inline() {
        let worker = Arc::new(WorkerThread::start("nested").unwrap());
        let inner = Arc::clone(&worker);
        let value = post_and_wait(worker.as_ref(), move || {
            post_and_wait(inner.as_ref(), || 7).unwrap()
        })
        .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_stateful_worker_owns_state() {
        let worker = StatefulWorker::start_with_init("counter", || Ok(0usize)).unwrap();
        for _ in 0..3 {
            worker.post(|count| *count += 1).unwrap();
        }
        assert_eq!(worker.post_and_wait(|count| *count).unwrap(), 3);
    }

    #[test]
    fn test_detached_task_reaches_state_inline() {
        let worker = Arc::new(StatefulWorker::start_with_init("shared-state", || Ok(10u32)).unwrap());
        let inner = Arc::clone(&worker);
        let (tx, rx) = mpsc::channel();
        worker
            .post_detached(Box::new(move || {
                let _ = tx.send(inner.post_and_wait(|value| {
                    *value += 1;
                    *value
                }));
            }))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(11));
        assert_eq!(worker.post_and_wait(|value| *value).unwrap(), 11);
    }

    #[test]
    fn test_state_task_cannot_borrow_again() {
        let worker = Arc::new(StatefulWorker::start_with_init("reborrow", || Ok(0u32)).unwrap());
        let inner = Arc::clone(&worker);
        let nested_failed = worker
            .post_and_wait(move |_| inner.post_and_wait(|value| *value).is_err())
            .unwrap();
        assert!(nested_failed, "State is already borrowed by the outer task");
    }

    #[test]
    fn test_failed_init_is_reported() {
        let result = StatefulWorker::<()>::start_with_init("broken", || Err("no device".into()));
        assert!(matches!(result, Err(PipelineError::ExecutorUnavailable(_))));
    }

    #[test]
    fn test_inline_executor() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        InlineExecutor.post(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(InlineExecutor.runs_tasks_on_current_thread());
    }

    #[test]
    fn test_drop_from_own_task_does_not_hang() {
        let worker = Arc::new(WorkerThread::start("self-drop").unwrap());
        let (tx, rx) = mpsc::channel();
        let held = Arc::clone(&worker);
        worker
            .post(Box::new(move || {
                // Last reference dropped on the worker itself
                thread::sleep(Duration::from_millis(20));
                drop(held);
                let _ = tx.send(());
            }))
            .unwrap();
        drop(worker);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
