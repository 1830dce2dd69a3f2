// SPDX-License-Identifier: GPL-3.0-only

//! Buffer synchronization fences
//!
//! A fence is split into two owning halves: the [`Fence`] held by whoever must
//! wait before touching the buffer, and the [`FenceSignaler`] held by the
//! producer. Both halves release their reference exactly once, on drop. A
//! signaler dropped without signaling marks the fence as failed so waiters
//! never hang on a producer that went away.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use tracing::warn;

use crate::errors::{PipelineError, PipelineResult};

/// Observable fence state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// Producer still working
    Pending,
    /// Buffer is ready
    Signaled,
    /// Producer gave up; buffer contents are undefined
    Error,
}

#[derive(Debug)]
struct SyncPoint {
    state: Mutex<FenceStatus>,
    cond: Condvar,
}

impl SyncPoint {
    fn new(status: FenceStatus) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(status),
            cond: Condvar::new(),
        })
    }

    fn status(&self) -> FenceStatus {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, status: FenceStatus) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == FenceStatus::Pending {
            *state = status;
            self.cond.notify_all();
        }
    }
}

/// Waiting half of a fence
#[derive(Debug)]
pub struct Fence {
    point: Arc<SyncPoint>,
}

impl Fence {
    /// Create a pending fence and the signaler that completes it
    pub fn pair() -> (Fence, FenceSignaler) {
        let point = SyncPoint::new(FenceStatus::Pending);
        (
            Fence {
                point: Arc::clone(&point),
            },
            FenceSignaler { point: Some(point) },
        )
    }

    /// A fence that is already signaled
    pub fn signaled() -> Fence {
        Fence {
            point: SyncPoint::new(FenceStatus::Signaled),
        }
    }

    pub fn status(&self) -> FenceStatus {
        self.point.status()
    }

    pub fn is_signaled(&self) -> bool {
        self.status() == FenceStatus::Signaled
    }

    /// Block until the fence leaves the pending state or `timeout` expires
    pub fn wait(&self, timeout: Duration) -> PipelineResult<()> {
        let state = self
            .point
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (state, _) = self
            .point
            .cond
            .wait_timeout_while(state, timeout, |s| *s == FenceStatus::Pending)
            .unwrap_or_else(PoisonError::into_inner);

        match *state {
            FenceStatus::Signaled => Ok(()),
            FenceStatus::Pending => Err(PipelineError::FenceTimeout),
            FenceStatus::Error => Err(PipelineError::Other(
                "fence completed with an error".to_string(),
            )),
        }
    }
}

/// Producing half of a fence
#[derive(Debug)]
pub struct FenceSignaler {
    point: Option<Arc<SyncPoint>>,
}

impl FenceSignaler {
    /// Mark the buffer as ready
    pub fn signal(mut self) {
        if let Some(point) = self.point.take() {
            point.complete(FenceStatus::Signaled);
        }
    }

    /// Mark the buffer as failed
    pub fn signal_error(mut self) {
        if let Some(point) = self.point.take() {
            point.complete(FenceStatus::Error);
        }
    }
}

impl Drop for FenceSignaler {
    fn drop(&mut self) {
        if let Some(point) = self.point.take() {
            warn!("Fence signaler dropped without signaling, marking fence as failed");
            point.complete(FenceStatus::Error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_signal_from_other_thread() {
        let (fence, signaler) = Fence::pair();
        assert_eq!(fence.status(), FenceStatus::Pending);

        let producer = thread::spawn(move || signaler.signal());
        assert!(fence.wait(Duration::from_secs(5)).is_ok());
        producer.join().unwrap();
        assert!(fence.is_signaled());
    }

    #[test]
    fn test_wait_times_out() {
        let (fence, _signaler) = Fence::pair();
        assert_eq!(
            fence.wait(Duration::from_millis(10)),
            Err(PipelineError::FenceTimeout)
        );
    }

    #[test]
    fn test_dropped_signaler_fails_fence() {
        let (fence, signaler) = Fence::pair();
        drop(signaler);
        assert_eq!(fence.status(), FenceStatus::Error);
        assert!(fence.wait(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_first_completion_wins() {
        let (fence, signaler) = Fence::pair();
        signaler.signal();
        assert!(fence.is_signaled());
        assert!(Fence::signaled().wait(Duration::ZERO).is_ok());
    }
}
