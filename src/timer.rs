//! Timer service: delayed callbacks on a bounded worker pool.
//!
//! Both timeout trackers and the async backoff path schedule through a [`TimerService`]. Two
//! flavors share one API:
//!
//! - [`TimerService::dedicated`] owns a small multi-thread tokio runtime whose workers only run
//!   timer callbacks. Blocking clients use this; the calling thread never needs a runtime.
//! - [`TimerService::from_handle`] / [`TimerService::current`] borrow an existing runtime, which
//!   async clients use so that timers share the runtime (and its paused clock in tests).
//!
//! Callbacks run on a timer worker thread and must not block.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;

use crate::error::BuildError;

/// Runtime owned by a dedicated timer service.
struct OwnedRuntime {
    runtime: Option<Runtime>,
}

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        // Dropping a runtime blocks; shutting down in the background is safe from any context,
        // including an async task that happens to own the last client handle.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Schedules callbacks after a delay.
#[derive(Clone)]
pub struct TimerService {
    handle: Handle,
    _owned: Option<Arc<OwnedRuntime>>,
    workers: usize,
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService")
            .field("dedicated", &self._owned.is_some())
            .field("workers", &self.workers)
            .finish()
    }
}

impl TimerService {
    /// Start a dedicated pool with `workers` threads.
    pub fn dedicated(workers: usize) -> Result<Self, BuildError> {
        if workers == 0 {
            return Err(BuildError::InvalidWorkerCount(workers));
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("callguard-timer")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            handle,
            _owned: Some(Arc::new(OwnedRuntime { runtime: Some(runtime) })),
            workers,
        })
    }

    /// Schedule on an existing runtime.
    pub fn from_handle(handle: Handle) -> Self {
        Self { handle, _owned: None, workers: 0 }
    }

    /// Schedule on the runtime the caller is running in.
    pub fn current() -> Result<Self, BuildError> {
        Handle::try_current().map(Self::from_handle).map_err(|_| BuildError::NoRuntime)
    }

    /// Runtime the callbacks run on.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `callback` once `delay` has elapsed, unless the returned task is cancelled first.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        tracing::trace!(delay_ms = delay.as_millis() as u64, "timer scheduled");
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        ScheduledTask { join }
    }
}

/// Handle to a scheduled callback.
#[derive(Debug)]
pub struct ScheduledTask {
    join: JoinHandle<()>,
}

impl ScheduledTask {
    /// Stop the callback from running if it has not started yet.
    pub fn cancel(&self) {
        tracing::trace!("timer cancelled");
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
