//! Timeout trackers for the call and attempt scopes.
//!
//! A tracker is armed with a duration and an action. When the duration elapses on the
//! [`TimerService`] the tracker moves `ARMED → FIRED` and runs the action exactly once; a
//! [`TimeoutTracker::cancel`] that gets there first moves it `ARMED → CANCELLED` and the action
//! never runs. Both transitions are a single compare-exchange, so the firing callback and the
//! canceller can race freely: at most one terminal state is ever reached and
//! [`TimeoutTracker::has_fired`] tells the unwinding code whether *this* tracker caused an
//! observed cancellation.
//!
//! Actions are model specific. Blocking drivers signal the scope's [`CancellationToken`];
//! async drivers complete the pending [`crate::completion::Completion`] with a timeout fault.
//!
//! [`FaultSources::resolve`] is the single precedence rule both drivers use when unwinding a
//! fault: call tracker, then caller cancellation, then attempt tracker, then the original fault.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[cfg(loom)]
use loom::sync::atomic::{AtomicU8, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU8, Ordering};

use crate::cancel::CancellationToken;
use crate::error::{SdkError, TransportFaultKind};
use crate::timer::{ScheduledTask, TimerService};

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;
const DISABLED: u8 = 3;

/// Which deadline a tracker enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutScope {
    /// Spans every attempt of the logical call.
    Call,
    /// Spans one physical attempt.
    Attempt,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutScope::Call => f.write_str("call"),
            TimeoutScope::Attempt => f.write_str("attempt"),
        }
    }
}

/// Observable state of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    /// No timeout configured; never fires.
    Disabled,
    Armed,
    Fired,
    Cancelled,
}

#[derive(Debug)]
pub(crate) struct StateCell {
    state: AtomicU8,
}

impl StateCell {
    pub(crate) fn new(armed: bool) -> Self {
        Self { state: AtomicU8::new(if armed { ARMED } else { DISABLED }) }
    }

    pub(crate) fn fire(&self) -> bool {
        self.transition(FIRED)
    }

    pub(crate) fn cancel(&self) -> bool {
        self.transition(CANCELLED)
    }

    fn transition(&self, to: u8) -> bool {
        self.state.compare_exchange(ARMED, to, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub(crate) fn load(&self) -> TrackerState {
        match self.state.load(Ordering::Acquire) {
            ARMED => TrackerState::Armed,
            FIRED => TrackerState::Fired,
            CANCELLED => TrackerState::Cancelled,
            _ => TrackerState::Disabled,
        }
    }
}

/// Read-only view of a tracker, cheap to clone into the execution context.
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    scope: TimeoutScope,
    timeout: Option<Duration>,
    cell: Arc<StateCell>,
}

impl TrackerHandle {
    pub fn scope(&self) -> TimeoutScope {
        self.scope
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn has_fired(&self) -> bool {
        self.cell.load() == TrackerState::Fired
    }

    pub fn state(&self) -> TrackerState {
        self.cell.load()
    }
}

/// One armed (or disabled) deadline.
#[derive(Debug)]
pub struct TimeoutTracker {
    handle: TrackerHandle,
    task: Option<ScheduledTask>,
}

impl TimeoutTracker {
    /// A tracker that never fires.
    pub fn disabled(scope: TimeoutScope) -> Self {
        Self {
            handle: TrackerHandle { scope, timeout: None, cell: Arc::new(StateCell::new(false)) },
            task: None,
        }
    }

    /// Arm a tracker. `None` or a zero duration means "no timeout" and yields a disabled tracker.
    pub fn arm<F>(
        timer: &TimerService,
        scope: TimeoutScope,
        timeout: Option<Duration>,
        on_fire: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let timeout = match timeout {
            Some(duration) if !duration.is_zero() => duration,
            _ => return Self::disabled(scope),
        };
        let cell = Arc::new(StateCell::new(true));
        let firing = cell.clone();
        let task = timer.schedule(timeout, move || {
            if firing.fire() {
                tracing::warn!(
                    scope = %scope,
                    timeout_ms = timeout.as_millis() as u64,
                    "timeout tracker fired"
                );
                on_fire();
            }
        });
        Self { handle: TrackerHandle { scope, timeout: Some(timeout), cell }, task: Some(task) }
    }

    /// Cancel the tracker. Returns `true` only if this call prevented the firing; cancelling a
    /// fired, cancelled or disabled tracker is a no-op returning `false`.
    pub fn cancel(&self) -> bool {
        let won = self.handle.cell.cancel();
        if won {
            if let Some(task) = &self.task {
                task.cancel();
            }
        }
        won
    }

    pub fn has_fired(&self) -> bool {
        self.handle.has_fired()
    }

    pub fn state(&self) -> TrackerState {
        self.handle.state()
    }

    pub fn scope(&self) -> TimeoutScope {
        self.handle.scope
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.handle.timeout
    }

    pub fn handle(&self) -> TrackerHandle {
        self.handle.clone()
    }
}

impl Drop for TimeoutTracker {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Everything that can explain a fault observed while unwinding an attempt.
#[derive(Debug, Clone, Copy)]
pub struct FaultSources<'a> {
    pub call: Option<&'a TrackerHandle>,
    pub caller: Option<&'a CancellationToken>,
    pub attempt: Option<&'a TrackerHandle>,
    /// 1-based attempt in flight when the fault was observed.
    pub attempt_number: u32,
    pub call_elapsed: Duration,
}

impl FaultSources<'_> {
    /// True once the call can no longer produce a result: the call deadline fired or the caller
    /// cancelled.
    pub fn call_is_over(&self) -> bool {
        self.call.map(TrackerHandle::has_fired).unwrap_or(false)
            || self.caller.map(CancellationToken::is_cancelled).unwrap_or(false)
    }

    /// The call-level fault to report if [`FaultSources::call_is_over`].
    pub fn call_level_fault(&self) -> Option<SdkError> {
        if let Some(call) = self.call.filter(|c| c.has_fired()) {
            return Some(SdkError::CallTimeout {
                timeout: call.timeout().unwrap_or_default(),
                elapsed: self.call_elapsed,
                attempts: self.attempt_number,
            });
        }
        if self.caller.map(CancellationToken::is_cancelled).unwrap_or(false) {
            return Some(SdkError::CancelledByCaller);
        }
        None
    }

    /// Attribute `fault` to exactly one cause.
    pub fn resolve(&self, fault: SdkError) -> SdkError {
        if let Some(call_fault) = self.call_level_fault() {
            return call_fault;
        }
        if fault.is_terminal() {
            return fault;
        }
        if let Some(attempt) = self.attempt.filter(|a| a.has_fired()) {
            return SdkError::AttemptTimeout {
                attempt: self.attempt_number,
                timeout: attempt.timeout().unwrap_or_default(),
            };
        }
        match &fault {
            SdkError::Transport(t) if t.kind() == TransportFaultKind::Cancelled => {
                // Cancelled by nobody we track: surface it instead of retrying over it.
                SdkError::Interrupted
            }
            _ => fault,
        }
    }
}
